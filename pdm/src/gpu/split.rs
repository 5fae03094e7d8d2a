//! Split-float encoding of `f64` time stamps and frequencies.
//!
//! The kernels run in single precision, where `t·f` for long baselines loses
//! most of its fractional part. Each value is uploaded as `(hi, lo)` with
//! `hi` truncated to 12 significant bits, so `hi·hi` products are exact in
//! `f32` and only the small cross terms carry rounding error.
//!
//! The cross terms are about `2^-12·|t·f|` and round to `2^-24` of that, so
//! the phase error grows as roughly `|t|·|f|·2^-36`, on top of a constant
//! `~2^-22` from summing the fractional parts. For `t·f` up to `~1e4` that
//! stays near `1e-7`; Julian-date stamps (`t ≈ 2.4e6`) at a few cycles per
//! day drift to `1e-5..1e-4`, so such curves should be shifted to a nearby
//! epoch first.

/// Clears the low 12 mantissa bits, leaving 12 significant bits.
const HI_MASK: u32 = 0xFFFF_F000;

/// `(hi, lo)` with `hi + lo ≈ x` and `hi` exactly representable in 12 bits.
#[inline]
pub fn split_f64(x: f64) -> [f32; 2] {
    let hi = f32::from_bits((x as f32).to_bits() & HI_MASK);
    let lo = (x - hi as f64) as f32;
    [hi, lo]
}

pub fn split_all(xs: &[f64]) -> Vec<[f32; 2]> {
    xs.iter().map(|&x| split_f64(x)).collect()
}

/// Host model of the kernel's phase evaluation, `frac(t·f)` from split parts.
#[inline]
pub fn split_phase(t: [f32; 2], f: [f32; 2]) -> f32 {
    let p = fract(t[0] * f[0]) + fract(t[0] * f[1]) + fract(t[1] * f[0]) + t[1] * f[1];
    fract(p)
}

#[inline]
fn fract(x: f32) -> f32 {
    x - x.floor()
}
