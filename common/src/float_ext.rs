pub trait FloatExt: Copy {
    fn approximately_eq(self, other: Self) -> bool;

    /// Compares with a tolerance relative to the larger magnitude.
    ///
    /// Non-finite values are equal only when they are the same kind of
    /// non-finite (both NaN, or the same infinity).
    fn relative_eq(self, other: Self, tolerance: Self) -> bool;
}

impl FloatExt for f32 {
    fn approximately_eq(self, other: Self) -> bool {
        (self - other).abs() < crate::EPSILON as f32
    }

    fn relative_eq(self, other: Self, tolerance: Self) -> bool {
        if !self.is_finite() || !other.is_finite() {
            return (self.is_nan() && other.is_nan()) || self == other;
        }
        let scale = self.abs().max(other.abs()).max(f32::MIN_POSITIVE);
        (self - other).abs() <= tolerance * scale
    }
}

impl FloatExt for f64 {
    fn approximately_eq(self, other: Self) -> bool {
        (self - other).abs() < crate::EPSILON
    }

    fn relative_eq(self, other: Self, tolerance: Self) -> bool {
        if !self.is_finite() || !other.is_finite() {
            return (self.is_nan() && other.is_nan()) || self == other;
        }
        let scale = self.abs().max(other.abs()).max(f64::MIN_POSITIVE);
        (self - other).abs() <= tolerance * scale
    }
}
