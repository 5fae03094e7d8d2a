use std::sync::Arc;

use common::float_ext::FloatExt;
use common::log_setup::setup_test_logging;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;
use crate::estimator::{estimate_light_curve, folded_phase_distance, phase};
use crate::grid::FrequencyGrid;
use crate::light_curve::LightCurve;
use crate::statistic::MAX_GPU_BINS;

fn engine() -> Option<PdmEngine> {
    setup_test_logging();
    match PdmEngine::new() {
        Ok(engine) => Some(engine),
        Err(e) => {
            eprintln!("No GPU available, skipping: {e}");
            None
        }
    }
}

/// Irregularly sampled noisy sinusoid over a 100 day baseline.
fn noisy_sinusoid(rng: &mut StdRng, n: usize, freq: f64) -> LightCurve {
    let mut times: Vec<f64> = (0..n).map(|_| rng.random_range(0.0..100.0)).collect();
    times.sort_by(f64::total_cmp);
    let phase: f64 = rng.random_range(0.0..1.0);
    let values = times
        .iter()
        .map(|&t| {
            (std::f64::consts::TAU * (freq * t + phase)).sin() + 0.3 * rng.random_range(-1.0..1.0)
        })
        .collect();
    let uncertainties = (0..n).map(|_| rng.random_range(0.1..0.5)).collect();
    LightCurve::new(times, values, uncertainties).unwrap()
}

fn grid(nf: usize) -> FrequencyGrid {
    FrequencyGrid::linear(0.01, 3.0 / nf as f64, nf).unwrap()
}

/// Phase margin within which single precision may put a point on the
/// other side of a window or bin edge.
const EDGE_MARGIN: f64 = 1e-5;

/// Whether some point sits within [`EDGE_MARGIN`] of an edge of `statistic`
/// at `freq`, where the device and the reference may legitimately disagree.
fn near_edge(times: &[f64], freq: f64, statistic: &Statistic) -> bool {
    match *statistic {
        Statistic::Tophat { dphi } => times.iter().enumerate().any(|(i, &ti)| {
            times[i + 1..]
                .iter()
                .any(|&tj| (folded_phase_distance(tj - ti, freq) - dphi).abs() < EDGE_MARGIN)
        }),
        Statistic::GaussWindow { .. } => false,
        Statistic::Binned { nbins, linterp } => {
            // Interpolation also switches neighbours at bin centres.
            let scale = if linterp { 2.0 } else { 1.0 } * nbins as f64;
            times.iter().any(|&t| {
                let x = phase(t, freq) * scale;
                (x - x.round()).abs() < EDGE_MARGIN * scale
            })
        }
    }
}

/// Every entry agrees with the reference within 1e-4 relative, or lies at
/// a frequency where a point is on an edge.
fn assert_agrees_with_reference(job: &Job, power: &[f64], statistic: &Statistic) {
    let reference = estimate_light_curve(job.curve(), job.grid(), statistic).unwrap();
    assert_eq!(power.len(), reference.len());

    let mut on_edge = 0;
    for (i, (g, r)) in power.iter().zip(reference.iter()).enumerate() {
        if g.relative_eq(*r, 1e-4) {
            continue;
        }
        let freq = job.grid()[i];
        assert!(
            near_edge(job.curve().times(), freq, statistic),
            "{statistic:?} N={} f={freq}: device {g}, reference {r}",
            job.curve().len()
        );
        on_edge += 1;
    }
    tracing::debug!(?statistic, on_edge, total = power.len(), "compared with reference");
}

fn run_one(engine: &mut PdmEngine, job: &Job, statistic: &Statistic) -> PowerSeries {
    let pending = engine
        .run(std::slice::from_ref(job), None, statistic)
        .unwrap();
    let mut drained = engine.finish().unwrap();
    let mut outputs: Vec<_> = pending
        .into_iter()
        .map(|handle| drained.take(handle).unwrap())
        .collect();
    outputs.remove(0).power
}

fn assert_matches_reference(engine: &mut PdmEngine, n: usize, nf: usize, statistic: Statistic) {
    let mut rng = StdRng::seed_from_u64((n * 31 + nf) as u64);
    let job = Job::new(noisy_sinusoid(&mut rng, n, 0.37), grid(nf));

    let power = run_one(engine, &job, &statistic);
    assert_eq!(power.len(), nf);
    assert_agrees_with_reference(&job, &power, &statistic);
}

#[test]
fn test_tophat_matches_reference() {
    let Some(mut engine) = engine() else { return };
    for (n, nf) in [(10, 1), (10, 5000), (1000, 1), (1000, 64)] {
        assert_matches_reference(&mut engine, n, nf, Statistic::tophat(0.1));
    }
}

#[test]
fn test_gauss_matches_reference() {
    let Some(mut engine) = engine() else { return };
    for (n, nf) in [(10, 1), (10, 5000), (1000, 1), (1000, 64)] {
        assert_matches_reference(&mut engine, n, nf, Statistic::gauss(0.05));
    }
}

#[test]
fn test_binned_matches_reference() {
    let Some(mut engine) = engine() else { return };
    for (n, nf) in [(10, 1), (10, 5000), (1000, 1), (1000, 5000)] {
        assert_matches_reference(&mut engine, n, nf, Statistic::binned(8));
        assert_matches_reference(&mut engine, n, nf, Statistic::binned_linterp(20));
    }
}

#[test]
fn test_constant_curve_is_non_finite() {
    let Some(mut engine) = engine() else { return };
    let curve =
        LightCurve::with_uniform_uncertainty(vec![0.0, 1.3, 2.2, 5.9, 7.1], vec![3.0; 5], 0.2)
            .unwrap();
    let job = Job::new(curve, grid(100));
    for statistic in [
        Statistic::tophat(0.1),
        Statistic::gauss(0.1),
        Statistic::binned_linterp(5),
    ] {
        let power = run_one(&mut engine, &job, &statistic);
        assert_eq!(power.non_finite_count(), 100, "{statistic:?}");
    }
}

#[test]
fn test_square_wave_prefers_matching_period() {
    let Some(mut engine) = engine() else { return };
    let curve = LightCurve::with_uniform_uncertainty(
        vec![0.0, 0.25, 0.5, 0.75],
        vec![1.0, -1.0, 1.0, -1.0],
        1.0,
    )
    .unwrap();
    let job = Job::new(curve, FrequencyGrid::new(vec![0.37, 1.0]).unwrap());

    for statistic in [Statistic::tophat(0.1), Statistic::binned(4)] {
        let power = run_one(&mut engine, &job, &statistic);
        assert!(power[1] > power[0], "{statistic:?}: {:?}", power.as_slice());
    }
}

#[test]
fn test_prepare_is_idempotent() {
    let Some(mut engine) = engine() else { return };
    assert!(engine.prepared().is_empty());

    engine.prepare(KernelVariant::Tophat).unwrap();
    engine.prepare(KernelVariant::Tophat).unwrap();
    assert_eq!(engine.prepared(), vec![KernelVariant::Tophat]);

    engine.prepare(KernelVariant::BinnedInterp).unwrap();
    assert_eq!(engine.prepared().len(), 2);
}

#[test]
fn test_invalid_statistic_rejected_before_enqueue() {
    let Some(mut engine) = engine() else { return };
    let mut rng = StdRng::seed_from_u64(1);
    let jobs = vec![Job::new(noisy_sinusoid(&mut rng, 20, 0.5), grid(10))];

    let err = engine
        .run(&jobs, None, &Statistic::binned(MAX_GPU_BINS + 1))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    let err = engine.run(&jobs, None, &Statistic::tophat(0.7)).unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    assert_eq!(engine.in_flight(), 0);
    assert_eq!(engine.stream_count(), 0);
}

#[test]
fn test_mismatched_buffers_rejected_before_enqueue() {
    let Some(mut engine) = engine() else { return };
    let mut rng = StdRng::seed_from_u64(2);
    let small = Job::new(noisy_sinusoid(&mut rng, 20, 0.5), grid(10));
    let large = Job::new(noisy_sinusoid(&mut rng, 40, 0.5), grid(10));

    let buffers = engine.allocate(std::slice::from_ref(&small)).unwrap();
    let err = engine
        .run(std::slice::from_ref(&large), Some(buffers), &Statistic::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let buffers = engine.allocate(std::slice::from_ref(&small)).unwrap();
    let err = engine
        .run(&[small.clone(), small], Some(buffers), &Statistic::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    assert_eq!(engine.in_flight(), 0);
}

#[test]
fn test_pool_grows_across_runs_before_finish() {
    let Some(mut engine) = engine() else { return };
    let mut rng = StdRng::seed_from_u64(3);
    let statistic = Statistic::binned_linterp(10);
    let shared_grid = Arc::new(grid(256));

    let jobs: Vec<Job> = (0..5)
        .map(|i| {
            Job::new(
                noisy_sinusoid(&mut rng, 50 + 10 * i, 0.2 + 0.1 * i as f64),
                Arc::clone(&shared_grid),
            )
        })
        .collect();

    let first = engine.run(&jobs[..2], None, &statistic).unwrap();
    assert_eq!(engine.stream_count(), 2);
    let second = engine.run(&jobs[2..], None, &statistic).unwrap();
    assert_eq!(engine.stream_count(), 5);
    assert_eq!(engine.in_flight(), 5);

    let mut drained = engine.finish().unwrap();
    assert_eq!(drained.len(), 5);
    assert_eq!(engine.in_flight(), 0);

    for (handle, job) in first.into_iter().chain(second).zip(&jobs) {
        let output = drained.take(handle).unwrap();
        assert_agrees_with_reference(job, &output.power, &statistic);
    }
    assert!(drained.is_empty());

    // Slots are reused after a drain, the pool does not shrink.
    engine.run(&jobs[..1], None, &statistic).unwrap();
    assert_eq!(engine.stream_count(), 5);
    engine.finish().unwrap();
}

#[test]
fn test_pool_grows_after_drain() {
    let Some(mut engine) = engine() else { return };
    let mut rng = StdRng::seed_from_u64(8);
    let statistic = Statistic::tophat(0.1);
    let shared_grid = Arc::new(grid(300));
    let jobs: Vec<Job> = (0..5)
        .map(|i| {
            Job::new(
                noisy_sinusoid(&mut rng, 40 + 5 * i, 0.3 + 0.05 * i as f64),
                Arc::clone(&shared_grid),
            )
        })
        .collect();

    let pending = engine.run(&jobs[..2], None, &statistic).unwrap();
    assert_eq!(engine.stream_count(), 2);
    let mut drained = engine.finish().unwrap();
    for (handle, job) in pending.into_iter().zip(&jobs) {
        let output = drained.take(handle).unwrap();
        assert_agrees_with_reference(job, &output.power, &statistic);
    }
    assert_eq!(engine.stream_pool.in_use(), 0);

    let pending = engine.run(&jobs, None, &statistic).unwrap();
    assert_eq!(engine.stream_count(), 5);
    // Slots 0 and 1 are reused, 2..5 are new, each tagged with its job.
    let tags: Vec<_> = engine.stream_pool.iter().map(|s| (s.index(), s.job())).collect();
    assert_eq!(
        tags,
        vec![(0, Some(0)), (1, Some(1)), (2, Some(2)), (3, Some(3)), (4, Some(4))]
    );
    assert!(engine.stream_pool.iter().all(|s| s.last_submission().is_some()));

    let mut drained = engine.finish().unwrap();
    assert_eq!(drained.len(), 5);
    for (handle, job) in pending.into_iter().zip(&jobs) {
        let output = drained.take(handle).unwrap();
        assert_eq!(output.power.len(), 300);
        assert_eq!(output.power.non_finite_count(), 0);
        assert_agrees_with_reference(job, &output.power, &statistic);
    }
    assert_eq!(engine.stream_pool.in_use(), 0);
}

#[test]
fn test_oversized_grid_rejected_before_enqueue() {
    let Some(mut engine) = engine() else { return };
    let max_workgroups = engine.gpu().device().limits().max_compute_workgroups_per_dimension;
    let nf = max_workgroups as usize * WORKGROUP_SIZE as usize + 1;
    if nf > 1 << 24 {
        eprintln!("Workgroup limit {max_workgroups} too large to exceed in a test, skipping");
        return;
    }

    let mut rng = StdRng::seed_from_u64(9);
    let small = Job::new(noisy_sinusoid(&mut rng, 8, 0.5), grid(16));
    let huge = Job::new(
        noisy_sinusoid(&mut rng, 2, 0.5),
        FrequencyGrid::linear(0.01, 1e-7, nf).unwrap(),
    );
    let buffers = engine.allocate(std::slice::from_ref(&small)).unwrap();

    let err = engine
        .run(&[small.clone(), huge], Some(buffers), &Statistic::tophat(0.1))
        .unwrap_err();
    assert!(
        matches!(err, Error::InvalidInput(ref msg) if msg.contains("workgroups")),
        "{err}"
    );
    assert_eq!(engine.in_flight(), 0);
    assert_eq!(engine.stream_count(), 0);

    let returned = engine.reclaim_buffers();
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0].shape(), small.shape());
    assert!(engine.reclaim_buffers().is_empty());

    // The returned set still runs.
    let handle = engine
        .run(std::slice::from_ref(&small), Some(returned), &Statistic::tophat(0.1))
        .unwrap()
        .remove(0);
    let mut drained = engine.finish().unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained.take(handle).unwrap().power.len(), 16);
}

#[test]
fn test_failed_batch_submits_nothing() {
    let Some(mut engine) = engine() else { return };
    let mut rng = StdRng::seed_from_u64(10);
    let statistic = Statistic::gauss(0.1);
    let jobs: Vec<Job> = (0..3)
        .map(|_| Job::new(noisy_sinusoid(&mut rng, 20, 0.5), grid(32)))
        .collect();
    let buffers = engine.allocate(&jobs).unwrap();

    // Slot 1 still serves a job the batch does not own.
    engine.ensure_capacity(2);
    engine.stream_pool.acquire(1, 99).unwrap();

    let err = engine.run(&jobs, Some(buffers), &statistic).unwrap_err();
    assert!(matches!(err, Error::KernelDispatch { job: Some(1), .. }), "{err}");
    assert_eq!(engine.in_flight(), 0);
    assert_eq!(engine.stream_pool.in_use(), 1);
    assert_eq!(engine.stream_pool.iter().nth(1).unwrap().job(), Some(99));

    let returned = engine.reclaim_buffers();
    assert_eq!(returned.len(), 3);
    assert!(engine.finish().unwrap().is_empty());

    // The drain cleared the foreign tag; the same buffers run cleanly.
    let pending = engine.run(&jobs, Some(returned), &statistic).unwrap();
    let mut drained = engine.finish().unwrap();
    for (handle, job) in pending.into_iter().zip(&jobs) {
        let output = drained.take(handle).unwrap();
        assert_agrees_with_reference(job, &output.power, &statistic);
    }
    assert_eq!(engine.gpu().take_fault(), None);
}

#[test]
fn test_buffer_reuse_uploads_new_grid() {
    let Some(mut engine) = engine() else { return };
    let mut rng = StdRng::seed_from_u64(4);
    let curve = Arc::new(noisy_sinusoid(&mut rng, 64, 0.8));
    let statistic = Statistic::tophat(0.05);

    let first = Job::new(Arc::clone(&curve), FrequencyGrid::linear(0.1, 0.01, 200).unwrap());
    let handle = engine
        .run(std::slice::from_ref(&first), None, &statistic)
        .unwrap()
        .remove(0);
    let output = engine.finish().unwrap().take(handle).unwrap();
    assert_eq!(output.buffers.shape(), (64, 200));

    // Same shape, different frequencies.
    let second = Job::new(curve, FrequencyGrid::linear(0.7, 0.001, 200).unwrap());
    let handle = engine
        .run(std::slice::from_ref(&second), Some(vec![output.buffers]), &statistic)
        .unwrap()
        .remove(0);
    let output = engine.finish().unwrap().take(handle).unwrap();

    assert_agrees_with_reference(&second, &output.power, &statistic);
    assert_eq!(engine.gpu().take_fault(), None);
}

#[test]
fn test_handle_from_another_drain_is_rejected() {
    let Some(mut engine) = engine() else { return };
    let mut rng = StdRng::seed_from_u64(5);
    let job = Job::new(noisy_sinusoid(&mut rng, 16, 0.5), grid(32));
    let statistic = Statistic::gauss(0.1);

    let early = engine
        .run(std::slice::from_ref(&job), None, &statistic)
        .unwrap()
        .remove(0);
    let _first = engine.finish().unwrap();

    engine.run(std::slice::from_ref(&job), None, &statistic).unwrap();
    let mut second = engine.finish().unwrap();
    assert!(matches!(second.take(early), Err(Error::InvalidInput(_))));
}

#[test]
fn test_empty_batch() {
    let Some(mut engine) = engine() else { return };
    let pending = engine.run(&[], None, &Statistic::default()).unwrap();
    assert!(pending.is_empty());
    assert!(engine.finish().unwrap().is_empty());
    assert_eq!(engine.stream_count(), 0);
}

#[test]
fn test_handles_follow_job_order() {
    let Some(mut engine) = engine() else { return };
    let mut rng = StdRng::seed_from_u64(6);
    let jobs: Vec<Job> = (0..3)
        .map(|i| Job::new(noisy_sinusoid(&mut rng, 30, 0.5), grid(16 + i)))
        .collect();

    let pending = engine.run(&jobs, None, &Statistic::tophat(0.1)).unwrap();
    let order: Vec<_> = pending.iter().map(PendingPower::job).collect();
    assert_eq!(order, vec![0, 1, 2]);

    let mut drained = engine.finish().unwrap();
    for (handle, job) in pending.into_iter().zip(&jobs) {
        let output = drained.take(handle).unwrap();
        assert_eq!(output.power.len(), job.grid().len());
    }
}

#[test]
fn test_shutdown_with_undrained_work() {
    let Some(mut engine) = engine() else { return };
    let mut rng = StdRng::seed_from_u64(7);
    let jobs = vec![Job::new(noisy_sinusoid(&mut rng, 30, 0.5), grid(64))];

    engine.run(&jobs, None, &Statistic::default()).unwrap();
    engine.shutdown().unwrap();
    assert_eq!(engine.in_flight(), 0);
    assert_eq!(engine.stream_count(), 0);
    assert!(engine.prepared().is_empty());

    // Usable again after shutdown.
    engine.run(&jobs, None, &Statistic::default()).unwrap();
    assert_eq!(engine.finish().unwrap().len(), 1);
}
