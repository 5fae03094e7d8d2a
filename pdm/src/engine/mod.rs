//! Batched asynchronous execution of PDM jobs on the GPU.
//!
//! Each job of a batch gets its own buffer set and stream slot. [`PdmEngine::run`]
//! uploads the inputs, dispatches the kernel and queues the readback copy for
//! every job without waiting on the device. [`PdmEngine::finish`] is the only
//! synchronization point: it waits for all streams, maps every readback buffer
//! and returns a [`Drained`] collection from which each [`PendingPower`]
//! handle is redeemed once.
//!
//! ```ignore
//! let mut engine = PdmEngine::new()?;
//! let statistic = Statistic::binned_linterp(30);
//! engine.prepare(statistic.variant())?;
//! let pending = engine.run(jobs, None, &statistic)?;
//! let mut drained = engine.finish()?;
//! for handle in pending {
//!     let output = drained.take(handle)?;
//!     println!("{:?}", output.power.peak(&grid));
//! }
//! ```

#[cfg(test)]
mod tests;

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use strum::IntoEnumIterator;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::estimator::PhaseVarianceEstimator;
use crate::gpu::{Gpu, GpuParams, PdmKernels, WORKGROUP_SIZE, split_all, workgroup_count};
use crate::job::{Job, PowerSeries};
use crate::light_curve::weighted_stats;
use crate::pool::{BufferSet, ExecutionStreamPool, JobBufferPool};
use crate::statistic::{KernelVariant, Statistic};

type MapResult = Arc<Mutex<Option<std::result::Result<(), wgpu::BufferAsyncError>>>>;

/// Handle to one job's power series, redeemable after [`PdmEngine::finish`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct PendingPower {
    id: u64,
    job: usize,
}

impl PendingPower {
    /// Position of the job within the batch it was submitted with.
    pub fn job(&self) -> usize {
        self.job
    }
}

/// A finished job: its power series and the buffers it ran on.
#[derive(Debug)]
pub struct JobOutput {
    pub power: PowerSeries,
    pub buffers: BufferSet,
}

/// Results of every job drained by one [`PdmEngine::finish`].
#[derive(Debug, Default)]
pub struct Drained {
    outputs: HashMap<u64, Result<JobOutput>>,
}

impl Drained {
    /// Redeems a handle. Each handle can be taken once.
    pub fn take(&mut self, handle: PendingPower) -> Result<JobOutput> {
        self.outputs.remove(&handle.id).ok_or_else(|| {
            Error::invalid(format!(
                "handle for job {} is not part of this drain",
                handle.job
            ))
        })?
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// A batch that failed before submission, with the buffers it was given.
struct Rejected {
    error: Error,
    buffers: Vec<BufferSet>,
}

impl Rejected {
    fn with(error: Error, buffers: Option<Vec<BufferSet>>) -> Self {
        Self {
            error,
            buffers: buffers.unwrap_or_default(),
        }
    }
}

#[derive(Debug)]
struct InFlight {
    id: u64,
    job: usize,
    buffers: BufferSet,
}

/// Batched periodogram engine over one GPU device.
///
/// Pools and compiled kernels live as long as the engine; all methods take
/// `&mut self`, so a single control thread drives it.
#[derive(Debug)]
pub struct PdmEngine {
    gpu: Gpu,
    config: EngineConfig,
    kernels: Option<PdmKernels>,
    buffer_pool: JobBufferPool,
    stream_pool: ExecutionStreamPool,
    in_flight: Vec<InFlight>,
    returned: Vec<BufferSet>,
    next_id: u64,
}

impl PdmEngine {
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let gpu = Gpu::with_config(&config)?;
        Ok(Self::with_gpu(gpu, config))
    }

    pub fn with_gpu(gpu: Gpu, config: EngineConfig) -> Self {
        Self {
            gpu,
            config,
            kernels: None,
            buffer_pool: JobBufferPool::default(),
            stream_pool: ExecutionStreamPool::default(),
            in_flight: Vec::new(),
            returned: Vec::new(),
            next_id: 0,
        }
    }

    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compiles the kernel for `variant`. Repeated calls are no-ops.
    pub fn prepare(&mut self, variant: KernelVariant) -> Result<()> {
        let kernels = match &mut self.kernels {
            Some(kernels) => kernels,
            empty => empty.insert(PdmKernels::new(&self.gpu)?),
        };
        kernels.prepare(&self.gpu, variant)?;
        Ok(())
    }

    /// Variants compiled so far.
    pub fn prepared(&self) -> Vec<KernelVariant> {
        self.kernels.as_ref().map_or_else(Vec::new, |kernels| {
            KernelVariant::iter()
                .filter(|v| kernels.is_prepared(*v))
                .collect()
        })
    }

    pub fn stream_count(&self) -> usize {
        self.stream_pool.len()
    }

    /// Jobs submitted and not yet drained.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn ensure_capacity(&mut self, n: usize) {
        self.stream_pool.ensure_capacity(n);
    }

    /// Allocates one buffer set per job.
    pub fn allocate(&mut self, jobs: &[Job]) -> Result<Vec<BufferSet>> {
        self.buffer_pool.allocate(&self.gpu, jobs)
    }

    /// A reference estimator with this engine's degenerate threshold.
    pub fn reference_estimator(&self, statistic: Statistic) -> PhaseVarianceEstimator {
        PhaseVarianceEstimator::new(statistic)
            .degenerate_skip_threshold(self.config.degenerate_skip_threshold)
    }

    /// Enqueues every job and returns one handle per job, in job order.
    ///
    /// Inputs are validated and every job's commands are encoded before
    /// anything is submitted, so a failed run enqueues nothing. Supplied
    /// `buffers` must match the jobs one to one in shape; after a failure
    /// they are kept for [`PdmEngine::reclaim_buffers`]. Nothing here waits
    /// on the device.
    pub fn run(
        &mut self,
        jobs: &[Job],
        buffers: Option<Vec<BufferSet>>,
        statistic: &Statistic,
    ) -> Result<Vec<PendingPower>> {
        match self.submit_batch(jobs, buffers, statistic) {
            Ok(pending) => Ok(pending),
            Err(Rejected { error, buffers }) => {
                tracing::warn!(%error, returned = buffers.len(), "batch rejected");
                self.returned.extend(buffers);
                Err(error)
            }
        }
    }

    /// Buffer sets handed back by runs that failed before submission.
    pub fn reclaim_buffers(&mut self) -> Vec<BufferSet> {
        std::mem::take(&mut self.returned)
    }

    fn validate_batch(
        &self,
        jobs: &[Job],
        buffers: Option<&[BufferSet]>,
        statistic: &Statistic,
    ) -> Result<()> {
        statistic.validate_for_gpu()?;
        let max_workgroups = self.gpu.device().limits().max_compute_workgroups_per_dimension;
        for (k, job) in jobs.iter().enumerate() {
            let (n, nf) = job.shape();
            if n > u32::MAX as usize {
                return Err(Error::invalid(format!(
                    "job {k} has {n} points, more than the kernel can index"
                )));
            }
            let workgroups = (nf as u64).div_ceil(WORKGROUP_SIZE as u64);
            if workgroups > max_workgroups as u64 {
                return Err(Error::invalid(format!(
                    "job {k} has {nf} frequencies, needing {workgroups} workgroups, device limit is {max_workgroups}"
                )));
            }
        }
        if let Some(buffers) = buffers {
            self.buffer_pool.check(jobs, buffers)?;
        }
        Ok(())
    }

    fn submit_batch(
        &mut self,
        jobs: &[Job],
        buffers: Option<Vec<BufferSet>>,
        statistic: &Statistic,
    ) -> std::result::Result<Vec<PendingPower>, Rejected> {
        if let Err(error) = self.validate_batch(jobs, buffers.as_deref(), statistic) {
            return Err(Rejected::with(error, buffers));
        }
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let variant = statistic.variant();
        if let Err(error) = self.prepare(variant) {
            return Err(Rejected::with(error, buffers));
        }

        let buffers = match buffers {
            Some(buffers) => buffers,
            None => self.allocate(jobs).map_err(|error| Rejected::with(error, None))?,
        };

        let base = self.in_flight.len();
        self.stream_pool.ensure_capacity(base + jobs.len());

        let commands = match self.encode_batch(jobs, &buffers, base, variant) {
            Ok(commands) => commands,
            Err(error) => return Err(Rejected { error, buffers }),
        };

        let mut pending = Vec::with_capacity(jobs.len());
        for (k, ((job, set), commands)) in jobs.iter().zip(buffers).zip(commands).enumerate() {
            upload(&self.gpu, job, &set, statistic);
            let submission = self.gpu.queue().submit(std::iter::once(commands));
            self.stream_pool.record_submission(base + k, submission);

            let id = self.next_id;
            self.next_id += 1;
            self.in_flight.push(InFlight {
                id,
                job: k,
                buffers: set,
            });
            pending.push(PendingPower { id, job: k });
        }

        tracing::info!(
            jobs = jobs.len(),
            %variant,
            in_flight = self.in_flight.len(),
            streams = self.stream_pool.len(),
            "submitted batch"
        );

        Ok(pending)
    }

    /// Tags a stream per job and encodes its dispatch and readback copy.
    /// On failure the tags taken here are released again.
    fn encode_batch(
        &mut self,
        jobs: &[Job],
        buffers: &[BufferSet],
        base: usize,
        variant: KernelVariant,
    ) -> Result<Vec<wgpu::CommandBuffer>> {
        let kernels = self
            .kernels
            .as_ref()
            .ok_or_else(|| Error::Gpu("kernels missing after prepare".to_string()))?;
        let pipeline = kernels
            .pipeline(variant)
            .ok_or_else(|| Error::Gpu(format!("{variant} pipeline missing after prepare")))?;

        let mut commands = Vec::with_capacity(jobs.len());
        for (k, (job, set)) in jobs.iter().zip(buffers).enumerate() {
            let stream = match self.stream_pool.acquire(base + k, k) {
                Ok(stream) => stream,
                Err(error) => {
                    self.stream_pool.release_range(base..base + k);
                    return Err(error);
                }
            };
            match encode_job(&self.gpu, kernels, pipeline, stream.label(), job, set, k) {
                Ok(command) => commands.push(command),
                Err(error) => {
                    self.stream_pool.release_range(base..base + k + 1);
                    return Err(error);
                }
            }
        }
        Ok(commands)
    }

    /// Waits for every submitted job and collects their results.
    ///
    /// A device fault recorded since the last drain fails the whole drain.
    pub fn finish(&mut self) -> Result<Drained> {
        let in_flight = std::mem::take(&mut self.in_flight);

        let mapped: Vec<MapResult> = in_flight
            .iter()
            .map(|entry| {
                let result: MapResult = Arc::default();
                entry.buffers.readback.slice(..).map_async(wgpu::MapMode::Read, {
                    let result = Arc::clone(&result);
                    move |r| {
                        *result.lock() = Some(r);
                    }
                });
                result
            })
            .collect();

        let waited = self.gpu.wait();
        self.stream_pool.release_all();
        waited?;

        if let Some(fault) = self.gpu.take_fault() {
            return Err(Error::KernelDispatch {
                job: None,
                message: fault,
            });
        }

        let mut drained = Drained::default();
        let mut non_finite = 0;
        for (entry, result) in in_flight.into_iter().zip(mapped) {
            let output = read_back(entry.job, entry.buffers, &result);
            if let Ok(output) = &output {
                non_finite += output.power.non_finite_count();
            }
            drained.outputs.insert(entry.id, output);
        }

        if non_finite > 0 {
            tracing::warn!(
                non_finite,
                "drained power contains non-finite values (constant curves or degenerate bins)"
            );
        }
        tracing::info!(jobs = drained.len(), "drained all streams");

        Ok(drained)
    }

    /// Drains outstanding work and releases all streams and kernels.
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.in_flight.is_empty() {
            tracing::debug!(jobs = self.in_flight.len(), "discarding undrained jobs");
            self.in_flight.clear();
            self.gpu.wait()?;
        }
        self.stream_pool.clear();
        self.returned.clear();
        self.kernels = None;
        Ok(())
    }
}

impl Drop for PdmEngine {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(%err, "engine shutdown failed");
        }
    }
}

/// Encodes one job's dispatch and readback copy under a validation scope.
fn encode_job(
    gpu: &Gpu,
    kernels: &PdmKernels,
    pipeline: &wgpu::ComputePipeline,
    label: &str,
    job: &Job,
    set: &BufferSet,
    k: usize,
) -> Result<wgpu::CommandBuffer> {
    let (commands, error) = gpu.scoped(wgpu::ErrorFilter::Validation, |device| {
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("pdm_bind_group"),
            layout: kernels.bind_group_layout(),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: set.params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: set.times.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: set.values.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: set.weights.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: set.freqs.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: set.power.as_entire_binding(),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(label),
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("pdm_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroup_count(job.grid().len()), 1, 1);
        }

        encoder.copy_buffer_to_buffer(&set.power, 0, &set.readback, 0, set.power_size());
        encoder.finish()
    });

    match error {
        Some(error) => Err(Error::KernelDispatch {
            job: Some(k),
            message: error.to_string(),
        }),
        None => Ok(commands),
    }
}

/// Queues host-to-device writes of a job's inputs into `set`.
fn upload(gpu: &Gpu, job: &Job, set: &BufferSet, statistic: &Statistic) {
    let curve = job.curve();
    let weights = curve.weights();
    let stats = weighted_stats(curve.values(), &weights);
    let params = GpuParams::new(curve.len(), job.grid().len(), statistic, stats.variance);

    let values: Vec<f32> = curve.values().iter().map(|&v| v as f32).collect();
    let weights: Vec<f32> = weights.iter().map(|&w| w as f32).collect();

    let queue = gpu.queue();
    queue.write_buffer(&set.params, 0, bytemuck::bytes_of(&params));
    queue.write_buffer(&set.times, 0, bytemuck::cast_slice(&split_all(curve.times())));
    queue.write_buffer(&set.values, 0, bytemuck::cast_slice(&values));
    queue.write_buffer(&set.weights, 0, bytemuck::cast_slice(&weights));
    queue.write_buffer(&set.freqs, 0, bytemuck::cast_slice(&split_all(job.grid())));
}

fn read_back(job: usize, buffers: BufferSet, result: &MapResult) -> Result<JobOutput> {
    match result.lock().take() {
        Some(Ok(())) => {}
        Some(Err(err)) => {
            return Err(Error::KernelDispatch {
                job: Some(job),
                message: format!("readback mapping failed: {err}"),
            });
        }
        None => {
            return Err(Error::KernelDispatch {
                job: Some(job),
                message: "readback mapping did not complete".to_string(),
            });
        }
    }

    let slice = buffers.readback.slice(..);
    let data = slice.get_mapped_range();
    let power = PowerSeries::from_device(bytemuck::cast_slice(&data));
    drop(data);
    buffers.readback.unmap();

    Ok(JobOutput { power, buffers })
}
