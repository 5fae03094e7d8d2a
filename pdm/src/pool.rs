//! Device buffer sets per job and the stream slot arena.

use crate::error::{Error, Result};
use crate::gpu::{Gpu, GpuParams};
use crate::job::Job;

const F32_SIZE: u64 = std::mem::size_of::<f32>() as u64;
const SPLIT_SIZE: u64 = 2 * F32_SIZE;

/// Device resources for one job of shape `(N, Nf)`.
///
/// Owned by the caller between runs; handed to the engine for a run and
/// returned with the job's output.
#[derive(Debug)]
pub struct BufferSet {
    n_points: usize,
    n_freqs: usize,
    pub(crate) params: wgpu::Buffer,
    pub(crate) times: wgpu::Buffer,
    pub(crate) values: wgpu::Buffer,
    pub(crate) weights: wgpu::Buffer,
    pub(crate) freqs: wgpu::Buffer,
    pub(crate) power: wgpu::Buffer,
    /// Host-mappable mirror of `power`.
    pub(crate) readback: wgpu::Buffer,
}

impl BufferSet {
    fn new(device: &wgpu::Device, n_points: usize, n_freqs: usize) -> Self {
        let storage = |label: &str, size: u64, extra: wgpu::BufferUsages| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | extra,
                mapped_at_creation: false,
            })
        };

        let n = n_points as u64;
        let nf = n_freqs as u64;
        Self {
            n_points,
            n_freqs,
            params: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("pdm_params"),
                size: std::mem::size_of::<GpuParams>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            times: storage("pdm_times", n * SPLIT_SIZE, wgpu::BufferUsages::COPY_DST),
            values: storage("pdm_values", n * F32_SIZE, wgpu::BufferUsages::COPY_DST),
            weights: storage("pdm_weights", n * F32_SIZE, wgpu::BufferUsages::COPY_DST),
            freqs: storage("pdm_freqs", nf * SPLIT_SIZE, wgpu::BufferUsages::COPY_DST),
            power: storage("pdm_power", nf * F32_SIZE, wgpu::BufferUsages::COPY_SRC),
            readback: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("pdm_readback"),
                size: nf * F32_SIZE,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
        }
    }

    /// `(N, Nf)` this set was allocated for.
    pub fn shape(&self) -> (usize, usize) {
        (self.n_points, self.n_freqs)
    }

    pub(crate) fn power_size(&self) -> u64 {
        self.n_freqs as u64 * F32_SIZE
    }

    fn size_in_bytes(&self) -> u64 {
        let n = self.n_points as u64;
        let nf = self.n_freqs as u64;
        let per_point = SPLIT_SIZE + 2 * F32_SIZE;
        let per_freq = SPLIT_SIZE + 2 * F32_SIZE;
        std::mem::size_of::<GpuParams>() as u64 + n * per_point + nf * per_freq
    }
}

/// Allocates per-job [`BufferSet`]s and checks supplied ones.
#[derive(Debug, Default)]
pub struct JobBufferPool {
    allocated_sets: usize,
    allocated_bytes: u64,
}

impl JobBufferPool {
    /// One buffer set per job, sized to its shape.
    ///
    /// Sizes above the device's binding limit and device out-of-memory
    /// errors are reported as [`Error::ResourceExhaustion`].
    pub fn allocate(&mut self, gpu: &Gpu, jobs: &[Job]) -> Result<Vec<BufferSet>> {
        let limits = gpu.device().limits();
        let max_binding = (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
        check_binding_limit(jobs, max_binding)?;

        let (sets, error) = gpu.scoped(wgpu::ErrorFilter::OutOfMemory, |device| {
            jobs.iter()
                .map(|job| {
                    let (n, nf) = job.shape();
                    BufferSet::new(device, n, nf)
                })
                .collect::<Vec<_>>()
        });
        if let Some(error) = error {
            return Err(Error::ResourceExhaustion(format!(
                "buffer allocation for {} jobs failed: {error}",
                jobs.len()
            )));
        }

        let bytes: u64 = sets.iter().map(BufferSet::size_in_bytes).sum();
        self.allocated_sets += sets.len();
        self.allocated_bytes += bytes;
        tracing::debug!(
            sets = sets.len(),
            bytes,
            total_sets = self.allocated_sets,
            total_bytes = self.allocated_bytes,
            "allocated job buffers"
        );

        Ok(sets)
    }

    /// Verifies that supplied buffers match the jobs one to one.
    pub fn check(&self, jobs: &[Job], buffers: &[BufferSet]) -> Result<()> {
        if jobs.len() != buffers.len() {
            return Err(Error::invalid(format!(
                "{} buffer sets supplied for {} jobs",
                buffers.len(),
                jobs.len()
            )));
        }
        for (k, (job, set)) in jobs.iter().zip(buffers).enumerate() {
            if job.shape() != set.shape() {
                return Err(Error::invalid(format!(
                    "buffer set {k} has shape {:?}, job needs {:?}",
                    set.shape(),
                    job.shape()
                )));
            }
        }
        Ok(())
    }

    pub fn allocated_sets(&self) -> usize {
        self.allocated_sets
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }
}

/// Rejects jobs whose largest buffer exceeds `max_binding` bytes.
fn check_binding_limit(jobs: &[Job], max_binding: u64) -> Result<()> {
    for (k, job) in jobs.iter().enumerate() {
        let (n, nf) = job.shape();
        let largest = (n as u64).max(nf as u64) * SPLIT_SIZE;
        if largest > max_binding {
            return Err(Error::ResourceExhaustion(format!(
                "job {k} of shape ({n}, {nf}) needs a {largest} byte buffer, device limit is {max_binding}"
            )));
        }
    }
    Ok(())
}

/// An ordered command slot. Work recorded for one job is encoded and
/// submitted through its stream, which stays tagged until the next drain.
#[derive(Debug)]
pub struct Stream {
    index: usize,
    label: String,
    job: Option<usize>,
    submission: Option<wgpu::SubmissionIndex>,
}

impl Stream {
    fn new(index: usize) -> Self {
        Self {
            index,
            label: format!("pdm_stream_{index}"),
            job: None,
            submission: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Job (position within its batch) this stream currently serves.
    pub fn job(&self) -> Option<usize> {
        self.job
    }

    pub fn is_in_use(&self) -> bool {
        self.job.is_some()
    }

    pub fn last_submission(&self) -> Option<&wgpu::SubmissionIndex> {
        self.submission.as_ref()
    }

    pub(crate) fn record_submission(&mut self, submission: wgpu::SubmissionIndex) {
        self.submission = Some(submission);
    }
}

/// Positional arena of streams. Grows on demand and never shrinks.
#[derive(Debug, Default)]
pub struct ExecutionStreamPool {
    streams: Vec<Stream>,
}

impl ExecutionStreamPool {
    pub fn ensure_capacity(&mut self, n: usize) {
        if n <= self.streams.len() {
            return;
        }
        let old = self.streams.len();
        self.streams.extend((old..n).map(Stream::new));
        tracing::debug!(from = old, to = n, "grew stream pool");
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Tags slot `index` with `job`. The slot must exist and be free.
    pub fn acquire(&mut self, index: usize, job: usize) -> Result<&mut Stream> {
        let len = self.streams.len();
        let stream = self.streams.get_mut(index).ok_or_else(|| Error::KernelDispatch {
            job: Some(job),
            message: format!("stream slot {index} out of range ({len} slots)"),
        })?;
        if let Some(owner) = stream.job {
            return Err(Error::KernelDispatch {
                job: Some(job),
                message: format!("stream slot {index} still serves job {owner}"),
            });
        }
        stream.job = Some(job);
        Ok(stream)
    }

    pub fn in_use(&self) -> usize {
        self.streams.iter().filter(|s| s.is_in_use()).count()
    }

    pub(crate) fn record_submission(&mut self, index: usize, submission: wgpu::SubmissionIndex) {
        if let Some(stream) = self.streams.get_mut(index) {
            stream.record_submission(submission);
        }
    }

    /// Clears the tags of slots in `range` that were taken but never submitted.
    pub fn release_range(&mut self, range: std::ops::Range<usize>) {
        let end = range.end.min(self.streams.len());
        for stream in &mut self.streams[range.start.min(end)..end] {
            stream.job = None;
            stream.submission = None;
        }
    }

    /// Clears every tag; called once all submitted work has drained.
    pub fn release_all(&mut self) {
        for stream in &mut self.streams {
            stream.job = None;
            stream.submission = None;
        }
    }

    /// Drops all streams.
    pub fn clear(&mut self) {
        self.streams.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.streams.iter()
    }
}
