// Error handling
pub use crate::error::{Error, Result};

// Data model
pub use crate::grid::{FrequencyGrid, GridConfig, plan};
pub use crate::job::{Job, Peak, PowerSeries};
pub use crate::light_curve::{LightCurve, WeightedStats, normalized_weights, weighted_stats};
pub use crate::statistic::{
    DEFAULT_DPHI, DEFAULT_NBINS, KernelVariant, MAX_GPU_BINS, Statistic,
};

// Reference path
pub use crate::estimator::{
    BinnedResidual, PhaseVarianceEstimator, estimate, estimate_light_curve,
};

// Engine and pools
pub use crate::config::{EngineConfig, PowerPreference};
pub use crate::engine::{Drained, JobOutput, PdmEngine, PendingPower};
pub use crate::pool::{BufferSet, ExecutionStreamPool, JobBufferPool, Stream};

// GPU
pub use crate::gpu::{Gpu, GpuParams, PdmKernels, WORKGROUP_SIZE, split_f64};
