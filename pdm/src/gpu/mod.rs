//! wgpu device access and the PDM compute kernels.

mod kernels;
mod split;

use std::sync::Arc;

use parking_lot::Mutex;

pub use self::kernels::{GpuParams, PdmKernels, WORKGROUP_SIZE};
pub(crate) use self::kernels::workgroup_count;
pub use self::split::{split_all, split_f64};

use crate::config::EngineConfig;
use crate::error::{Error, Result};

/// GPU context holding the wgpu device and queue.
///
/// Errors the device raises outside any error scope are recorded in a shared
/// fault slot and surfaced by [`Gpu::take_fault`].
#[derive(Debug, Clone)]
pub struct Gpu {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
    fault: Arc<Mutex<Option<String>>>,
}

impl Gpu {
    pub fn new() -> Result<Self> {
        Self::with_config(&EngineConfig::default())
    }

    pub fn with_config(config: &EngineConfig) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let request = |force_fallback_adapter| {
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: config.power_preference.into(),
                compatible_surface: None,
                force_fallback_adapter,
            }))
        };

        let adapter = match request(false) {
            Ok(adapter) => adapter,
            Err(err) if config.allow_fallback_adapter => {
                tracing::warn!(%err, "no hardware adapter, trying fallback adapter");
                request(true).map_err(|e| {
                    Error::Gpu(format!("failed to find fallback GPU adapter: {e}"))
                })?
            }
            Err(err) => {
                return Err(Error::Gpu(format!(
                    "failed to find suitable GPU adapter: {err}"
                )));
            }
        };

        let adapter_info = adapter.get_info();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("pdm_device"),
            ..Default::default()
        }))
        .map_err(|e| Error::Gpu(format!("failed to create device: {e}")))?;

        let fault = Arc::new(Mutex::new(None));
        device.on_uncaptured_error(Box::new({
            let fault = Arc::clone(&fault);
            move |err: wgpu::Error| {
                tracing::error!(%err, "uncaptured device error");
                fault.lock().get_or_insert_with(|| err.to_string());
            }
        }));

        tracing::info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            device_type = ?adapter_info.device_type,
            "GPU device ready"
        );

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            fault,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Blocks until all submitted work has completed and map callbacks ran.
    pub fn wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| Error::KernelDispatch {
                job: None,
                message: format!("device poll failed: {e}"),
            })
    }

    /// Returns and clears the first uncaptured device error, if any.
    pub fn take_fault(&self) -> Option<String> {
        self.fault.lock().take()
    }

    /// Runs `f` inside an error scope and returns the error it captured.
    pub(crate) fn scoped<T>(
        &self,
        filter: wgpu::ErrorFilter,
        f: impl FnOnce(&wgpu::Device) -> T,
    ) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(filter);
        let value = f(&self.device);
        let error = pollster::block_on(self.device.pop_error_scope());
        (value, error)
    }
}
