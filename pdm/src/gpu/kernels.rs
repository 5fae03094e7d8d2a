//! Compiled PDM kernels, built once per engine and cached by variant.

use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;

use super::Gpu;
use crate::error::{Error, Result};
use crate::statistic::{KernelVariant, Statistic};

/// Invocations per workgroup; must match `@workgroup_size` in `pdm.wgsl`.
pub const WORKGROUP_SIZE: u32 = 128;

/// Uniform parameter block. Must match the WGSL struct exactly (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuParams {
    pub n_points: u32,
    pub n_freqs: u32,
    pub nbins: u32,
    pub linterp: u32,
    pub dphi: f32,
    pub variance: f32,
    pub _padding: [u32; 2],
}

impl GpuParams {
    pub fn new(n_points: usize, n_freqs: usize, statistic: &Statistic, variance: f64) -> Self {
        let (nbins, linterp, dphi) = match *statistic {
            Statistic::Tophat { dphi } | Statistic::GaussWindow { dphi } => (0, 0, dphi as f32),
            Statistic::Binned { nbins, linterp } => (nbins, linterp as u32, 0.0),
        };
        Self {
            n_points: n_points as u32,
            n_freqs: n_freqs as u32,
            nbins,
            linterp,
            dphi,
            variance: variance as f32,
            _padding: [0; 2],
        }
    }
}

/// Shader module, bind group layout and the compute pipelines created so far.
#[derive(Debug)]
pub struct PdmKernels {
    shader: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: HashMap<KernelVariant, wgpu::ComputePipeline>,
}

impl PdmKernels {
    pub fn new(gpu: &Gpu) -> Result<Self> {
        let ((shader, bind_group_layout, pipeline_layout), error) =
            gpu.scoped(wgpu::ErrorFilter::Validation, |device| {
                let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("pdm_shader"),
                    source: wgpu::ShaderSource::Wgsl(include_str!("pdm.wgsl").into()),
                });

                let bind_group_layout =
                    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: Some("pdm_bind_group_layout"),
                        entries: &[
                            // Params uniform buffer
                            layout_entry(0, wgpu::BufferBindingType::Uniform),
                            // Times (split)
                            layout_entry(1, wgpu::BufferBindingType::Storage { read_only: true }),
                            // Values
                            layout_entry(2, wgpu::BufferBindingType::Storage { read_only: true }),
                            // Weights
                            layout_entry(3, wgpu::BufferBindingType::Storage { read_only: true }),
                            // Frequencies (split)
                            layout_entry(4, wgpu::BufferBindingType::Storage { read_only: true }),
                            // Power output
                            layout_entry(5, wgpu::BufferBindingType::Storage { read_only: false }),
                        ],
                    });

                let pipeline_layout =
                    device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: Some("pdm_pipeline_layout"),
                        bind_group_layouts: &[&bind_group_layout],
                        ..Default::default()
                    });

                (shader, bind_group_layout, pipeline_layout)
            });

        if let Some(error) = error {
            return Err(Error::Gpu(format!("shader compilation failed: {error}")));
        }

        tracing::debug!("compiled pdm shader module");

        Ok(Self {
            shader,
            bind_group_layout,
            pipeline_layout,
            pipelines: HashMap::new(),
        })
    }

    /// Returns the pipeline for `variant`, creating it on first use.
    pub fn prepare(&mut self, gpu: &Gpu, variant: KernelVariant) -> Result<&wgpu::ComputePipeline> {
        if !self.pipelines.contains_key(&variant) {
            let label = format!("pdm_{variant}_pipeline");
            let (pipeline, error) = gpu.scoped(wgpu::ErrorFilter::Validation, |device| {
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(&label),
                    layout: Some(&self.pipeline_layout),
                    module: &self.shader,
                    entry_point: Some(variant.entry_point()),
                    compilation_options: Default::default(),
                    cache: None,
                })
            });
            if let Some(error) = error {
                return Err(Error::Gpu(format!(
                    "failed to create {variant} pipeline: {error}"
                )));
            }

            tracing::debug!(%variant, "created compute pipeline");
            self.pipelines.insert(variant, pipeline);
        }

        self.pipelines
            .get(&variant)
            .ok_or_else(|| Error::Gpu(format!("{variant} pipeline missing after creation")))
    }

    pub fn pipeline(&self, variant: KernelVariant) -> Option<&wgpu::ComputePipeline> {
        self.pipelines.get(&variant)
    }

    pub fn is_prepared(&self, variant: KernelVariant) -> bool {
        self.pipelines.contains_key(&variant)
    }

    pub fn prepared_count(&self) -> usize {
        self.pipelines.len()
    }

    pub fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.bind_group_layout
    }
}

fn layout_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Workgroups needed to cover `n_freqs` invocations.
pub(crate) fn workgroup_count(n_freqs: usize) -> u32 {
    (n_freqs as u32).div_ceil(WORKGROUP_SIZE)
}
