//! Compute pipeline creation and caching.
//!
//! [`PipelineCache`] compiles the RNNT shader module once and builds each
//! kernel's pipeline the first time it is dispatched.

use crate::gpu::shaders;

/// The five RNNT kernels, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    Score = 0,
    Alpha = 1,
    Beta = 2,
    TransGrad = 3,
    PredGrad = 4,
}

impl Kernel {
    /// WGSL entry point name.
    pub fn entry_point(self) -> &'static str {
        shaders::ENTRY_POINTS[self as usize]
    }

    /// Gradient kernels bind the output tensor as group 1.
    pub fn uses_grad_group(self) -> bool {
        matches!(self, Kernel::TransGrad | Kernel::PredGrad)
    }
}

/// Cached shader module, bind group layouts and pipelines.
pub struct PipelineCache {
    device: std::sync::Arc<wgpu::Device>,
    module: wgpu::ShaderModule,
    /// Group 0: params, activations, workspace, costs.
    pub loss_layout: wgpu::BindGroupLayout,
    /// Group 1: gradient output.
    pub grad_layout: wgpu::BindGroupLayout,
    lattice_pipeline_layout: wgpu::PipelineLayout,
    grad_pipeline_layout: wgpu::PipelineLayout,
    pipelines: [Option<wgpu::ComputePipeline>; 5],
}

impl PipelineCache {
    /// Compiles the shader module and creates the layouts.
    pub fn new(device: std::sync::Arc<wgpu::Device>) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("RNNT Shader"),
            source: wgpu::ShaderSource::Wgsl(shaders::RNNT_SHADER.into()),
        });

        let loss_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("RNNT BindGroupLayout (loss)"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
                storage_entry(4, false),
            ],
        });
        let grad_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("RNNT BindGroupLayout (grad)"),
            entries: &[storage_entry(0, false)],
        });

        let lattice_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("RNNT Pipeline Layout (lattice)"),
                bind_group_layouts: &[&loss_layout],
                push_constant_ranges: &[],
            });
        let grad_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("RNNT Pipeline Layout (grad)"),
            bind_group_layouts: &[&loss_layout, &grad_layout],
            push_constant_ranges: &[],
        });

        Self {
            device,
            module,
            loss_layout,
            grad_layout,
            lattice_pipeline_layout,
            grad_pipeline_layout,
            pipelines: Default::default(),
        }
    }

    /// Gets or creates the pipeline for `kernel`.
    pub fn get(&mut self, kernel: Kernel) -> &wgpu::ComputePipeline {
        let Self {
            device,
            module,
            lattice_pipeline_layout,
            grad_pipeline_layout,
            pipelines,
            ..
        } = self;
        pipelines[kernel as usize].get_or_insert_with(|| {
            let layout = if kernel.uses_grad_group() {
                &*grad_pipeline_layout
            } else {
                &*lattice_pipeline_layout
            };
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel.entry_point()),
                layout: Some(layout),
                module,
                entry_point: Some(kernel.entry_point()),
                compilation_options: Default::default(),
                cache: None,
            })
        })
    }

    /// Builds every pipeline up front.
    pub fn warm_up(&mut self) {
        for kernel in [
            Kernel::Score,
            Kernel::Alpha,
            Kernel::Beta,
            Kernel::TransGrad,
            Kernel::PredGrad,
        ] {
            self.get(kernel);
        }
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl std::fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCache")
            .field(
                "built",
                &self.pipelines.iter().filter(|p| p.is_some()).count(),
            )
            .finish()
    }
}

/// Computes the workgroup count for a given number of elements.
#[inline]
pub fn workgroup_count(total: usize, workgroup_size: usize) -> u32 {
    total.div_ceil(workgroup_size) as u32
}

/// Splits `groups` workgroups into an `(x, y)` grid with `x <= max_per_dim`.
///
/// Kernels recover the linear index as `gid.y * nwg.x * 64 + gid.x`.
#[inline]
pub fn grid_2d(groups: u32, max_per_dim: u32) -> (u32, u32) {
    if groups <= max_per_dim {
        (groups.max(1), 1)
    } else {
        (max_per_dim, groups.div_ceil(max_per_dim))
    }
}

/// Workgroup size of every RNNT kernel.
pub const WORKGROUP_SIZE: usize = 64;
