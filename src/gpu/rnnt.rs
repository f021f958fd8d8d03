//! GPU loss engine.
//!
//! [`GpuRnnt::enqueue`] is the device-resident entry point: activations,
//! costs, gradients and the workspace are [`GpuTensor`]s, labels and lengths
//! stay on the host (they are validated there and written into the
//! workspace). All work is recorded into one compute pass and submitted on
//! the stream's queue; the call does not wait for it to finish.
//!
//! [`GpuRnnt::compute_host`] wraps `enqueue` for host-memory callers: it
//! stages the inputs through a [`GpuWorkspace`], then downloads the outputs,
//! which blocks until the device is done.

use wgpu::util::DeviceExt;

use crate::batch::{row_len, tensor_len, Batch, Gradients, LossInputs};
use crate::config::RnntOptions;
use crate::error::{RnntError, RnntResult};
use crate::gpu::pipeline::{grid_2d, workgroup_count, Kernel, PipelineCache, WORKGROUP_SIZE};
use crate::gpu::uniforms::{to_u32, RnntUniforms};
use crate::gpu::workspace::{GpuWorkspace, StagingDims};
use crate::gpu::{GpuStream, GpuTensor};
use crate::workspace::{WorkspaceLayout, GPU_META_WORDS};

/// Device-resident inputs of one loss computation.
#[derive(Debug, Clone, Copy)]
pub struct GpuLossInputs<'a> {
    /// `(max_t, minibatch, alphabet_size)` activations.
    pub trans_acts: &'a GpuTensor,
    /// `(max_u, minibatch, alphabet_size)` activations.
    pub pred_acts: &'a GpuTensor,
    pub labels: &'a [i32],
    pub label_lengths: &'a [i32],
    pub input_lengths: &'a [i32],
    pub alphabet_size: usize,
    pub minibatch: usize,
}

/// Optional device gradient outputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct GpuGradients<'a> {
    pub trans_grad: Option<&'a GpuTensor>,
    pub pred_grad: Option<&'a GpuTensor>,
}

impl GpuGradients<'_> {
    fn any(&self) -> bool {
        self.trans_grad.is_some() || self.pred_grad.is_some()
    }
}

/// GPU loss engine bound to one stream.
///
/// Pipelines are compiled on first use and cached for the engine's
/// lifetime.
///
/// ```rust,no_run
/// use warprnnt::gpu::{GpuGradients, GpuLossInputs, GpuRnnt, GpuTensor, WgpuBackend, WgpuOptions};
/// use warprnnt::{workspace_size, Backend, RnntOptions};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = WgpuBackend::init(WgpuOptions::default())?;
/// let stream = backend.stream();
/// let (max_t, max_u, minibatch, v) = (4, 3, 1, 5);
///
/// let trans = GpuTensor::upload(stream.device(), &vec![0.0; max_t * minibatch * v], vec![max_t, minibatch, v])?;
/// let pred = GpuTensor::upload(stream.device(), &vec![0.0; max_u * minibatch * v], vec![max_u, minibatch, v])?;
/// let costs = GpuTensor::storage_read_write(stream.device(), vec![minibatch])?;
/// let bytes = workspace_size(max_t, max_u, minibatch, v, Backend::Gpu)?;
/// let workspace = GpuTensor::workspace(stream.device(), bytes)?;
///
/// let mut engine = GpuRnnt::new(stream.clone());
/// let inputs = GpuLossInputs {
///     trans_acts: &trans,
///     pred_acts: &pred,
///     labels: &[1, 2],
///     label_lengths: &[2],
///     input_lengths: &[4],
///     alphabet_size: v,
///     minibatch,
/// };
/// let options = RnntOptions::gpu(max_t, max_u, stream.clone());
/// engine.enqueue(&inputs, GpuGradients::default(), &costs, &workspace, &options)?;
/// let host_costs = costs.download(stream.device(), stream.queue())?;
/// # Ok(())
/// # }
/// ```
pub struct GpuRnnt {
    stream: GpuStream,
    pipelines: PipelineCache,
}

/// Compiled pipelines and staging buffers kept on a [`GpuStream`] between
/// one-shot host calls.
pub(crate) struct HostEngine {
    pipelines: PipelineCache,
    staging: GpuWorkspace,
}

impl GpuRnnt {
    pub fn new(stream: GpuStream) -> Self {
        let pipelines = PipelineCache::new(stream.device_arc());
        Self { stream, pipelines }
    }

    pub fn stream(&self) -> &GpuStream {
        &self.stream
    }

    /// Compiles every kernel now instead of on the first `enqueue`.
    pub fn warm_up(&mut self) {
        self.pipelines.warm_up();
    }

    /// Validates the call and enqueues all kernels on the stream.
    ///
    /// Only `blank_label`, `max_t` and `max_u` are read from `options`.
    ///
    /// # Errors
    ///
    /// Validation errors (nothing is enqueued), [`RnntError::UnsupportedLimits`]
    /// if the problem exceeds device limits, and [`RnntError::Device`] for
    /// errors raised while recording or submitting.
    pub fn enqueue(
        &mut self,
        inputs: &GpuLossInputs<'_>,
        grads: GpuGradients<'_>,
        costs: &GpuTensor,
        workspace: &GpuTensor,
        options: &RnntOptions,
    ) -> RnntResult<()> {
        let batch = Batch::from_lengths(
            inputs.labels,
            inputs.label_lengths,
            inputs.input_lengths,
            inputs.alphabet_size,
            inputs.minibatch,
            options,
        )?;
        batch.check_activations(
            inputs.trans_acts.num_elements(),
            inputs.pred_acts.num_elements(),
        )?;
        costs.check_len("costs", batch.len())?;
        let row = row_len(batch.len(), batch.alphabet_size)?;
        if let Some(grad) = grads.trans_grad {
            grad.check_len("trans_grad", tensor_len(batch.max_t, row)?)?;
        }
        if let Some(grad) = grads.pred_grad {
            grad.check_len("pred_grad", tensor_len(batch.max_u, row)?)?;
        }

        self.enqueue_batch(
            &batch,
            inputs.trans_acts,
            inputs.pred_acts,
            grads,
            costs,
            workspace,
        )
    }

    fn enqueue_batch(
        &mut self,
        batch: &Batch<'_>,
        trans_acts: &GpuTensor,
        pred_acts: &GpuTensor,
        grads: GpuGradients<'_>,
        costs: &GpuTensor,
        workspace: &GpuTensor,
    ) -> RnntResult<()> {
        let minibatch = batch.len();
        let layout = WorkspaceLayout::new(batch.max_t, batch.max_u, minibatch, batch.alphabet_size)?;
        let required = layout.gpu_bytes()?;
        if workspace.size_bytes() < required as u64 {
            return Err(RnntError::workspace_too_small(
                required,
                workspace.size_bytes() as usize,
            ));
        }
        let uniforms = RnntUniforms::new(&layout, batch.blank)?;

        let device = self.stream.device();
        let queue = self.stream.queue();
        let limits = device.limits();
        let max_groups = limits.max_compute_workgroups_per_dimension;
        if to_u32("minibatch", minibatch)? > max_groups {
            return Err(RnntError::unsupported_limits(format!(
                "minibatch {minibatch} exceeds max_compute_workgroups_per_dimension {max_groups}"
            )));
        }
        let max_binding = u64::from(limits.max_storage_buffer_binding_size);
        for (name, size) in [
            ("workspace", workspace.size_bytes()),
            ("trans_acts", trans_acts.size_bytes()),
            ("pred_acts", pred_acts.size_bytes()),
        ] {
            if size > max_binding {
                return Err(RnntError::unsupported_limits(format!(
                    "{name} binding of {size} bytes exceeds max_storage_buffer_binding_size {max_binding}"
                )));
            }
        }

        let (meta, labels) = device_metadata(batch)?;

        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        queue.write_buffer(&workspace.buffer, 0, bytemuck::cast_slice(&meta));
        if !labels.is_empty() {
            let offset = (uniforms.labels_offset as u64) * 4;
            queue.write_buffer(&workspace.buffer, offset, bytemuck::cast_slice(&labels));
        }

        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("RNNT params"),
            contents: bytemuck::bytes_of(&uniforms),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let loss_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("RNNT BindGroup (loss)"),
            layout: &self.pipelines.loss_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: trans_acts.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: pred_acts.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: workspace.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: costs.buffer.as_entire_binding(),
                },
            ],
        });
        let grad_group = |grad: &GpuTensor, label: &str| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &self.pipelines.grad_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: grad.buffer.as_entire_binding(),
                }],
            })
        };
        let trans_group = grads
            .trans_grad
            .map(|g| grad_group(g, "RNNT BindGroup (trans_grad)"));
        let pred_group = grads
            .pred_grad
            .map(|g| grad_group(g, "RNNT BindGroup (pred_grad)"));

        let grid = |total: usize| grid_2d(workgroup_count(total, WORKGROUP_SIZE), max_groups);
        let score_grid = grid(minibatch * layout.lattice_len());
        let trans_grid = grid(layout.max_t * minibatch * layout.alphabet_size);
        let pred_grid = grid(layout.max_u * minibatch * layout.alphabet_size);
        let groups = minibatch as u32;

        log::debug!(
            "gpu rnnt: {} examples, lattice {}x{}, V {}, gradients: {}",
            minibatch,
            layout.max_t,
            layout.max_u,
            layout.alphabet_size,
            grads.any()
        );

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("RNNT encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("RNNT pass"),
                timestamp_writes: None,
            });
            pass.set_bind_group(0, &loss_group, &[]);

            pass.set_pipeline(self.pipelines.get(Kernel::Score));
            pass.dispatch_workgroups(score_grid.0, score_grid.1, 1);

            pass.set_pipeline(self.pipelines.get(Kernel::Alpha));
            pass.dispatch_workgroups(groups, 1, 1);

            if grads.any() {
                pass.set_pipeline(self.pipelines.get(Kernel::Beta));
                pass.dispatch_workgroups(groups, 1, 1);
            }
            if let Some(group) = &trans_group {
                pass.set_pipeline(self.pipelines.get(Kernel::TransGrad));
                pass.set_bind_group(1, group, &[]);
                pass.dispatch_workgroups(trans_grid.0, trans_grid.1, 1);
            }
            if let Some(group) = &pred_group {
                pass.set_pipeline(self.pipelines.get(Kernel::PredGrad));
                pass.set_bind_group(1, group, &[]);
                pass.dispatch_workgroups(pred_grid.0, pred_grid.1, 1);
            }
        }
        queue.submit(std::iter::once(encoder.finish()));

        let validation = pollster::block_on(device.pop_error_scope());
        let out_of_memory = pollster::block_on(device.pop_error_scope());
        match validation.or(out_of_memory) {
            Some(err) => Err(RnntError::Device(err)),
            None => Ok(()),
        }
    }

    /// Runs [`compute_host`](Self::compute_host) with the pipelines and
    /// staging buffers cached on `stream`.
    ///
    /// Calls on clones of the same stream share one cache and are serialized
    /// on it.
    pub fn compute_host_cached(
        stream: &GpuStream,
        batch: &Batch<'_>,
        inputs: &LossInputs<'_>,
        grads: Gradients<'_>,
        costs: &mut [f32],
    ) -> RnntResult<()> {
        let mut slot = stream
            .host_engine()
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let HostEngine {
            pipelines,
            mut staging,
        } = match slot.take() {
            Some(cached) => cached,
            None => {
                log::debug!("building GPU host engine for stream");
                HostEngine {
                    pipelines: PipelineCache::new(stream.device_arc()),
                    staging: GpuWorkspace::new(),
                }
            }
        };
        let mut engine = Self {
            stream: stream.clone(),
            pipelines,
        };
        let result = engine.compute_host(batch, inputs, grads, costs, &mut staging);
        *slot = Some(HostEngine {
            pipelines: engine.pipelines,
            staging,
        });
        result
    }

    /// Computes costs and gradients for host-memory inputs.
    ///
    /// Stages the activations through `staging`, enqueues the kernels and
    /// copies the results back. Returns once the device has finished.
    pub fn compute_host(
        &mut self,
        batch: &Batch<'_>,
        inputs: &LossInputs<'_>,
        grads: Gradients<'_>,
        costs: &mut [f32],
        staging: &mut GpuWorkspace,
    ) -> RnntResult<()> {
        let layout = WorkspaceLayout::new(
            batch.max_t,
            batch.max_u,
            batch.len(),
            batch.alphabet_size,
        )?;
        let Gradients {
            trans_grad,
            pred_grad,
        } = grads;

        staging.prepare(
            self.stream.device(),
            StagingDims {
                max_t: batch.max_t,
                max_u: batch.max_u,
                minibatch: batch.len(),
                alphabet_size: batch.alphabet_size,
                workspace_bytes: layout.gpu_bytes()?,
            },
            trans_grad.is_some(),
            pred_grad.is_some(),
        )?;
        let (Some(workspace), Some(trans_acts), Some(pred_acts), Some(cost_tensor)) = (
            staging.workspace.as_ref(),
            staging.trans_acts.as_ref(),
            staging.pred_acts.as_ref(),
            staging.costs.as_ref(),
        ) else {
            return Err(RnntError::buffer("staging buffers were not allocated"));
        };
        let queue = self.stream.queue();
        trans_acts.update(queue, inputs.trans_acts)?;
        pred_acts.update(queue, inputs.pred_acts)?;

        let device_grads = GpuGradients {
            trans_grad: trans_grad.as_ref().and(staging.trans_grad.as_ref()),
            pred_grad: pred_grad.as_ref().and(staging.pred_grad.as_ref()),
        };
        self.enqueue_batch(batch, trans_acts, pred_acts, device_grads, cost_tensor, workspace)?;

        let device = self.stream.device();
        let queue = self.stream.queue();
        costs.copy_from_slice(&cost_tensor.download(device, queue)?);
        if let (Some(host), Some(dev)) = (trans_grad, device_grads.trans_grad) {
            host.copy_from_slice(&dev.download(device, queue)?);
        }
        if let (Some(host), Some(dev)) = (pred_grad, device_grads.pred_grad) {
            host.copy_from_slice(&dev.download(device, queue)?);
        }
        Ok(())
    }
}

impl std::fmt::Debug for GpuRnnt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuRnnt")
            .field("stream", &self.stream)
            .field("pipelines", &self.pipelines)
            .finish()
    }
}

/// Builds the metadata block and the label arena as device words.
fn device_metadata(batch: &Batch<'_>) -> RnntResult<(Vec<u32>, Vec<u32>)> {
    let mut meta = Vec::with_capacity(batch.len() * GPU_META_WORDS);
    for ex in batch.examples() {
        meta.extend_from_slice(&[
            to_u32("input length", ex.t_len)?,
            to_u32("lattice width", ex.u_len)?,
            to_u32("label offset", ex.label_offset)?,
            0,
        ]);
    }
    // labels are validated to lie in [0, alphabet_size)
    let labels = batch.label_arena().iter().map(|&l| l as u32).collect();
    Ok((meta, labels))
}
