//! Device initialization and the stream handle.
//!
//! [`WgpuBackend`] selects an adapter and creates a device and queue.
//! [`GpuStream`] is the cheap, clonable handle that loss calls carry in
//! [`ComputeLocation::Gpu`](crate::ComputeLocation::Gpu): all work of a call
//! is submitted on its queue.

use crate::error::{RnntError, RnntResult};
use crate::gpu::rnnt::HostEngine;
use std::sync::{Arc, Mutex};

/// Power preference for GPU adapter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerPreference {
    /// Prefer low power consumption (integrated GPU).
    LowPower,
    /// Prefer high performance (discrete GPU).
    #[default]
    HighPerformance,
}

impl From<PowerPreference> for wgpu::PowerPreference {
    fn from(pref: PowerPreference) -> Self {
        match pref {
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
        }
    }
}

/// Options for initializing the wgpu backend.
#[derive(Debug, Clone)]
pub struct WgpuOptions {
    /// Power preference for adapter selection.
    pub power_preference: PowerPreference,
    /// Restrict adapter search to these backends; `None` searches all.
    pub backend: Option<wgpu::Backends>,
    /// Force a specific adapter by name (case-insensitive substring match).
    pub force_adapter_name: Option<String>,
    /// Required limits (minimum).
    pub required_limits: wgpu::Limits,
}

impl Default for WgpuOptions {
    fn default() -> Self {
        Self {
            power_preference: PowerPreference::HighPerformance,
            backend: None,
            force_adapter_name: None,
            required_limits: wgpu::Limits::default(),
        }
    }
}

impl WgpuOptions {
    /// Options for large lattices: 1 GiB storage bindings.
    pub fn large_lattice() -> Self {
        Self {
            required_limits: wgpu::Limits {
                max_storage_buffer_binding_size: 1 << 30,
                max_buffer_size: 1 << 30,
                ..wgpu::Limits::default()
            },
            ..Self::default()
        }
    }

    /// Options for integrated or software adapters.
    pub fn low_power() -> Self {
        Self {
            power_preference: PowerPreference::LowPower,
            required_limits: wgpu::Limits::downlevel_defaults(),
            ..Self::default()
        }
    }
}

/// Owns the adapter and device created for loss computation.
///
/// ```rust,no_run
/// use warprnnt::gpu::{WgpuBackend, WgpuOptions};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = WgpuBackend::init(WgpuOptions::default())?;
/// let stream = backend.stream();
/// println!("Using GPU: {}", backend.adapter_info().name);
/// # drop(stream);
/// # Ok(())
/// # }
/// ```
pub struct WgpuBackend {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
}

impl WgpuBackend {
    /// Initializes the backend with the given options.
    ///
    /// # Errors
    ///
    /// - [`RnntError::AdapterNotFound`] if no suitable adapter exists.
    /// - [`RnntError::UnsupportedLimits`] if the adapter is below the required limits.
    /// - [`RnntError::DeviceRequestFailed`] if device creation fails.
    pub fn init(options: WgpuOptions) -> RnntResult<Self> {
        let backends = options.backend.unwrap_or(wgpu::Backends::all());
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = pollster::block_on(Self::request_adapter(&instance, &options))?;
        let adapter_info = adapter.get_info();

        log::info!(
            "Selected GPU adapter: {} ({:?})",
            adapter_info.name,
            adapter_info.backend
        );

        Self::check_limits(&adapter.limits(), &options.required_limits)?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("warprnnt device"),
                required_features: wgpu::Features::empty(),
                required_limits: options.required_limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))?;
        let limits = device.limits();

        Ok(Self {
            instance,
            adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            limits,
        })
    }

    async fn request_adapter(
        instance: &wgpu::Instance,
        options: &WgpuOptions,
    ) -> RnntResult<wgpu::Adapter> {
        if let Some(ref name_filter) = options.force_adapter_name {
            let wanted = name_filter.to_lowercase();
            return instance
                .enumerate_adapters(options.backend.unwrap_or(wgpu::Backends::all()))
                .into_iter()
                .find(|a| a.get_info().name.to_lowercase().contains(&wanted))
                .ok_or_else(|| {
                    RnntError::adapter_not_found(format!("No adapter matching '{name_filter}' found"))
                });
        }

        let preferred = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference.into(),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await;

        match preferred {
            Some(adapter) => Ok(adapter),
            None => instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::None,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .ok_or_else(|| {
                    RnntError::adapter_not_found(
                        "No GPU adapters available. Ensure GPU drivers are installed.",
                    )
                }),
        }
    }

    fn check_limits(adapter: &wgpu::Limits, required: &wgpu::Limits) -> RnntResult<()> {
        if adapter.max_storage_buffer_binding_size < required.max_storage_buffer_binding_size {
            return Err(RnntError::unsupported_limits(format!(
                "max_storage_buffer_binding_size: adapter has {}, required {}",
                adapter.max_storage_buffer_binding_size, required.max_storage_buffer_binding_size
            )));
        }
        if adapter.max_buffer_size < required.max_buffer_size {
            return Err(RnntError::unsupported_limits(format!(
                "max_buffer_size: adapter has {}, required {}",
                adapter.max_buffer_size, required.max_buffer_size
            )));
        }
        Ok(())
    }

    /// Returns information about the selected adapter.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Returns the device limits.
    pub fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    /// Returns a stream handle on this backend's queue.
    pub fn stream(&self) -> GpuStream {
        GpuStream::new(Arc::clone(&self.device), Arc::clone(&self.queue))
    }
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("adapter", &self.adapter_info.name)
            .field("backend", &self.adapter_info.backend)
            .field("device_type", &self.adapter_info.device_type)
            .field(
                "max_storage_buffer",
                &self.limits.max_storage_buffer_binding_size,
            )
            .finish()
    }
}

/// A device queue that loss work is submitted on.
///
/// Work enqueued on a stream completes asynchronously; outputs become
/// host-visible once the caller synchronizes, e.g. with
/// [`GpuTensor::download`](crate::gpu::GpuTensor::download) or
/// [`GpuStream::synchronize`].
///
/// Clones share the pipelines and staging buffers that one-shot host calls
/// ([`compute_rnnt_loss`](crate::compute_rnnt_loss)) build on first use.
#[derive(Clone)]
pub struct GpuStream {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    host_engine: Arc<Mutex<Option<HostEngine>>>,
}

impl GpuStream {
    /// Wraps an existing device and queue.
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            host_engine: Arc::new(Mutex::new(None)),
        }
    }

    #[inline]
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub(crate) fn device_arc(&self) -> Arc<wgpu::Device> {
        Arc::clone(&self.device)
    }

    /// Blocks until all submitted work has completed.
    pub fn synchronize(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }

    pub(crate) fn host_engine(&self) -> &Mutex<Option<HostEngine>> {
        &self.host_engine
    }

    /// Largest storage binding the device accepts, in bytes.
    pub fn max_binding_size(&self) -> u64 {
        u64::from(self.device.limits().max_storage_buffer_binding_size)
    }
}

impl std::fmt::Debug for GpuStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuStream")
            .field("max_binding_size", &self.max_binding_size())
            .finish()
    }
}
