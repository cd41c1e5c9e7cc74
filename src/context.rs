//! GPU context initialization.
//!
//! This module wraps wgpu's instance, adapter, device and queue objects.
//! A *platform* here is one wgpu backend (Vulkan, Metal, DX12, GL) and a
//! *device* is one adapter exposed by that backend. Creating a
//! [`GpuContext`] picks the first GPU-class adapter on the first backend
//! that exposes any adapter at all, the same way an OpenCL program takes
//! the first GPU of the first platform. The `new_blocking` constructors
//! hide the asynchronous device request by using the [`pollster`] crate.

use std::fmt;

use log::{debug, info};
use wgpu::{Adapter, Device, Instance, Queue};

use crate::error::{Error, Result};
use crate::tracker::{ResourceGuard, ResourceKind, ResourceTracker};

/// Backends in the order they are probed. The first one that exposes an
/// adapter is the platform the device is taken from.
const PLATFORM_ORDER: [(wgpu::Backends, &str); 4] = [
    (wgpu::Backends::VULKAN, "Vulkan"),
    (wgpu::Backends::METAL, "Metal"),
    (wgpu::Backends::DX12, "DX12"),
    (wgpu::Backends::GL, "GL"),
];

/// Options for acquiring a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Backends that may be probed. Backends outside this set are skipped.
    pub backends: wgpu::Backends,
    /// Accept CPU/software adapters (llvmpipe, WARP, SwiftShader) as
    /// devices. Useful for headless CI machines without a GPU.
    pub allow_software: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            backends: wgpu::Backends::all(),
            allow_software: false,
        }
    }
}

/// The parts of an adapter's identity that selection and logging need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSummary {
    pub name: String,
    pub backend: wgpu::Backend,
    pub device_type: wgpu::DeviceType,
}

impl AdapterSummary {
    pub fn from_info(info: &wgpu::AdapterInfo) -> Self {
        Self {
            name: info.name.clone(),
            backend: info.backend,
            device_type: info.device_type,
        }
    }

    /// True for real or passed-through GPU hardware.
    pub fn is_gpu(&self) -> bool {
        matches!(
            self.device_type,
            wgpu::DeviceType::DiscreteGpu
                | wgpu::DeviceType::IntegratedGpu
                | wgpu::DeviceType::VirtualGpu
        )
    }

    fn accepted(&self, allow_software: bool) -> bool {
        self.is_gpu() || allow_software
    }
}

impl fmt::Display for AdapterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// All adapters one backend exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub name: String,
    pub adapters: Vec<AdapterSummary>,
}

/// Pick `(platform index, adapter index)`.
///
/// The platform is the first one with any adapter. Within it the first
/// GPU-class adapter wins; software adapters only count when
/// `allow_software` is set. Later platforms are never consulted once one
/// with adapters has been found.
pub fn select_adapter(platforms: &[Platform], allow_software: bool) -> Result<(usize, usize)> {
    let (platform_index, platform) = platforms
        .iter()
        .enumerate()
        .find(|(_, p)| !p.adapters.is_empty())
        .ok_or(Error::PlatformUnavailable)?;
    let adapter_index = platform
        .adapters
        .iter()
        .position(|a| a.accepted(allow_software))
        .ok_or_else(|| Error::DeviceUnavailable {
            platform: platform.name.clone(),
            adapters: platform.adapters.len(),
        })?;
    Ok((platform_index, adapter_index))
}

/// A GPU context encapsulates all state needed to submit compute work.
///
/// Fields drop in declaration order, so the queue is released before the
/// logical device, and both before the adapter and instance they came from.
pub struct GpuContext {
    /// Command submission queue used to send recorded command buffers
    /// to the GPU.
    pub queue: Queue,
    _queue_guard: ResourceGuard,
    /// Logical device used to create resources and command encoders.
    pub device: Device,
    _context_guard: ResourceGuard,
    /// The physical device selected for computation.
    pub adapter: Adapter,
    pub summary: AdapterSummary,
    /// Kept alive until the device-level objects above are gone.
    pub instance: Instance,
    tracker: ResourceTracker,
}

impl GpuContext {
    /// Create a context with the default configuration, blocking the
    /// current thread until the device is ready.
    pub fn new_blocking() -> Result<Self> {
        Self::new_blocking_with(&ContextConfig::default())
    }

    /// Create a context synchronously with an explicit configuration.
    pub fn new_blocking_with(config: &ContextConfig) -> Result<Self> {
        pollster::block_on(Self::new_async(config))
    }

    /// Create a context asynchronously. The future resolves once the
    /// logical device and queue have been granted.
    pub async fn new_async(config: &ContextConfig) -> Result<Self> {
        let instance = Instance::new(&wgpu::InstanceDescriptor {
            backends: config.backends,
            ..Default::default()
        });

        let mut platforms = Vec::new();
        let mut adapters = Vec::new();
        for (backend, name) in PLATFORM_ORDER {
            if !config.backends.contains(backend) {
                continue;
            }
            let found = instance.enumerate_adapters(backend);
            let summaries: Vec<AdapterSummary> = found
                .iter()
                .map(|a| AdapterSummary::from_info(&a.get_info()))
                .collect();
            for s in &summaries {
                debug!("{name} adapter: {s}");
            }
            platforms.push(Platform {
                name: name.to_string(),
                adapters: summaries,
            });
            adapters.push(found);
        }

        let (p, a) = select_adapter(&platforms, config.allow_software)?;
        let summary = platforms[p].adapters[a].clone();
        let adapter = adapters.swap_remove(p).swap_remove(a);
        if !summary.is_gpu() {
            log::warn!("using software adapter {summary}");
        }

        let capabilities = adapter.get_downlevel_capabilities();
        if !capabilities.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
            return Err(Error::UnsupportedDevice {
                name: summary.name.clone(),
            });
        }

        // Downlevel defaults everywhere except buffer sizes, which follow
        // the adapter so large vectors fit in a single binding.
        let adapter_limits = adapter.limits();
        let mut limits = wgpu::Limits::downlevel_defaults();
        limits.max_storage_buffer_binding_size = adapter_limits.max_storage_buffer_binding_size;
        limits.max_buffer_size = adapter_limits.max_buffer_size;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("gpu_vector_add_device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits,
                memory_hints: wgpu::MemoryHints::MemoryUsage,
                trace: wgpu::Trace::Off,
            })
            .await?;

        info!("selected {} adapter {summary}", platforms[p].name);

        let tracker = ResourceTracker::new();
        Ok(Self {
            _context_guard: tracker.acquire(ResourceKind::Context),
            _queue_guard: tracker.acquire(ResourceKind::Queue),
            queue,
            device,
            adapter,
            summary,
            instance,
            tracker,
        })
    }

    /// Counters of every device object created through this context.
    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// Largest buffer, in bytes, that can be bound as one storage binding.
    pub fn max_binding_bytes(&self) -> u64 {
        let limits = self.device.limits();
        u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size)
    }

    /// Run `f` with validation and out-of-memory errors captured instead of
    /// reaching the device's uncaptured-error handler.
    pub(crate) fn capture_errors<R>(&self, f: impl FnOnce(&Device) -> R) -> (R, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        (value, out_of_memory.or(validation))
    }
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter", &self.summary)
            .field("live", &self.tracker)
            .finish()
    }
}
