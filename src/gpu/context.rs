//! Headless GPU compute context

use crate::core::error::Error;
use crate::core::types::Result;

/// GPU compute context: one adapter, one device, one queue.
///
/// The pipeline assumes a single compute device with queue-ordered
/// asynchronous execution; there is no multi-device balancing.
pub struct GpuContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Create a compute context on the preferred adapter.
    pub async fn new(power_preference: wgpu::PowerPreference) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::Device(format!("no suitable adapter found: {:?}", e)))?;

        let info = adapter.get_info();
        log::info!("Using device {} ({:?})", info.name, info.backend);

        let adapter_limits = adapter.limits();
        let device_desc = wgpu::DeviceDescriptor {
            label: Some("splatsurf_device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits {
                max_storage_buffers_per_shader_stage: 8,
                max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
                max_buffer_size: adapter_limits.max_buffer_size,
                ..Default::default()
            },
            memory_hints: wgpu::MemoryHints::Performance,
            experimental_features: Default::default(),
            trace: Default::default(),
        };

        let (device, queue) = adapter
            .request_device(&device_desc)
            .await
            .map_err(|e| Error::Device(e.to_string()))?;

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
        })
    }

    /// Blocking variant of [`GpuContext::new`].
    pub fn new_blocking(power_preference: wgpu::PowerPreference) -> Result<Self> {
        pollster::block_on(Self::new(power_preference))
    }
}
