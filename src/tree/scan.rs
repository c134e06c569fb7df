//! Exclusive prefix scan on the compute device
//!
//! Scans u32 buffers in place: a per-block scan records block totals, the
//! totals are scanned recursively through preallocated scratch buffers, and
//! the offsets are folded back in. All scratch is sized for the maximum
//! element count at construction; enqueueing never allocates device memory.

use bytemuck::{Pod, Zeroable};

use super::dispatch_2d;

const BLOCK: u32 = 256;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ScanParams {
    n: u32,
    _pad: [u32; 3],
}

/// Sizes of the scan arrays at each depth, starting with `n` itself.
fn depth_sizes(n: u32) -> Vec<u32> {
    let mut sizes = vec![n];
    while *sizes.last().unwrap() > BLOCK {
        let next = sizes.last().unwrap().div_ceil(BLOCK);
        sizes.push(next);
    }
    sizes
}

/// Device scratch bytes needed to scan up to `max_elements` values.
pub fn scratch_bytes(max_elements: u32) -> u64 {
    depth_sizes(max_elements)
        .iter()
        .map(|&n| n.div_ceil(BLOCK).max(1) as u64 * 4)
        .sum()
}

/// Bind groups chaining one data buffer through the scratch levels.
pub struct ScanChain {
    bind_groups: Vec<wgpu::BindGroup>,
}

pub struct PrefixScan {
    scan_pipeline: wgpu::ComputePipeline,
    add_pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    sums: Vec<wgpu::Buffer>,
    params: Vec<wgpu::Buffer>,
    max_elements: u32,
}

impl PrefixScan {
    pub fn new(device: &wgpu::Device, max_elements: u32) -> Self {
        assert!(max_elements >= 1);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("prefix_scan_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../shaders/prefix_scan.wgsl").into()),
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("prefix_scan_layout"),
            entries: &[
                storage_entry(0, false),
                storage_entry(1, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("prefix_scan_pipeline_layout"),
            bind_group_layouts: &[&layout],
            immediate_size: 0,
        });

        let make_pipeline = |entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let scan_pipeline = make_pipeline("scan_blocks");
        let add_pipeline = make_pipeline("add_offsets");

        let sizes = depth_sizes(max_elements);
        let sums: Vec<wgpu::Buffer> = sizes
            .iter()
            .map(|&n| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("scan_block_sums"),
                    size: n.div_ceil(BLOCK).max(1) as u64 * 4,
                    usage: wgpu::BufferUsages::STORAGE,
                    mapped_at_creation: false,
                })
            })
            .collect();
        let params: Vec<wgpu::Buffer> = sizes
            .iter()
            .map(|_| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("scan_params"),
                    size: std::mem::size_of::<ScanParams>() as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .collect();

        Self {
            scan_pipeline,
            add_pipeline,
            layout,
            sums,
            params,
            max_elements,
        }
    }

    pub fn max_elements(&self) -> u32 {
        self.max_elements
    }

    /// Build the bind groups linking `data` through the scratch levels.
    pub fn prepare(&self, device: &wgpu::Device, data: &wgpu::Buffer) -> ScanChain {
        let mut bind_groups = Vec::with_capacity(self.sums.len());
        for depth in 0..self.sums.len() {
            let source = if depth == 0 {
                data
            } else {
                &self.sums[depth - 1]
            };
            bind_groups.push(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("prefix_scan_bind_group"),
                layout: &self.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: source.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: self.sums[depth].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: self.params[depth].as_entire_binding(),
                    },
                ],
            }));
        }
        ScanChain { bind_groups }
    }

    /// Exclusive-scan the first `n` elements of the chained buffer in place.
    pub fn enqueue(&self, device: &wgpu::Device, queue: &wgpu::Queue, chain: &ScanChain, n: u32) {
        assert!(n >= 1 && n <= self.max_elements);
        let sizes = depth_sizes(n);
        debug_assert!(sizes.len() <= chain.bind_groups.len());

        for (depth, &size) in sizes.iter().enumerate() {
            queue.write_buffer(
                &self.params[depth],
                0,
                bytemuck::bytes_of(&ScanParams {
                    n: size,
                    _pad: [0; 3],
                }),
            );
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("prefix_scan_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("prefix_scan"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.scan_pipeline);
            for (depth, &size) in sizes.iter().enumerate() {
                pass.set_bind_group(0, &chain.bind_groups[depth], &[]);
                dispatch_2d(&mut pass, size);
            }
            pass.set_pipeline(&self.add_pipeline);
            for depth in (0..sizes.len().saturating_sub(1)).rev() {
                pass.set_bind_group(0, &chain.bind_groups[depth], &[]);
                dispatch_2d(&mut pass, sizes[depth]);
            }
        }
        queue.submit(std::iter::once(encoder.finish()));
    }
}

pub(crate) fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
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
