//! Radix sort of (key, value) pairs on the compute device
//!
//! 4-bit least-significant-digit passes over 32-bit keys, ping-ponging
//! between two key/value buffer pairs. Each pass histograms digits per
//! workgroup, exclusive-scans the digit-major table with [`PrefixScan`],
//! and scatters stably. Eight passes leave the sorted data back in the
//! first buffer pair.

use bytemuck::{Pod, Zeroable};

use super::dispatch_2d;
use super::scan::{storage_entry, PrefixScan, ScanChain};

const BLOCK: u32 = 256;
const DIGITS: u32 = 16;
const PASSES: usize = 8;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct SortParams {
    n: u32,
    shift: u32,
    _pad: [u32; 2],
}

/// Device bytes for the histogram table at `max_elements`.
pub fn scratch_bytes(max_elements: u32) -> u64 {
    (DIGITS * max_elements.div_ceil(BLOCK)) as u64 * 4
}

pub struct RadixSort {
    hist_pipeline: wgpu::ComputePipeline,
    scatter_pipeline: wgpu::ComputePipeline,
    hist: wgpu::Buffer,
    params: Vec<wgpu::Buffer>,
    bind_groups: Vec<wgpu::BindGroup>,
    hist_chain: ScanChain,
    max_elements: u32,
}

impl RadixSort {
    /// `keys`/`values` are the ping-pong buffer pairs the octree owns; the
    /// sorter only adds the histogram table and its bind groups.
    pub fn new(
        device: &wgpu::Device,
        max_elements: u32,
        keys: &[wgpu::Buffer; 2],
        values: &[wgpu::Buffer; 2],
        scan: &PrefixScan,
    ) -> Self {
        assert!(max_elements >= 1);
        assert!(DIGITS * max_elements.div_ceil(BLOCK) <= scan.max_elements());

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("radix_sort_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../shaders/radix_sort.wgsl").into()),
        });

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("radix_sort_layout"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, false),
                storage_entry(3, false),
                storage_entry(4, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
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
            label: Some("radix_sort_pipeline_layout"),
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
        let hist_pipeline = make_pipeline("histogram");
        let scatter_pipeline = make_pipeline("scatter");

        let hist = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("radix_sort_histograms"),
            size: scratch_bytes(max_elements),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut params = Vec::with_capacity(PASSES);
        let mut bind_groups = Vec::with_capacity(PASSES);
        for pass in 0..PASSES {
            let param = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("radix_sort_params"),
                size: std::mem::size_of::<SortParams>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            // Even passes read pair 0, odd passes read pair 1
            let src = pass % 2;
            let dst = 1 - src;
            bind_groups.push(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("radix_sort_bind_group"),
                layout: &layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: keys[src].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: values[src].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: keys[dst].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: values[dst].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: hist.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: param.as_entire_binding(),
                    },
                ],
            }));
            params.push(param);
        }

        let hist_chain = scan.prepare(device, &hist);

        Self {
            hist_pipeline,
            scatter_pipeline,
            hist,
            params,
            bind_groups,
            hist_chain,
            max_elements,
        }
    }

    /// Sort the first `n` pairs by key. The result lands in buffer pair 0.
    pub fn enqueue(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        scan: &PrefixScan,
        n: u32,
    ) {
        assert!(n >= 1 && n <= self.max_elements);
        let num_groups = n.div_ceil(BLOCK);
        let hist_len = DIGITS * num_groups;

        for pass in 0..PASSES {
            queue.write_buffer(
                &self.params[pass],
                0,
                bytemuck::bytes_of(&SortParams {
                    n,
                    shift: pass as u32 * 4,
                    _pad: [0; 2],
                }),
            );

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("radix_sort_histogram_encoder"),
            });
            encoder.clear_buffer(&self.hist, 0, Some(hist_len as u64 * 4));
            {
                let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("radix_sort_histogram"),
                    timestamp_writes: None,
                });
                cpass.set_pipeline(&self.hist_pipeline);
                cpass.set_bind_group(0, &self.bind_groups[pass], &[]);
                dispatch_2d(&mut cpass, n);
            }
            queue.submit(std::iter::once(encoder.finish()));

            scan.enqueue(device, queue, &self.hist_chain, hist_len);

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("radix_sort_scatter_encoder"),
            });
            {
                let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("radix_sort_scatter"),
                    timestamp_writes: None,
                });
                cpass.set_pipeline(&self.scatter_pipeline);
                cpass.set_bind_group(0, &self.bind_groups[pass], &[]);
                dispatch_2d(&mut cpass, n);
            }
            queue.submit(std::iter::once(encoder.finish()));
        }
    }
}
