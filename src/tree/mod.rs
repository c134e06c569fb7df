//! GPU-resident octree over splats
//!
//! The tree is a leveled spatial index built and queried entirely in device
//! memory. Level 0 is the finest; the coarsest level has a single cell. Each
//! cell's `start` entry points into a packed command table whose entries are
//! either splat ids or jumps linking the cell's chain to its coarser-level
//! counterpart, so one linear walk retrieves every splat that can influence
//! a cell without pointer-based traversal.
//!
//! All device buffers are allocated once at the declared maximum capacity
//! and reused across builds; a build that uses fewer splats or levels leaves
//! the spare capacity untouched.

pub mod scan;
pub mod sort;

use bytemuck::{Pod, Zeroable};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::gpu::{timing, Completion};
use crate::grid::Grid;
use scan::{PrefixScan, ScanChain};
use sort::RadixSort;

/// Maximum octree levels (finest dimension 2^(MAX_LEVELS - 1)). Bounded so
/// the start array stays addressable with 32-bit cell codes.
pub const MAX_LEVELS: usize = 10;

/// Maximum splat count. Each splat can emit 8 entries plus 8 trailing jump
/// slots, and command-table indices must stay within a signed 32-bit value.
pub const MAX_SPLATS: usize = 0x7FFF_FFFF / 16;

/// Command-table entry terminating a chain.
pub const CMD_END: i32 = -1;

/// Start-array entry meaning "empty chain".
pub const START_EMPTY: i32 = -1;

/// Entry key marking an unused slot; sorts after every real cell key.
pub const KEY_SENTINEL: u32 = 0xffff_ffff;

const WORKGROUP: u32 = 256;

/// Whether a command is a jump rather than a splat id or chain end.
pub fn is_jump(command: i32) -> bool {
    command <= -2
}

/// Command-table index a jump command links to.
pub fn decode_jump(command: i32) -> u32 {
    debug_assert!(is_jump(command));
    (-command - 2) as u32
}

/// Number of levels needed to cover `dims` cells per axis.
pub fn level_count(dims: [u32; 3]) -> usize {
    let max_dim = dims.into_iter().max().unwrap().max(1);
    (max_dim - 1).checked_ilog2().map_or(0, |b| b as usize + 1) + 1
}

/// Start offset of each level in the code-indexed arrays, finest first.
/// The returned vector has `levels + 1` entries; the last is the total.
pub(crate) fn level_offsets(levels: usize) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(levels + 1);
    let mut acc = 0u32;
    offsets.push(0);
    for level in 0..levels {
        acc += 1u32 << (3 * (levels - 1 - level));
        offsets.push(acc);
    }
    offsets
}

/// Total cell codes across all levels.
pub(crate) fn total_codes(levels: usize) -> u32 {
    *level_offsets(levels).last().unwrap()
}

/// Walk one cell's chain: splat ids until a jump (continue at the coarser
/// level) or the end marker. `code` is the level-offset cell index.
pub fn collect_cell_splats(start: &[i32], commands: &[i32], code: u32) -> Vec<u32> {
    let mut out = Vec::new();
    if start[code as usize] < 0 {
        return out;
    }
    let mut pos = start[code as usize] as usize;
    loop {
        let command = commands[pos];
        if command >= 0 {
            out.push(command as u32);
            pos += 1;
        } else if command == CMD_END {
            break;
        } else {
            pos = decode_jump(command) as usize;
        }
    }
    out
}

/// Flattened 1D dispatch; kernels recover the element index from the
/// workgroup grid via num_workgroups.
pub(crate) fn dispatch_2d(pass: &mut wgpu::ComputePass<'_>, n: u32) {
    let groups = n.div_ceil(WORKGROUP).max(1);
    let x = groups.min(32768);
    let y = groups.div_ceil(x);
    pass.dispatch_workgroups(x, y, 1);
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct BuildParams {
    num_splats: u32,
    first_splat: u32,
    num_entries: u32,
    num_levels: u32,
    size: [u32; 3],
    shift: u32,
    offset: [i32; 3],
    total_codes: u32,
    inv_spacing: f32,
    bias: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct LevelParams {
    cur_offset: u32,
    prev_offset: u32,
    num_codes: u32,
    _pad: u32,
}

/// Estimated device memory footprint of a [`SplatOctree`].
#[derive(Clone, Copy, Debug)]
pub struct ResourceUsage {
    pub total_bytes: u64,
    pub largest_buffer: u64,
}

impl ResourceUsage {
    /// Fail fast with `ResourceExhausted` if the device cannot hold the
    /// estimated buffers.
    pub fn check(&self, adapter: &wgpu::Adapter) -> Result<()> {
        let limits = adapter.limits();
        if self.largest_buffer > limits.max_storage_buffer_binding_size as u64
            || self.largest_buffer > limits.max_buffer_size
        {
            return Err(Error::ResourceExhausted(format!(
                "octree needs a {} MiB buffer but the device caps bindings at {} MiB",
                self.largest_buffer >> 20,
                limits
                    .max_buffer_size
                    .min(limits.max_storage_buffer_binding_size as u64)
                    >> 20,
            )));
        }
        Ok(())
    }
}

/// Estimate the device memory needed for the given capacities.
///
/// Callers should check the result against the device before construction.
/// Preconditions: `1 <= max_levels <= MAX_LEVELS`, `1 <= max_splats <=
/// MAX_SPLATS`.
pub fn resource_usage(max_levels: usize, max_splats: usize) -> ResourceUsage {
    assert!((1..=MAX_LEVELS).contains(&max_levels));
    assert!((1..=MAX_SPLATS).contains(&max_splats));

    let codes = total_codes(max_levels) as u64;
    let entries = 8 * max_splats as u64;
    let buffers = [
        codes * 4,                           // start
        codes * 4,                           // jump positions
        16 * max_splats as u64 * 4,          // command table
        entries * 4,                         // entry keys A
        entries * 4,                         // entry keys B
        entries * 4,                         // entry values A
        entries * 4,                         // entry values B
        entries * 4,                         // command map
        sort::scratch_bytes(entries as u32), // digit histograms
        scan::scratch_bytes(entries as u32), // scan block sums
    ];
    ResourceUsage {
        total_bytes: buffers.iter().sum(),
        largest_buffer: buffers.into_iter().max().unwrap(),
    }
}

/// Check device capabilities needed by the octree and its consumers.
pub fn validate_device(adapter: &wgpu::Adapter) -> Result<()> {
    let caps = adapter.get_downlevel_capabilities();
    if !caps.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
        return Err(Error::UnsupportedDevice(
            "compute shaders are not supported".to_string(),
        ));
    }
    let limits = adapter.limits();
    if limits.max_storage_buffers_per_shader_stage < 8 {
        return Err(Error::UnsupportedDevice(format!(
            "need 8 storage buffers per stage, device has {}",
            limits.max_storage_buffers_per_shader_stage
        )));
    }
    if limits.max_compute_workgroup_size_x < WORKGROUP
        || limits.max_compute_invocations_per_workgroup < WORKGROUP
    {
        return Err(Error::UnsupportedDevice(format!(
            "need {}-wide workgroups, device allows {}",
            WORKGROUP, limits.max_compute_workgroup_size_x
        )));
    }
    Ok(())
}

/// The octree builder and its backing device storage.
pub struct SplatOctree {
    device: wgpu::Device,
    max_levels: usize,
    max_splats: usize,

    splats: Option<wgpu::Buffer>,
    start: wgpu::Buffer,
    commands: wgpu::Buffer,

    entry_keys: [wgpu::Buffer; 2],
    entry_values: [wgpu::Buffer; 2],
    command_map: wgpu::Buffer,
    jump_pos: wgpu::Buffer,
    level_offsets_buf: wgpu::Buffer,
    build_params: wgpu::Buffer,
    level_params: Vec<wgpu::Buffer>,

    build_layout: wgpu::BindGroupLayout,
    write_entries_pipeline: wgpu::ComputePipeline,
    count_commands_pipeline: wgpu::ComputePipeline,
    write_splat_ids_pipeline: wgpu::ComputePipeline,
    write_start_pipeline: wgpu::ComputePipeline,
    write_start_top_pipeline: wgpu::ComputePipeline,
    fill_start_pipeline: wgpu::ComputePipeline,
    fill_jump_pipeline: wgpu::ComputePipeline,
    level_bind_groups: Vec<wgpu::BindGroup>,

    scan: PrefixScan,
    sort: RadixSort,
    map_chain: ScanChain,

    num_splats: usize,
    level_offsets: Vec<u32>,
}

impl SplatOctree {
    /// Allocate every buffer at the maximum supported size. Nothing is
    /// populated until [`enqueue_build`](Self::enqueue_build).
    pub fn new(device: &wgpu::Device, max_levels: usize, max_splats: usize) -> Result<Self> {
        assert!((1..=MAX_LEVELS).contains(&max_levels));
        assert!((1..=MAX_SPLATS).contains(&max_splats));

        let codes = total_codes(max_levels) as u64;
        let entries = 8 * max_splats as u64;

        let storage = |label: &str, bytes: u64| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: bytes,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };

        let start = storage("octree_start", codes * 4);
        let jump_pos = storage("octree_jump_pos", codes * 4);
        let commands = storage("octree_commands", 16 * max_splats as u64 * 4);
        let entry_keys = [
            storage("octree_entry_keys_a", entries * 4),
            storage("octree_entry_keys_b", entries * 4),
        ];
        let entry_values = [
            storage("octree_entry_values_a", entries * 4),
            storage("octree_entry_values_b", entries * 4),
        ];
        let command_map = storage("octree_command_map", entries * 4);

        let level_offsets_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("octree_level_offsets"),
            size: (MAX_LEVELS as u64 + 1) * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let build_params = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("octree_build_params"),
            size: std::mem::size_of::<BuildParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let level_params: Vec<wgpu::Buffer> = (0..max_levels)
            .map(|_| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("octree_level_params"),
                    size: std::mem::size_of::<LevelParams>() as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .collect();

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("octree_build_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../shaders/octree_build.wgsl").into()),
        });

        let build_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("octree_build_layout"),
            entries: &[
                scan::storage_entry(0, true),
                scan::storage_entry(1, false),
                scan::storage_entry(2, false),
                scan::storage_entry(3, true),
                scan::storage_entry(4, false),
                scan::storage_entry(5, false),
                scan::storage_entry(6, false),
                scan::storage_entry(7, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 8,
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
        let level_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("octree_level_layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let build_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("octree_build_pipeline_layout"),
                bind_group_layouts: &[&build_layout],
                immediate_size: 0,
            });
        let level_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("octree_level_pipeline_layout"),
                bind_group_layouts: &[&build_layout, &level_layout],
                immediate_size: 0,
            });

        let make_pipeline = |layout: &wgpu::PipelineLayout, entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(layout),
                module: &shader,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let write_entries_pipeline = make_pipeline(&build_pipeline_layout, "write_entries");
        let count_commands_pipeline = make_pipeline(&build_pipeline_layout, "count_commands");
        let write_splat_ids_pipeline = make_pipeline(&build_pipeline_layout, "write_splat_ids");
        let write_start_pipeline = make_pipeline(&level_pipeline_layout, "write_start");
        let write_start_top_pipeline = make_pipeline(&level_pipeline_layout, "write_start_top");
        let fill_start_pipeline = make_pipeline(&build_pipeline_layout, "fill_start");
        let fill_jump_pipeline = make_pipeline(&build_pipeline_layout, "fill_jump");

        let level_bind_groups: Vec<wgpu::BindGroup> = level_params
            .iter()
            .map(|param| {
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("octree_level_bind_group"),
                    layout: &level_layout,
                    entries: &[wgpu::BindGroupEntry {
                        binding: 0,
                        resource: param.as_entire_binding(),
                    }],
                })
            })
            .collect();

        let scan = PrefixScan::new(device, entries as u32);
        let sort = RadixSort::new(device, entries as u32, &entry_keys, &entry_values, &scan);
        let map_chain = scan.prepare(device, &command_map);

        Ok(Self {
            device: device.clone(),
            max_levels,
            max_splats,
            splats: None,
            start,
            commands,
            entry_keys,
            entry_values,
            command_map,
            jump_pos,
            level_offsets_buf,
            build_params,
            level_params,
            build_layout,
            write_entries_pipeline,
            count_commands_pipeline,
            write_splat_ids_pipeline,
            write_start_pipeline,
            write_start_top_pipeline,
            fill_start_pipeline,
            fill_jump_pipeline,
            level_bind_groups,
            scan,
            sort,
            map_chain,
            num_splats: 0,
            level_offsets: Vec::new(),
        })
    }

    /// Asynchronously build the octree over `splats[first..first + num]`,
    /// discarding any previous contents.
    ///
    /// `size` and `offset` place the octree region within `grid`;
    /// `subsampling_shift` drops that many fine levels. The splat buffer is
    /// not copied; it becomes the tree's backing store. The returned
    /// completion fires when the tree is ready to traverse. A build must
    /// not be enqueued while a previous build or any traversal is still in
    /// flight; that exclusion is the caller's responsibility.
    pub fn enqueue_build(
        &mut self,
        queue: &wgpu::Queue,
        splats: &wgpu::Buffer,
        first_splat: usize,
        num_splats: usize,
        size: [u32; 3],
        offset: [i32; 3],
        grid: &Grid,
        subsampling_shift: u32,
    ) -> Completion {
        assert!(num_splats >= 1 && num_splats <= self.max_splats);
        let dims = size.map(|s| s.div_ceil(1 << subsampling_shift).max(1));
        let levels = level_count(dims);
        assert!(
            levels <= self.max_levels,
            "build of {:?} cells needs {} levels, allocated {}",
            dims,
            levels,
            self.max_levels
        );

        self.num_splats = num_splats;
        self.level_offsets = level_offsets(levels);
        self.splats = Some(splats.clone());

        let total = self.level_offsets[levels];
        let num_entries = 8 * num_splats as u32;
        let (_, bias) = grid.scale_bias();

        queue.write_buffer(
            &self.level_offsets_buf,
            0,
            bytemuck::cast_slice(&self.level_offsets),
        );
        queue.write_buffer(
            &self.build_params,
            0,
            bytemuck::bytes_of(&BuildParams {
                num_splats: num_splats as u32,
                first_splat: first_splat as u32,
                num_entries,
                num_levels: levels as u32,
                size,
                shift: subsampling_shift,
                offset,
                total_codes: total,
                inv_spacing: 1.0 / grid.spacing(),
                bias: bias.to_array(),
            }),
        );
        for level in 0..levels {
            queue.write_buffer(
                &self.level_params[level],
                0,
                bytemuck::bytes_of(&LevelParams {
                    cur_offset: self.level_offsets[level],
                    prev_offset: self.level_offsets[level + 1],
                    num_codes: 1 << (3 * (levels - 1 - level)),
                    _pad: 0,
                }),
            );
        }

        let build_bind = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("octree_build_bind_group"),
            layout: &self.build_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: splats.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.entry_keys[0].as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.entry_values[0].as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: self.level_offsets_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: self.command_map.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: self.commands.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: self.start.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: self.jump_pos.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 8,
                    resource: self.build_params.as_entire_binding(),
                },
            ],
        });

        // Pass 1: reset tables, emit entries
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("octree_entries_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("octree_entries"),
                timestamp_writes: None,
            });
            pass.set_bind_group(0, &build_bind, &[]);
            pass.set_pipeline(&self.fill_start_pipeline);
            dispatch_2d(&mut pass, total);
            pass.set_pipeline(&self.fill_jump_pipeline);
            dispatch_2d(&mut pass, total);
            pass.set_pipeline(&self.write_entries_pipeline);
            dispatch_2d(&mut pass, num_splats as u32);
        }
        queue.submit(std::iter::once(encoder.finish()));
        timing::time_completion(Completion::new(&self.device, queue), "tree.entries");

        // Pass 2: sort entries by cell key
        self.sort.enqueue(&self.device, queue, &self.scan, num_entries);
        timing::time_completion(Completion::new(&self.device, queue), "tree.sort");

        // Pass 3: slot counts and their exclusive scan
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("octree_count_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("octree_count"),
                timestamp_writes: None,
            });
            pass.set_bind_group(0, &build_bind, &[]);
            pass.set_pipeline(&self.count_commands_pipeline);
            dispatch_2d(&mut pass, num_entries);
        }
        queue.submit(std::iter::once(encoder.finish()));
        self.scan
            .enqueue(&self.device, queue, &self.map_chain, num_entries);

        // Pass 4: command table and per-level starts, coarsest level first
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("octree_commands_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("octree_commands"),
                timestamp_writes: None,
            });
            pass.set_bind_group(0, &build_bind, &[]);
            pass.set_pipeline(&self.write_splat_ids_pipeline);
            dispatch_2d(&mut pass, num_entries);
            for level in (0..levels).rev() {
                pass.set_bind_group(1, &self.level_bind_groups[level], &[]);
                if level == levels - 1 {
                    pass.set_pipeline(&self.write_start_top_pipeline);
                } else {
                    pass.set_pipeline(&self.write_start_pipeline);
                }
                dispatch_2d(&mut pass, 1 << (3 * (levels - 1 - level)));
            }
        }
        queue.submit(std::iter::once(encoder.finish()));

        let completion = Completion::new(&self.device, queue);
        timing::time_completion(completion.clone(), "tree.commands");
        completion
    }

    /// Drop the reference to the splat buffer. The tree is unusable until
    /// the next [`enqueue_build`](Self::enqueue_build).
    pub fn clear_splats(&mut self) {
        self.splats = None;
        self.num_splats = 0;
    }

    /// Backing splat buffer, if a build has been enqueued.
    pub fn splats(&self) -> Option<&wgpu::Buffer> {
        self.splats.as_ref()
    }

    /// Command table. Contents are meaningful once a build has completed.
    pub fn commands(&self) -> &wgpu::Buffer {
        &self.commands
    }

    /// Per-cell chain starts, level-offset indexed.
    pub fn start(&self) -> &wgpu::Buffer {
        &self.start
    }

    /// Levels in the current tree (0 before any build).
    pub fn num_levels(&self) -> usize {
        self.level_offsets.len().saturating_sub(1)
    }

    /// Level start offsets of the current tree, finest first.
    pub fn level_offsets(&self) -> &[u32] {
        &self.level_offsets
    }

    pub fn num_splats(&self) -> usize {
        self.num_splats
    }

    pub fn max_splats(&self) -> usize {
        self.max_splats
    }
}
