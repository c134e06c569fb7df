//! Reconstruction pipeline orchestration
//!
//! Host threads communicate exclusively through the bounded queue and ring
//! arena; device work is asynchronous behind completion handles. The
//! marching/evaluation stage is an external collaborator consuming the
//! octree buffers through [`OctreeView`] and [`FunctorConfig`], and feeding
//! partial mesh blocks back through [`MarchingStage::next_block`].

use std::io::BufRead;
use std::sync::Arc;
use std::thread;

use crate::buffer::{Allocation, RingBuffer, WorkQueue};
use crate::core::config::Config;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::gpu::{timing, GpuContext};
use crate::grid::Grid;
use crate::mesh::{MeshBlock, Mesher, MeshSink};
use crate::ply::PlyReader;
use crate::splat::Splat;
use crate::tree::{self, SplatOctree};

/// Work-group footprint of the marching/evaluation kernels; grid extents
/// are rounded to a multiple of this.
pub const MARCH_WORKGROUP: [u32; 3] = [16, 16, 1];

/// Fine levels dropped for the MLS evaluation.
pub const SUBSAMPLING_SHIFT: u32 = 2;

/// Splats checked out of the loader arena per batch.
const SPLAT_BATCH: usize = 4096;

/// Queued mesh blocks between the extraction and welding stages.
const BLOCK_QUEUE_DEPTH: usize = 4;

/// Grid-to-world mapping handed to the marching stage: separate in-slice
/// scale/bias and scalar z scale/bias, as its kernels walk slice by slice.
#[derive(Clone, Copy, Debug)]
pub struct FunctorConfig {
    pub grid_scale: [f32; 2],
    pub grid_bias: [f32; 2],
    pub z_scale: f32,
    pub z_bias: f32,
    pub subsampling_shift: u32,
    pub workgroup: [u32; 2],
}

impl FunctorConfig {
    pub fn new(grid: &Grid, subsampling_shift: u32, workgroup: [u32; 2]) -> Self {
        let (scale, bias) = grid.scale_bias();
        Self {
            grid_scale: [scale.x, scale.y],
            grid_bias: [bias.x, bias.y],
            z_scale: scale.z,
            z_bias: bias.z,
            subsampling_shift,
            workgroup,
        }
    }
}

/// The octree buffers a marching/evaluation kernel binds.
pub struct OctreeView<'a> {
    pub splats: &'a wgpu::Buffer,
    pub commands: &'a wgpu::Buffer,
    pub start: &'a wgpu::Buffer,
    pub num_levels: u32,
}

impl<'a> OctreeView<'a> {
    /// None until a build has been enqueued (or after `clear_splats`).
    pub fn new(tree: &'a SplatOctree) -> Option<Self> {
        Some(Self {
            splats: tree.splats()?,
            commands: tree.commands(),
            start: tree.start(),
            num_levels: tree.num_levels() as u32,
        })
    }
}

/// External surface-extraction stage: evaluates the MLS field per slice and
/// marches it into per-block partial meshes.
pub trait MarchingStage {
    /// Bind the octree and coordinate mapping for the coming extraction.
    fn configure(&mut self, view: OctreeView<'_>, config: &FunctorConfig) -> Result<()>;

    /// Produce the next partial mesh block, or None when extraction is
    /// complete. Called repeatedly from the orchestration thread.
    fn next_block(&mut self, queue: &wgpu::Queue) -> Result<Option<MeshBlock>>;
}

enum BlockMessage {
    Block(MeshBlock),
    Done,
}

/// Hands mesh blocks to a welding mesher running on its own thread, with a
/// bounded queue providing backpressure.
pub struct MeshPipeline<M: Mesher + Send + 'static> {
    queue: Arc<WorkQueue<BlockMessage>>,
    worker: thread::JoinHandle<Result<M>>,
}

impl<M: Mesher + Send + 'static> MeshPipeline<M> {
    pub fn new(mut mesher: M, depth: usize) -> Self {
        let queue = Arc::new(WorkQueue::new(depth));
        let worker_queue = Arc::clone(&queue);
        let worker = thread::Builder::new()
            .name("mesher".to_string())
            .spawn(move || {
                // After a failure keep draining so the producer never
                // blocks on a dead consumer; report the error at finish.
                let mut failure: Option<Error> = None;
                loop {
                    match worker_queue.pop() {
                        BlockMessage::Block(block) => {
                            if failure.is_none() {
                                if let Err(e) = mesher.submit_block(&block) {
                                    failure = Some(e);
                                }
                            }
                        }
                        BlockMessage::Done => break,
                    }
                }
                match failure {
                    Some(e) => Err(e),
                    None => Ok(mesher),
                }
            })
            .expect("failed to spawn mesher thread");
        Self { queue, worker }
    }

    /// Queue one block; blocks while the mesher is `depth` blocks behind.
    pub fn submit(&self, block: MeshBlock) {
        self.queue.push(BlockMessage::Block(block));
    }

    /// Signal end of input and hand the mesher back.
    pub fn finish(self) -> Result<M> {
        self.queue.push(BlockMessage::Done);
        match self.worker.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

enum SplatMessage {
    Batch(Allocation, usize),
    Done(Result<()>),
}

/// Stream splats out of PLY readers through a bounded arena.
///
/// A reader thread fills arena runs while the caller drains them, so parse
/// and accumulation overlap and loader memory stays capped at `arena_bytes`
/// no matter how large the inputs are.
pub fn load_splats<R: BufRead + Send + 'static>(
    readers: Vec<PlyReader<R>>,
    smoothing: f32,
    arena_bytes: usize,
) -> Result<Vec<Splat>> {
    let arena = Arc::new(RingBuffer::new("mem.splat_loader", arena_bytes));
    let queue: Arc<WorkQueue<SplatMessage>> = Arc::new(WorkQueue::new(8));

    let total_declared: u64 = readers.iter().map(|r| r.vertex_count()).sum();

    let producer = {
        let arena = Arc::clone(&arena);
        let queue = Arc::clone(&queue);
        let mut readers = readers;
        thread::Builder::new()
            .name("splat_loader".to_string())
            .spawn(move || {
                for reader in &mut readers {
                    loop {
                        let mut run =
                            match arena.allocate(std::mem::size_of::<Splat>(), SPLAT_BATCH) {
                                Ok(run) => run,
                                Err(e) => {
                                    queue.push(SplatMessage::Done(Err(e)));
                                    return;
                                }
                            };
                        let read = reader.read_batch(smoothing, run.as_mut_slice::<Splat>());
                        match read {
                            Ok(0) => {
                                arena.free(run);
                                break;
                            }
                            Ok(n) => queue.push(SplatMessage::Batch(run, n)),
                            Err(e) => {
                                arena.free(run);
                                queue.push(SplatMessage::Done(Err(e)));
                                return;
                            }
                        }
                    }
                }
                queue.push(SplatMessage::Done(Ok(())));
            })
            .expect("failed to spawn splat loader thread")
    };

    let mut splats = Vec::with_capacity(total_declared as usize);
    let result = loop {
        match queue.pop() {
            SplatMessage::Batch(run, n) => {
                splats.extend_from_slice(&run.as_slice::<Splat>()[..n]);
                arena.free(run);
            }
            SplatMessage::Done(result) => break result,
        }
    };
    match producer.join() {
        Ok(()) => {}
        Err(panic) => std::panic::resume_unwind(panic),
    }
    result?;
    Ok(splats)
}

/// Run the full reconstruction: grid fit, device octree build, surface
/// extraction through `marching`, welding, pruning and the final write.
pub fn reconstruct<M, W>(
    ctx: &GpuContext,
    splats: &[Splat],
    config: &Config,
    marching: &mut M,
    mut mesher: W,
    sink: &mut dyn MeshSink,
    name: &str,
) -> Result<()>
where
    M: MarchingStage,
    W: Mesher + Send + 'static,
{
    if splats.is_empty() {
        return Err(Error::InvalidArgument(
            "no input splats to reconstruct".to_string(),
        ));
    }
    if splats.len() > tree::MAX_SPLATS {
        return Err(Error::ResourceExhausted(format!(
            "{} splats exceed the supported maximum of {}",
            splats.len(),
            tree::MAX_SPLATS
        )));
    }
    mesher.set_prune_threshold(config.prune_threshold);

    let mut grid = Grid::fit(splats, config.fit_grid)?;
    let dims = grid.round_extents(MARCH_WORKGROUP);
    log::info!("Octree cells: {} x {} x {}", dims[0], dims[1], dims[2]);

    tree::validate_device(&ctx.adapter)?;
    let retained = dims.map(|d| d.div_ceil(1 << SUBSAMPLING_SHIFT).max(1));
    let levels = tree::level_count(retained);
    if levels > tree::MAX_LEVELS {
        return Err(Error::ResourceExhausted(format!(
            "grid of {} x {} x {} cells needs {} octree levels, the maximum is {}; \
             increase the grid spacing",
            dims[0],
            dims[1],
            dims[2],
            levels,
            tree::MAX_LEVELS
        )));
    }
    let usage = tree::resource_usage(levels, splats.len());
    usage.check(&ctx.adapter)?;
    log::info!(
        "Octree device memory: {} MiB across {} levels",
        usage.total_bytes >> 20,
        levels
    );

    let splat_buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("pipeline_splats"),
        size: std::mem::size_of_val(splats) as u64,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    ctx.queue
        .write_buffer(&splat_buffer, 0, bytemuck::cast_slice(splats));

    let mut octree = SplatOctree::new(&ctx.device, levels, splats.len())?;
    let build = octree.enqueue_build(
        &ctx.queue,
        &splat_buffer,
        0,
        splats.len(),
        dims,
        [0, 0, 0],
        &grid,
        SUBSAMPLING_SHIFT,
    );
    build.wait();

    let view = OctreeView::new(&octree)
        .ok_or_else(|| Error::Device("octree lost its splat buffer".to_string()))?;
    let functor = FunctorConfig::new(
        &grid,
        SUBSAMPLING_SHIFT,
        [MARCH_WORKGROUP[0], MARCH_WORKGROUP[1]],
    );
    marching.configure(view, &functor)?;

    let pipeline = MeshPipeline::new(mesher, BLOCK_QUEUE_DEPTH);
    loop {
        match marching.next_block(&ctx.queue) {
            Ok(Some(block)) => pipeline.submit(block),
            Ok(None) => break,
            Err(e) => {
                // Unblock the mesher thread before propagating
                let _ = pipeline.finish();
                return Err(e);
            }
        }
    }
    let mut mesher = pipeline.finish()?;
    mesher.finalize()?;
    mesher.write(sink, name)?;

    timing::flush(true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::testdata;
    use crate::mesh::{MemorySink, WeldMesher};

    fn splat_ply(records: &[(f32, f32, f32, f32)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"ply\nformat binary_little_endian 1.0\n");
        data.extend_from_slice(format!("element vertex {}\n", records.len()).as_bytes());
        data.extend_from_slice(
            b"property float x\nproperty float y\nproperty float z\nproperty float radius\nend_header\n",
        );
        for &(x, y, z, r) in records {
            for v in [x, y, z, r] {
                data.extend_from_slice(&v.to_le_bytes());
            }
        }
        data
    }

    #[test]
    fn test_load_splats_streams_in_order() {
        // Two files, an arena far smaller than the data, order preserved
        let first: Vec<_> = (0..10_000).map(|i| (i as f32, 0.0, 0.0, 1.0)).collect();
        let second: Vec<_> = (10_000..12_500).map(|i| (i as f32, 0.0, 0.0, 1.0)).collect();
        let files = [splat_ply(&first), splat_ply(&second)];
        let readers: Vec<_> = files
            .iter()
            .enumerate()
            .map(|(i, data)| {
                PlyReader::new(std::io::Cursor::new(data.clone()), &format!("file{i}.ply")).unwrap()
            })
            .collect();

        let splats = load_splats(readers, 2.0, 1 << 14).unwrap();
        assert_eq!(splats.len(), 12_500);
        for (i, splat) in splats.iter().enumerate() {
            assert_eq!(splat.position[0], i as f32);
            assert_eq!(splat.radius, 2.0);
        }
    }

    #[test]
    fn test_load_splats_propagates_format_errors() {
        let mut data = splat_ply(&[(0.0, 0.0, 0.0, 1.0), (1.0, 0.0, 0.0, 1.0)]);
        data.truncate(data.len() - 2);
        let reader = PlyReader::new(std::io::Cursor::new(data), "broken.ply").unwrap();
        let result = load_splats(vec![reader], 1.0, 1 << 12);
        match result {
            Err(Error::Format(msg)) => assert!(msg.contains("broken.ply")),
            other => panic!("expected format error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_mesh_pipeline_matches_direct_submission() {
        let blocks = vec![
            testdata::block(&testdata::INTERNAL0, &[], &[], &testdata::TRIANGLES0),
            testdata::block(
                &[],
                &testdata::EXTERNAL1,
                &testdata::KEYS1,
                &testdata::TRIANGLES1,
            ),
            testdata::block(
                &testdata::INTERNAL2,
                &testdata::EXTERNAL2,
                &testdata::KEYS2,
                &testdata::TRIANGLES2,
            ),
        ];

        let direct = testdata::run_mesher(WeldMesher::new(), &blocks);

        let pipeline = MeshPipeline::new(WeldMesher::new(), 2);
        for block in &blocks {
            pipeline.submit(block.clone());
        }
        let mut mesher = pipeline.finish().unwrap();
        mesher.finalize().unwrap();
        let mut sink = MemorySink::new();
        mesher.write(&mut sink, "out").unwrap();

        assert_eq!(direct.vertices(), sink.vertices());
        assert_eq!(direct.triangles(), sink.triangles());
    }

    #[test]
    fn test_functor_config_mapping() {
        let grid = Grid::new(crate::core::types::Vec3::new(1.0, 2.0, 3.0), 0.25, [
            [4, 19],
            [0, 15],
            [-8, 7],
        ]);
        let functor = FunctorConfig::new(&grid, 2, [16, 16]);
        assert_eq!(functor.grid_scale, [0.25, 0.25]);
        assert_eq!(functor.grid_bias, [2.0, 2.0]);
        assert_eq!(functor.z_scale, 0.25);
        assert_eq!(functor.z_bias, 1.0);
        assert_eq!(functor.subsampling_shift, 2);
    }

    /// Whole-pipeline test with a canned extraction stage; needs a GPU and
    /// skips quietly without one.
    #[test]
    fn test_reconstruct_with_stub_marching() {
        struct CannedMarching {
            blocks: Vec<MeshBlock>,
            configured: bool,
        }
        impl MarchingStage for CannedMarching {
            fn configure(&mut self, view: OctreeView<'_>, config: &FunctorConfig) -> Result<()> {
                assert!(view.num_levels >= 1);
                assert_eq!(config.workgroup, [16, 16]);
                self.configured = true;
                Ok(())
            }
            fn next_block(&mut self, _queue: &wgpu::Queue) -> Result<Option<MeshBlock>> {
                assert!(self.configured);
                Ok(self.blocks.pop())
            }
        }

        let ctx = match GpuContext::new_blocking(wgpu::PowerPreference::HighPerformance) {
            Ok(ctx) => ctx,
            Err(e) => {
                eprintln!("skipping GPU test: {e}");
                return;
            }
        };

        let splats: Vec<Splat> = (0..50)
            .map(|i| Splat::new([i as f32 * 0.02, 0.5, 0.5], 0.05))
            .collect();

        let mut marching = CannedMarching {
            blocks: vec![
                testdata::block(&testdata::INTERNAL0, &[], &[], &testdata::TRIANGLES0),
                testdata::block(
                    &[],
                    &testdata::EXTERNAL1,
                    &testdata::KEYS1,
                    &testdata::TRIANGLES1,
                ),
            ],
            configured: false,
        };

        let mut sink = MemorySink::new();
        reconstruct(
            &ctx,
            &splats,
            &Config::default(),
            &mut marching,
            WeldMesher::new(),
            &mut sink,
            "stub",
        )
        .unwrap();

        assert!(sink.is_finished());
        assert_eq!(sink.vertices().len(), 9);
        assert_eq!(sink.triangles().len(), 6);
    }
}
