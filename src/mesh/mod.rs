//! Mesh assembly from per-block surface extraction
//!
//! The marching stage emits one partial mesh per spatial block. Vertices on
//! block boundaries carry 64-bit keys shared across blocks; the welding
//! engine unions them, prunes undersized connected components, and streams
//! the final mesh to a sink.

pub mod sink;
pub mod spill;
pub mod union_find;
pub mod weld;

pub use sink::{MemorySink, MeshSink};
pub use spill::SpillMesher;
pub use weld::{SimpleMesher, WeldMesher};

/// One block's partial mesh.
///
/// Triangle indices use a local 0-based numbering in which internal vertices
/// precede external vertices. Each external vertex carries a key that is
/// globally unique per physical point, so two blocks emitting the same key
/// describe the same output vertex.
#[derive(Clone, Debug, Default)]
pub struct MeshBlock {
    pub internal_vertices: Vec<[f32; 3]>,
    pub external_vertices: Vec<[f32; 3]>,
    pub external_keys: Vec<u64>,
    pub triangles: Vec<[u32; 3]>,
}

impl MeshBlock {
    pub fn vertex_count(&self) -> usize {
        self.internal_vertices.len() + self.external_vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertex_count() == 0 && self.triangles.is_empty()
    }
}

/// Lifecycle of a mesher: blocks are accepted, then the mesh is finalized
/// (welded ids frozen, pruning applied), then written exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MesherState {
    Accepting,
    Finalized,
    Written,
}

/// Consumer of partial mesh blocks.
///
/// Blocks may arrive in any order and may be submitted from a different
/// thread than the one that finalizes and writes. Calling `submit_block`
/// after `finalize`, or `write` twice, is a usage error and panics.
pub trait Mesher {
    /// Set the minimum component size as a fraction of total output
    /// vertices. Must be called before the first block is submitted.
    fn set_prune_threshold(&mut self, fraction: f64);

    fn prune_threshold(&self) -> f64;

    /// Fold one block into the weld state.
    fn submit_block(&mut self, block: &MeshBlock) -> crate::core::types::Result<()>;

    /// Freeze the vertex numbering and apply component pruning.
    fn finalize(&mut self) -> crate::core::types::Result<()>;

    /// Stream the surviving mesh to `sink` under the given output name.
    fn write(&mut self, sink: &mut dyn MeshSink, name: &str) -> crate::core::types::Result<()>;
}

/// Cut-off for pruning: a component survives when its vertex count is at
/// least `trunc(fraction * total_vertices)`.
pub(crate) fn prune_limit(fraction: f64, total_vertices: u64) -> u64 {
    (fraction * total_vertices as f64) as u64
}

#[cfg(test)]
pub(crate) mod testdata {
    //! Shared fixtures and the isomorphism check used by every mesher test.

    use super::sink::MemorySink;
    use super::{MeshBlock, Mesher};
    use std::collections::HashMap;

    pub fn block(
        internal: &[[f32; 3]],
        external: &[[f32; 3]],
        keys: &[u64],
        triangles: &[[u32; 3]],
    ) -> MeshBlock {
        assert_eq!(external.len(), keys.len());
        MeshBlock {
            internal_vertices: internal.to_vec(),
            external_vertices: external.to_vec(),
            external_keys: keys.to_vec(),
            triangles: triangles.to_vec(),
        }
    }

    pub const INTERNAL0: [[f32; 3]; 5] = [
        [0.0, 0.0, 1.0],
        [0.0, 0.0, 2.0],
        [0.0, 0.0, 3.0],
        [0.0, 0.0, 4.0],
        [0.0, 0.0, 5.0],
    ];
    pub const TRIANGLES0: [[u32; 3]; 3] = [[0, 1, 3], [1, 2, 3], [3, 4, 0]];

    pub const EXTERNAL1: [[f32; 3]; 4] = [
        [1.0, 0.0, 1.0],
        [1.0, 0.0, 2.0],
        [1.0, 0.0, 3.0],
        [1.0, 0.0, 4.0],
    ];
    pub const KEYS1: [u64; 4] = [0, 0x8000000000000000, 1, 0x8000000000000001];
    pub const TRIANGLES1: [[u32; 3]; 3] = [[0, 1, 3], [1, 2, 3], [2, 0, 3]];

    pub const INTERNAL2: [[f32; 3]; 3] = [[0.0, 1.0, 0.0], [0.0, 2.0, 0.0], [0.0, 3.0, 0.0]];
    pub const EXTERNAL2: [[f32; 3]; 2] = [[2.0, 0.0, 1.0], [2.0, 0.0, 2.0]];
    pub const KEYS2: [u64; 2] = [0x1234567812345678, 0x12345678];
    pub const TRIANGLES2: [[u32; 3]; 5] =
        [[0, 1, 3], [1, 4, 3], [2, 3, 4], [0, 2, 4], [0, 3, 2]];

    // Block sharing keys with blocks 1 and 2, for the weld test
    pub const INTERNAL3: [[f32; 3]; 1] = [[3.0, 3.0, 3.0]];
    pub const EXTERNAL3: [[f32; 3]; 4] = [
        [4.0, 5.0, 6.0],
        [1.0, 0.0, 2.0],
        [1.0, 0.0, 3.0],
        [2.0, 0.0, 2.0],
    ];
    pub const KEYS3: [u64; 4] = [100, 0x8000000000000000, 1, 0x12345678];
    pub const TRIANGLES3: [[u32; 3]; 3] = [[0, 2, 1], [1, 2, 4], [4, 2, 3]];

    /// Rotation of a triangle to a canonical form (reflections stay distinct)
    pub fn canonical_triangle(t: [u32; 3]) -> [u32; 3] {
        let rotations = [t, [t[1], t[2], t[0]], [t[2], t[0], t[1]]];
        *rotations.iter().min().unwrap()
    }

    fn float_key(v: [f32; 3]) -> [u32; 3] {
        [v[0].to_bits(), v[1].to_bits(), v[2].to_bits()]
    }

    /// Assert that the produced mesh is isomorphic to the expected one:
    /// vertices and triangles may be permuted and triangles rotated, but
    /// never reflected.
    pub fn check_isomorphic(
        expected_vertices: &[[f32; 3]],
        expected_triangles: &[[u32; 3]],
        actual: &MemorySink,
    ) {
        assert!(actual.is_finished());
        assert_eq!(expected_vertices.len(), actual.vertices().len());
        assert_eq!(expected_triangles.len(), actual.triangles().len());

        let mut vertex_map = HashMap::new();
        for (i, &v) in expected_vertices.iter().enumerate() {
            let inserted = vertex_map.insert(float_key(v), i as u32).is_none();
            assert!(inserted, "expected vertices must be unique");
        }

        let mut triangle_counts: HashMap<[u32; 3], i64> = HashMap::new();
        for &t in expected_triangles {
            *triangle_counts.entry(canonical_triangle(t)).or_default() += 1;
        }

        for &v in actual.vertices() {
            assert!(
                vertex_map.contains_key(&float_key(v)),
                "unexpected vertex {:?}",
                v
            );
        }

        for &t in actual.triangles() {
            let mapped = t.map(|i| {
                assert!((i as usize) < actual.vertices().len());
                vertex_map[&float_key(actual.vertices()[i as usize])]
            });
            *triangle_counts
                .entry(canonical_triangle(mapped))
                .or_default() -= 1;
        }

        for (t, count) in triangle_counts {
            assert_eq!(count, 0, "triangle mismatch for {:?}", t);
        }
    }

    /// Drive a mesher over blocks and collect the output.
    pub fn run_mesher<M: Mesher>(mut mesher: M, blocks: &[MeshBlock]) -> MemorySink {
        for b in blocks {
            mesher.submit_block(b).unwrap();
        }
        mesher.finalize().unwrap();
        let mut sink = MemorySink::new();
        mesher.write(&mut sink, "out").unwrap();
        sink
    }

    /// Behavior every mesher must satisfy, welding or not. The blocks here
    /// share no keys, so concatenation and welding agree.
    pub fn exercise_base_cases<M: Mesher, F: Fn() -> M>(factory: F) {
        // Three disjoint blocks
        {
            let blocks = vec![
                block(&INTERNAL0, &[], &[], &TRIANGLES0),
                block(&[], &EXTERNAL1, &KEYS1, &TRIANGLES1),
                block(&INTERNAL2, &EXTERNAL2, &KEYS2, &TRIANGLES2),
            ];
            let expected_vertices: Vec<[f32; 3]> = INTERNAL0
                .iter()
                .chain(EXTERNAL1.iter())
                .chain(INTERNAL2.iter())
                .chain(EXTERNAL2.iter())
                .copied()
                .collect();
            let expected_triangles = [
                [0, 1, 3],
                [1, 2, 3],
                [3, 4, 0],
                [5, 6, 8],
                [6, 7, 8],
                [7, 5, 8],
                [9, 10, 12],
                [10, 13, 12],
                [11, 12, 13],
                [9, 11, 13],
                [9, 12, 11],
            ];
            let sink = run_mesher(factory(), &blocks);
            check_isomorphic(&expected_vertices, &expected_triangles, &sink);
        }

        // Only external vertices (degenerate triangles included)
        {
            let triangles2 = [[0, 1, 1], [0, 0, 1]];
            let blocks = vec![
                block(&[], &EXTERNAL1, &KEYS1, &TRIANGLES1),
                block(&[], &EXTERNAL2, &KEYS2, &triangles2),
            ];
            let expected_vertices: Vec<[f32; 3]> =
                EXTERNAL1.iter().chain(EXTERNAL2.iter()).copied().collect();
            let expected_triangles =
                [[0, 1, 3], [1, 2, 3], [2, 0, 3], [4, 5, 5], [4, 4, 5]];
            let sink = run_mesher(factory(), &blocks);
            check_isomorphic(&expected_vertices, &expected_triangles, &sink);
        }

        // Only internal vertices (a triangle and its reflection stay distinct)
        {
            let triangles2 = [[0, 1, 2], [2, 1, 0]];
            let blocks = vec![
                block(&INTERNAL0, &[], &[], &TRIANGLES0),
                block(&INTERNAL2, &[], &[], &triangles2),
            ];
            let expected_vertices: Vec<[f32; 3]> =
                INTERNAL0.iter().chain(INTERNAL2.iter()).copied().collect();
            let expected_triangles = [
                [0, 1, 3],
                [1, 2, 3],
                [3, 4, 0],
                [5, 6, 7],
                [7, 6, 5],
            ];
            let sink = run_mesher(factory(), &blocks);
            check_isomorphic(&expected_vertices, &expected_triangles, &sink);
        }

        // No blocks at all
        {
            let sink = run_mesher(factory(), &[]);
            assert!(sink.vertices().is_empty());
            assert!(sink.triangles().is_empty());
            assert!(sink.is_finished());
        }
    }

    fn weld_blocks() -> Vec<MeshBlock> {
        vec![
            block(&INTERNAL0, &[], &[], &TRIANGLES0),
            block(&[], &EXTERNAL1, &KEYS1, &TRIANGLES1),
            block(&INTERNAL2, &EXTERNAL2, &KEYS2, &TRIANGLES2),
            block(&INTERNAL3, &EXTERNAL3, &KEYS3, &TRIANGLES3),
        ]
    }

    fn weld_expected() -> (Vec<[f32; 3]>, Vec<[u32; 3]>) {
        let vertices: Vec<[f32; 3]> = INTERNAL0
            .iter()
            .chain(EXTERNAL1.iter())
            .chain(INTERNAL2.iter())
            .chain(EXTERNAL2.iter())
            .copied()
            .chain([[3.0, 3.0, 3.0], [4.0, 5.0, 6.0]])
            .collect();
        let triangles = vec![
            [0, 1, 3],
            [1, 2, 3],
            [3, 4, 0],
            [5, 6, 8],
            [6, 7, 8],
            [7, 5, 8],
            [9, 10, 12],
            [10, 13, 12],
            [11, 12, 13],
            [9, 11, 13],
            [9, 12, 11],
            [14, 6, 15],
            [15, 6, 13],
            [13, 6, 7],
        ];
        (vertices, triangles)
    }

    /// Welding and pruning behavior shared by the in-memory and out-of-core
    /// meshers.
    pub fn exercise_weld_cases<M: Mesher, F: Fn() -> M>(factory: F) {
        let (expected_vertices, expected_triangles) = weld_expected();

        // Shared keys weld across blocks
        let sink = run_mesher(factory(), &weld_blocks());
        check_isomorphic(&expected_vertices, &expected_triangles, &sink);

        // Submission order does not matter
        let mut reversed = weld_blocks();
        reversed.reverse();
        let sink = run_mesher(factory(), &reversed);
        check_isomorphic(&expected_vertices, &expected_triangles, &sink);

        // Splitting a block into sub-blocks along the same keys is a no-op
        let split_a = block(
            &[],
            &[EXTERNAL1[0], EXTERNAL1[1], EXTERNAL1[3]],
            &[KEYS1[0], KEYS1[1], KEYS1[3]],
            &[[0, 1, 2]],
        );
        let split_b = block(&[], &EXTERNAL1, &KEYS1, &[[1, 2, 3], [2, 0, 3]]);
        let blocks = vec![
            block(&INTERNAL0, &[], &[], &TRIANGLES0),
            split_a,
            split_b,
            block(&INTERNAL2, &EXTERNAL2, &KEYS2, &TRIANGLES2),
            block(&INTERNAL3, &EXTERNAL3, &KEYS3, &TRIANGLES3),
        ];
        let sink = run_mesher(factory(), &blocks);
        check_isomorphic(&expected_vertices, &expected_triangles, &sink);

        exercise_prune_case(factory);
    }

    /// Four components sized 5, 6, 5 (split across two blocks) and 6 (split
    /// across four blocks); with a cut of 6 vertices only the size-6
    /// components survive.
    fn exercise_prune_case<M: Mesher, F: Fn() -> M>(factory: F) {
        let block0 = block(
            &[
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [2.0, 0.0, 0.0],
                [3.0, 0.0, 0.0],
                [4.0, 0.0, 0.0],
            ],
            &[[0.0, 3.0, 0.0], [1.0, 3.0, 0.0], [2.0, 3.0, 0.0]],
            &[0x30, 0x31, 0x32],
            &[[0, 4, 1], [1, 4, 2], [2, 4, 3], [5, 7, 6]],
        );
        let block1 = block(
            &[
                [0.0, 1.0, 0.0],
                [1.0, 1.0, 0.0],
                [2.0, 1.0, 0.0],
                [3.0, 1.0, 0.0],
                [4.0, 1.0, 0.0],
                [5.0, 1.0, 0.0],
                [0.0, 2.0, 0.0],
                [3.0, 2.0, 0.0],
            ],
            &[
                [2.0, 2.0, 0.0],
                [4.0, 2.0, 0.0],
                [0.0, 3.0, 0.0],
                [2.0, 3.0, 0.0],
                [4.0, 3.0, 0.0],
            ],
            &[0x22, 0x24, 0x30, 0x32, 0x34],
            &[
                [0, 5, 1],
                [1, 5, 2],
                [2, 5, 3],
                [3, 5, 4],
                [6, 7, 9],
                [9, 7, 8],
                [10, 12, 11],
            ],
        );
        let block2 = block(
            &[],
            &[[1.0, 3.0, 0.0], [2.0, 3.0, 0.0], [3.0, 3.0, 0.0]],
            &[0x31, 0x32, 0x33],
            &[[0, 1, 2]],
        );
        let block3 = block(
            &[[1.0, 2.0, 0.0], [5.0, 3.0, 0.0]],
            &[
                [2.0, 2.0, 0.0],
                [3.0, 3.0, 0.0],
                [4.0, 2.0, 0.0],
                [4.0, 3.0, 0.0],
                [2.0, 3.0, 0.0],
            ],
            &[0x22, 0x33, 0x24, 0x34, 0x32],
            &[[6, 5, 3], [4, 2, 0], [3, 5, 1]],
        );

        let expected_vertices = [
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
            [2.0, 1.0, 0.0],
            [3.0, 1.0, 0.0],
            [4.0, 1.0, 0.0],
            [5.0, 1.0, 0.0],
            [0.0, 3.0, 0.0],
            [1.0, 3.0, 0.0],
            [2.0, 3.0, 0.0],
            [3.0, 3.0, 0.0],
            [4.0, 3.0, 0.0],
            [5.0, 3.0, 0.0],
        ];
        let expected_triangles = [
            [0, 5, 1],
            [1, 5, 2],
            [2, 5, 3],
            [3, 5, 4],
            [6, 8, 7],
            [7, 8, 9],
            [9, 8, 10],
            [9, 10, 11],
            [6, 10, 8],
        ];

        let mut mesher = factory();
        // 22 welded vertices total; 6.5/22 sets the cut at 6
        mesher.set_prune_threshold(6.5 / 22.0);
        for b in [&block0, &block1, &block2, &block3] {
            mesher.submit_block(b).unwrap();
        }
        mesher.finalize().unwrap();
        let mut sink = MemorySink::new();
        mesher.write(&mut sink, "out").unwrap();
        check_isomorphic(&expected_vertices, &expected_triangles, &sink);
    }
}
