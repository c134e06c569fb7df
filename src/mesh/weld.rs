//! Vertex welding and component pruning
//!
//! `WeldCore` holds the state shared by the in-memory and out-of-core
//! meshers: the external-key table, the union-find over canonical vertex
//! ids, and the pruning remap. `WeldMesher` keeps vertex and triangle data
//! in RAM; `SpillMesher` streams it through temporary files.

use std::collections::HashMap;

use super::sink::MeshSink;
use super::union_find::UnionFind;
use super::{prune_limit, MeshBlock, Mesher, MesherState};
use crate::core::types::Result;

/// Batch size for streaming writes to the sink.
pub(crate) const WRITE_CHUNK: usize = 4096;

/// Welding state shared by both mesher variants.
pub(crate) struct WeldCore {
    key_to_vertex: HashMap<u64, u32>,
    components: UnionFind,
}

/// Canonical-id to output-id mapping produced by pruning.
pub(crate) struct Remap {
    map: Vec<u32>,
    surviving: u64,
}

const DROPPED: u32 = u32::MAX;

impl Remap {
    /// Output id for a canonical id, or None if its component was pruned.
    pub fn get(&self, id: u32) -> Option<u32> {
        match self.map[id as usize] {
            DROPPED => None,
            out => Some(out),
        }
    }

    pub fn surviving(&self) -> u64 {
        self.surviving
    }
}

impl WeldCore {
    pub fn new() -> Self {
        Self {
            key_to_vertex: HashMap::new(),
            components: UnionFind::new(),
        }
    }

    /// Canonical id for an external key; allocates on first occurrence.
    /// Returns (id, newly_created).
    pub fn external(&mut self, key: u64) -> (u32, bool) {
        match self.key_to_vertex.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => (*e.get(), false),
            std::collections::hash_map::Entry::Vacant(e) => {
                let id = self.components.add();
                e.insert(id);
                (id, true)
            }
        }
    }

    /// Fresh canonical id for an internal vertex; never shared.
    pub fn internal(&mut self) -> u32 {
        self.components.add()
    }

    pub fn total_vertices(&self) -> u64 {
        self.components.len() as u64
    }

    /// Record that a triangle connects its three vertices.
    pub fn link(&mut self, triangle: [u32; 3]) {
        self.components.union(triangle[0], triangle[1]);
        self.components.union(triangle[0], triangle[2]);
    }

    /// Map a block's local triangle indices to canonical ids.
    /// `local` holds the canonical id of each local vertex, internals first.
    pub fn remap_triangle(local: &[u32], triangle: [u32; 3]) -> [u32; 3] {
        triangle.map(|i| {
            assert!(
                (i as usize) < local.len(),
                "triangle index {} out of range for block with {} vertices",
                i,
                local.len()
            );
            local[i as usize]
        })
    }

    /// Apply pruning and produce the dense output numbering, in canonical-id
    /// order.
    pub fn pruned_remap(&mut self, fraction: f64) -> Remap {
        let total = self.components.len() as u64;
        let limit = prune_limit(fraction, total);
        let mut map = vec![DROPPED; total as usize];
        let mut next = 0u32;
        for id in 0..total as u32 {
            if self.components.set_size(id) as u64 >= limit {
                map[id as usize] = next;
                next += 1;
            }
        }
        Remap {
            map,
            surviving: next as u64,
        }
    }
}

/// Fold one block into the core, returning the canonical id of every local
/// vertex and pushing newly allocated vertex positions through `on_new`.
pub(crate) fn weld_block(
    core: &mut WeldCore,
    block: &MeshBlock,
    local: &mut Vec<u32>,
    mut on_new: impl FnMut(u32, [f32; 3]),
) {
    assert_eq!(
        block.external_vertices.len(),
        block.external_keys.len(),
        "every external vertex needs a key"
    );
    local.clear();
    local.reserve(block.vertex_count());
    for &v in &block.internal_vertices {
        let id = core.internal();
        on_new(id, v);
        local.push(id);
    }
    for (&v, &key) in block.external_vertices.iter().zip(&block.external_keys) {
        let (id, is_new) = core.external(key);
        if is_new {
            on_new(id, v);
        }
        local.push(id);
    }
}

/// In-memory welding mesher.
///
/// Keeps the key table, welded vertices and triangles in RAM. For meshes too
/// large for that, use [`SpillMesher`](super::SpillMesher).
pub struct WeldMesher {
    core: WeldCore,
    vertices: Vec<[f32; 3]>,
    triangles: Vec<[u32; 3]>,
    prune_threshold: f64,
    state: MesherState,
    remap: Option<Remap>,
    local: Vec<u32>,
}

impl WeldMesher {
    pub fn new() -> Self {
        Self {
            core: WeldCore::new(),
            vertices: Vec::new(),
            triangles: Vec::new(),
            prune_threshold: 0.0,
            state: MesherState::Accepting,
            remap: None,
            local: Vec::new(),
        }
    }
}

impl Default for WeldMesher {
    fn default() -> Self {
        Self::new()
    }
}

impl Mesher for WeldMesher {
    fn set_prune_threshold(&mut self, fraction: f64) {
        assert!((0.0..=1.0).contains(&fraction));
        assert!(
            self.state == MesherState::Accepting && self.core.total_vertices() == 0,
            "prune threshold must be set before any block is submitted"
        );
        self.prune_threshold = fraction;
    }

    fn prune_threshold(&self) -> f64 {
        self.prune_threshold
    }

    fn submit_block(&mut self, block: &MeshBlock) -> Result<()> {
        assert!(
            self.state == MesherState::Accepting,
            "submit_block after finalize"
        );
        let vertices = &mut self.vertices;
        weld_block(&mut self.core, block, &mut self.local, |id, v| {
            debug_assert_eq!(id as usize, vertices.len());
            vertices.push(v);
        });
        for &t in &block.triangles {
            let canonical = WeldCore::remap_triangle(&self.local, t);
            self.core.link(canonical);
            self.triangles.push(canonical);
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        assert!(self.state == MesherState::Accepting, "finalize called twice");
        self.remap = Some(self.core.pruned_remap(self.prune_threshold));
        self.state = MesherState::Finalized;
        Ok(())
    }

    fn write(&mut self, sink: &mut dyn MeshSink, name: &str) -> Result<()> {
        assert!(
            self.state == MesherState::Finalized,
            "write requires a finalized mesh"
        );
        let remap = self.remap.as_ref().unwrap();

        let num_triangles = self
            .triangles
            .iter()
            .filter(|t| remap.get(t[0]).is_some())
            .count() as u64;
        sink.begin(name, remap.surviving(), num_triangles)?;

        let mut chunk = Vec::with_capacity(WRITE_CHUNK);
        for (id, &v) in self.vertices.iter().enumerate() {
            if remap.get(id as u32).is_some() {
                chunk.push(v);
                if chunk.len() == WRITE_CHUNK {
                    sink.write_vertices(&chunk)?;
                    chunk.clear();
                }
            }
        }
        if !chunk.is_empty() {
            sink.write_vertices(&chunk)?;
        }

        let mut chunk = Vec::with_capacity(WRITE_CHUNK);
        for &t in &self.triangles {
            if let Some(mapped) = remap_triangle_out(remap, t) {
                chunk.push(mapped);
                if chunk.len() == WRITE_CHUNK {
                    sink.write_triangles(&chunk)?;
                    chunk.clear();
                }
            }
        }
        if !chunk.is_empty() {
            sink.write_triangles(&chunk)?;
        }

        sink.finish()?;
        self.state = MesherState::Written;
        Ok(())
    }
}

/// Triangle remapped to output ids, or None when its component was pruned.
/// All three vertices share a component, so checking one corner suffices.
pub(crate) fn remap_triangle_out(remap: &Remap, t: [u32; 3]) -> Option<[u32; 3]> {
    remap.get(t[0])?;
    Some(t.map(|i| remap.get(i).unwrap()))
}

/// Mesher that concatenates blocks without welding or pruning.
///
/// External keys are ignored; every submitted vertex becomes an output
/// vertex. Useful as a baseline when blocks are known not to share
/// boundaries.
pub struct SimpleMesher {
    vertices: Vec<[f32; 3]>,
    triangles: Vec<[u32; 3]>,
    prune_threshold: f64,
    state: MesherState,
}

impl SimpleMesher {
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            triangles: Vec::new(),
            prune_threshold: 0.0,
            state: MesherState::Accepting,
        }
    }
}

impl Default for SimpleMesher {
    fn default() -> Self {
        Self::new()
    }
}

impl Mesher for SimpleMesher {
    fn set_prune_threshold(&mut self, fraction: f64) {
        assert!((0.0..=1.0).contains(&fraction));
        // Accepted for interface compatibility; this mesher never prunes.
        self.prune_threshold = fraction;
    }

    fn prune_threshold(&self) -> f64 {
        self.prune_threshold
    }

    fn submit_block(&mut self, block: &MeshBlock) -> Result<()> {
        assert!(
            self.state == MesherState::Accepting,
            "submit_block after finalize"
        );
        let base = self.vertices.len() as u32;
        self.vertices.extend_from_slice(&block.internal_vertices);
        self.vertices.extend_from_slice(&block.external_vertices);
        for &t in &block.triangles {
            self.triangles.push(t.map(|i| {
                assert!((i as usize) < block.vertex_count());
                base + i
            }));
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        assert!(self.state == MesherState::Accepting, "finalize called twice");
        self.state = MesherState::Finalized;
        Ok(())
    }

    fn write(&mut self, sink: &mut dyn MeshSink, name: &str) -> Result<()> {
        assert!(
            self.state == MesherState::Finalized,
            "write requires a finalized mesh"
        );
        sink.begin(
            name,
            self.vertices.len() as u64,
            self.triangles.len() as u64,
        )?;
        for chunk in self.vertices.chunks(WRITE_CHUNK) {
            sink.write_vertices(chunk)?;
        }
        for chunk in self.triangles.chunks(WRITE_CHUNK) {
            sink.write_triangles(chunk)?;
        }
        sink.finish()?;
        self.state = MesherState::Written;
        Ok(())
    }
}
