//! Output sink interface for reconstructed meshes

use crate::core::types::Result;

/// Destination for the final mesh, written exactly once: all vertices first,
/// then all triangles.
pub trait MeshSink {
    /// Announce the output name and the exact element counts that follow.
    fn begin(&mut self, name: &str, num_vertices: u64, num_triangles: u64) -> Result<()>;

    /// Append a batch of vertex positions.
    fn write_vertices(&mut self, vertices: &[[f32; 3]]) -> Result<()>;

    /// Append a batch of triangles as vertex index triples.
    fn write_triangles(&mut self, triangles: &[[u32; 3]]) -> Result<()>;

    /// Flush and close the output.
    fn finish(&mut self) -> Result<()>;
}

/// Sink that stores the mesh in memory, for tests and in-process consumers.
#[derive(Default)]
pub struct MemorySink {
    name: String,
    vertices: Vec<[f32; 3]>,
    triangles: Vec<[u32; 3]>,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertices(&self) -> &[[f32; 3]] {
        &self.vertices
    }

    pub fn triangles(&self) -> &[[u32; 3]] {
        &self.triangles
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl MeshSink for MemorySink {
    fn begin(&mut self, name: &str, num_vertices: u64, num_triangles: u64) -> Result<()> {
        self.name = name.to_string();
        self.vertices = Vec::with_capacity(num_vertices as usize);
        self.triangles = Vec::with_capacity(num_triangles as usize);
        self.finished = false;
        Ok(())
    }

    fn write_vertices(&mut self, vertices: &[[f32; 3]]) -> Result<()> {
        self.vertices.extend_from_slice(vertices);
        Ok(())
    }

    fn write_triangles(&mut self, triangles: &[[u32; 3]]) -> Result<()> {
        self.triangles.extend_from_slice(triangles);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}
