//! Out-of-core welding mesher
//!
//! Same algorithm as [`WeldMesher`](super::WeldMesher), but vertex and
//! triangle data are spilled to unnamed temporary files as blocks arrive,
//! so only the key table and union-find stay resident. Both variants
//! produce identical mesh topology for the same input sequence.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use super::sink::MeshSink;
use super::weld::{remap_triangle_out, weld_block, Remap, WeldCore, WRITE_CHUNK};
use super::{MeshBlock, Mesher, MesherState};
use crate::core::types::Result;

/// One spill stream: buffered appends while accepting, then sequential
/// re-reads of fixed-size Pod records.
struct Spill {
    writer: Option<BufWriter<File>>,
    file: Option<File>,
    records: u64,
}

impl Spill {
    fn new() -> Result<Self> {
        Ok(Self {
            writer: Some(BufWriter::new(tempfile::tempfile()?)),
            file: None,
            records: 0,
        })
    }

    fn append<T: bytemuck::Pod>(&mut self, record: &T) -> std::io::Result<()> {
        let writer = self.writer.as_mut().expect("spill already sealed");
        writer.write_all(bytemuck::bytes_of(record))?;
        self.records += 1;
        Ok(())
    }

    fn seal(&mut self) -> Result<()> {
        let writer = self.writer.take().expect("spill already sealed");
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        self.file = Some(file);
        Ok(())
    }

    /// Stream every record through `visit` in insertion order.
    fn for_each<T: bytemuck::Pod, F: FnMut(u64, T) -> Result<()>>(
        &self,
        mut visit: F,
    ) -> Result<()> {
        let file = self.file.as_ref().expect("spill not sealed");
        (&*file).seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);
        let mut record = T::zeroed();
        for index in 0..self.records {
            reader.read_exact(bytemuck::bytes_of_mut(&mut record))?;
            visit(index, record)?;
        }
        Ok(())
    }
}

/// Welding mesher for meshes too large to hold in memory.
pub struct SpillMesher {
    core: WeldCore,
    vertex_spill: Spill,
    triangle_spill: Spill,
    prune_threshold: f64,
    state: MesherState,
    remap: Option<Remap>,
    surviving_triangles: u64,
    local: Vec<u32>,
}

impl SpillMesher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            core: WeldCore::new(),
            vertex_spill: Spill::new()?,
            triangle_spill: Spill::new()?,
            prune_threshold: 0.0,
            state: MesherState::Accepting,
            remap: None,
            surviving_triangles: 0,
            local: Vec::new(),
        })
    }
}

impl Mesher for SpillMesher {
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
        let vertex_spill = &mut self.vertex_spill;
        let mut spill_err: Option<std::io::Error> = None;
        weld_block(&mut self.core, block, &mut self.local, |_, v| {
            if spill_err.is_none() {
                if let Err(e) = vertex_spill.append(&v) {
                    spill_err = Some(e);
                }
            }
        });
        if let Some(e) = spill_err {
            return Err(e.into());
        }
        for &t in &block.triangles {
            let canonical = WeldCore::remap_triangle(&self.local, t);
            self.core.link(canonical);
            self.triangle_spill.append(&canonical)?;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        assert!(self.state == MesherState::Accepting, "finalize called twice");
        self.vertex_spill.seal()?;
        self.triangle_spill.seal()?;

        let remap = self.core.pruned_remap(self.prune_threshold);

        // Counting pass so write() can declare exact totals up front
        let mut surviving = 0u64;
        self.triangle_spill.for_each::<[u32; 3], _>(|_, t| {
            if remap.get(t[0]).is_some() {
                surviving += 1;
            }
            Ok(())
        })?;

        self.surviving_triangles = surviving;
        self.remap = Some(remap);
        self.state = MesherState::Finalized;
        Ok(())
    }

    fn write(&mut self, sink: &mut dyn MeshSink, name: &str) -> Result<()> {
        assert!(
            self.state == MesherState::Finalized,
            "write requires a finalized mesh"
        );
        let remap = self.remap.as_ref().unwrap();

        sink.begin(name, remap.surviving(), self.surviving_triangles)?;

        let mut chunk = Vec::with_capacity(WRITE_CHUNK);
        self.vertex_spill.for_each::<[f32; 3], _>(|id, v| {
            if remap.get(id as u32).is_some() {
                chunk.push(v);
                if chunk.len() == WRITE_CHUNK {
                    sink.write_vertices(&chunk)?;
                    chunk.clear();
                }
            }
            Ok(())
        })?;
        if !chunk.is_empty() {
            sink.write_vertices(&chunk)?;
        }

        let mut chunk = Vec::with_capacity(WRITE_CHUNK);
        self.triangle_spill.for_each::<[u32; 3], _>(|_, t| {
            if let Some(mapped) = remap_triangle_out(remap, t) {
                chunk.push(mapped);
                if chunk.len() == WRITE_CHUNK {
                    sink.write_triangles(&chunk)?;
                    chunk.clear();
                }
            }
            Ok(())
        })?;
        if !chunk.is_empty() {
            sink.write_triangles(&chunk)?;
        }

        sink.finish()?;
        self.state = MesherState::Written;
        Ok(())
    }
}
