//! Binary little-endian PLY output sink

use std::io::{BufWriter, Write};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::mesh::MeshSink;

/// Streams a mesh as binary little-endian PLY: a "vertex" element
/// (float x/y/z) followed by a "face" element (uchar count + three uints).
pub struct PlySink<W: Write> {
    out: BufWriter<W>,
    declared_vertices: u64,
    declared_triangles: u64,
    written_vertices: u64,
    written_triangles: u64,
    header_done: bool,
}

impl<W: Write> PlySink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: BufWriter::new(out),
            declared_vertices: 0,
            declared_triangles: 0,
            written_vertices: 0,
            written_triangles: 0,
            header_done: false,
        }
    }

    /// Consume the sink and hand back the underlying writer.
    pub fn into_inner(self) -> Result<W> {
        self.out.into_inner().map_err(|e| Error::Io(e.into_error()))
    }
}

impl<W: Write> MeshSink for PlySink<W> {
    fn begin(&mut self, _name: &str, num_vertices: u64, num_triangles: u64) -> Result<()> {
        assert!(!self.header_done, "begin called twice");
        self.declared_vertices = num_vertices;
        self.declared_triangles = num_triangles;
        write!(
            self.out,
            "ply\n\
             format binary_little_endian 1.0\n\
             element vertex {}\n\
             property float x\n\
             property float y\n\
             property float z\n\
             element face {}\n\
             property list uchar uint vertex_indices\n\
             end_header\n",
            num_vertices, num_triangles
        )?;
        self.header_done = true;
        Ok(())
    }

    fn write_vertices(&mut self, vertices: &[[f32; 3]]) -> Result<()> {
        assert!(self.header_done, "write before begin");
        for v in vertices {
            for c in v {
                self.out.write_all(&c.to_le_bytes())?;
            }
        }
        self.written_vertices += vertices.len() as u64;
        Ok(())
    }

    fn write_triangles(&mut self, triangles: &[[u32; 3]]) -> Result<()> {
        assert!(self.header_done, "write before begin");
        debug_assert_eq!(self.written_vertices, self.declared_vertices);
        for t in triangles {
            self.out.write_all(&[3u8])?;
            for i in t {
                self.out.write_all(&i.to_le_bytes())?;
            }
        }
        self.written_triangles += triangles.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        debug_assert_eq!(self.written_vertices, self.declared_vertices);
        debug_assert_eq!(self.written_triangles, self.declared_triangles);
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Parse the bytes a PlySink produced (header, raw vertex block, faces
    /// with a leading count byte).
    fn parse(data: &[u8]) -> (Vec<[f32; 3]>, Vec<[u32; 3]>) {
        let header_end = data
            .windows(11)
            .position(|w| w == b"end_header\n")
            .expect("no end_header")
            + 11;
        let header = std::str::from_utf8(&data[..header_end]).unwrap();

        let count_of = |prefix: &str| -> usize {
            header
                .lines()
                .find_map(|l| l.strip_prefix(prefix))
                .and_then(|rest| rest.trim().parse().ok())
                .expect("missing element count")
        };
        let num_vertices = count_of("element vertex ");
        let num_faces = count_of("element face ");

        let mut pos = header_end;
        let mut vertices = Vec::with_capacity(num_vertices);
        for _ in 0..num_vertices {
            let mut v = [0f32; 3];
            for c in &mut v {
                *c = f32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
                pos += 4;
            }
            vertices.push(v);
        }

        let mut triangles = Vec::with_capacity(num_faces);
        for _ in 0..num_faces {
            assert_eq!(data[pos], 3);
            pos += 1;
            let mut t = [0u32; 3];
            for i in &mut t {
                *i = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
                pos += 4;
            }
            triangles.push(t);
        }
        assert_eq!(pos, data.len());
        (vertices, triangles)
    }

    #[test]
    fn test_roundtrip() {
        let mut sink = PlySink::new(Vec::new());
        sink.begin("mesh", 3, 1).unwrap();
        sink.write_vertices(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]])
            .unwrap();
        sink.write_triangles(&[[0, 1, 2]]).unwrap();
        sink.finish().unwrap();

        let data = sink.into_inner().unwrap();
        let (vertices, triangles) = parse(&data);
        assert_eq!(
            vertices,
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]
        );
        assert_eq!(triangles, vec![[0, 1, 2]]);
    }

    #[test]
    fn test_empty_mesh() {
        let mut sink = PlySink::new(Vec::new());
        sink.begin("mesh", 0, 0).unwrap();
        sink.finish().unwrap();
        let data = sink.into_inner().unwrap();
        let (vertices, triangles) = parse(&data);
        assert!(vertices.is_empty());
        assert!(triangles.is_empty());
    }
}
