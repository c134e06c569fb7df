//! Splat reader for binary little-endian PLY files

use std::io::BufRead;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::splat::Splat;

/// Byte size of a PLY scalar type name, or None for unknown types.
fn scalar_size(name: &str) -> Option<usize> {
    match name {
        "char" | "uchar" | "int8" | "uint8" => Some(1),
        "short" | "ushort" | "int16" | "uint16" => Some(2),
        "int" | "uint" | "int32" | "uint32" | "float" | "float32" => Some(4),
        "double" | "float64" => Some(8),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct FieldOffsets {
    x: Option<usize>,
    y: Option<usize>,
    z: Option<usize>,
    radius: Option<usize>,
}

/// Streaming reader for the "vertex" element of a binary PLY file.
///
/// Required vertex properties are `x`, `y`, `z` and `radius`, each float32;
/// other fixed-size properties are skipped. Elements declared before
/// "vertex" are skipped as long as they contain no list properties.
pub struct PlyReader<R: BufRead> {
    input: R,
    source: String,
    vertex_count: u64,
    remaining: u64,
    stride: usize,
    offsets: [usize; 4],
    leading_bytes: u64,
    row: Vec<u8>,
}

impl<R: BufRead> PlyReader<R> {
    /// Parse the header. `source` identifies the stream in error messages.
    pub fn new(mut input: R, source: &str) -> Result<Self> {
        let err = |msg: String| Error::Format(format!("{}: {}", source, msg));

        let mut line = String::new();
        let mut read_line = |input: &mut R, line: &mut String| -> Result<()> {
            line.clear();
            let n = input.read_line(line)?;
            if n == 0 {
                return Err(Error::Format(format!(
                    "{}: unexpected end of header",
                    source
                )));
            }
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            Ok(())
        };

        read_line(&mut input, &mut line)?;
        if line != "ply" {
            return Err(err("not a PLY file".to_string()));
        }
        read_line(&mut input, &mut line)?;
        if line != "format binary_little_endian 1.0" {
            return Err(err(format!("unsupported format `{}`", line)));
        }

        // Per-element accumulation while walking the header
        let mut current_count: u64 = 0;
        let mut current_stride: usize = 0;
        let mut current_is_vertex = false;
        let mut current_has_list = false;
        let mut offsets = FieldOffsets::default();

        let mut vertex_count: Option<u64> = None;
        let mut vertex_stride = 0usize;
        let mut vertex_offsets = FieldOffsets::default();
        let mut leading_bytes: u64 = 0;

        loop {
            read_line(&mut input, &mut line)?;
            let mut words = line.split_whitespace();
            let keyword = words.next().unwrap_or("");
            match keyword {
                "comment" | "obj_info" => continue,
                "element" | "end_header" => {
                    // Close out the element parsed so far
                    if current_is_vertex {
                        vertex_count = Some(current_count);
                        vertex_stride = current_stride;
                        vertex_offsets = offsets;
                    } else if vertex_count.is_none() && current_count > 0 {
                        if current_has_list {
                            return Err(err(
                                "cannot skip a list element preceding vertex data".to_string(),
                            ));
                        }
                        leading_bytes += current_count * current_stride as u64;
                    }
                    if keyword == "end_header" {
                        break;
                    }

                    let name = words
                        .next()
                        .ok_or_else(|| err("element without a name".to_string()))?;
                    let count: u64 = words
                        .next()
                        .and_then(|w| w.parse().ok())
                        .ok_or_else(|| err(format!("bad count for element `{}`", name)))?;
                    current_is_vertex = name == "vertex" && vertex_count.is_none();
                    current_count = count;
                    current_stride = 0;
                    current_has_list = false;
                    offsets = FieldOffsets::default();
                }
                "property" => {
                    let ty = words
                        .next()
                        .ok_or_else(|| err("property without a type".to_string()))?;
                    if ty == "list" {
                        if current_is_vertex {
                            return Err(err(
                                "list property in vertex element".to_string(),
                            ));
                        }
                        current_has_list = true;
                        continue;
                    }
                    let size = scalar_size(ty)
                        .ok_or_else(|| err(format!("unknown property type `{}`", ty)))?;
                    let name = words
                        .next()
                        .ok_or_else(|| err("property without a name".to_string()))?;
                    if current_is_vertex {
                        let slot = match name {
                            "x" => Some(&mut offsets.x),
                            "y" => Some(&mut offsets.y),
                            "z" => Some(&mut offsets.z),
                            "radius" => Some(&mut offsets.radius),
                            _ => None,
                        };
                        if let Some(slot) = slot {
                            if size != 4 || !matches!(ty, "float" | "float32") {
                                return Err(err(format!(
                                    "property `{}` must be float32",
                                    name
                                )));
                            }
                            *slot = Some(current_stride);
                        }
                    }
                    current_stride += size;
                }
                "" => continue,
                other => return Err(err(format!("unknown header keyword `{}`", other))),
            }
        }

        let vertex_count =
            vertex_count.ok_or_else(|| err("no vertex element".to_string()))?;
        let resolved = [
            ("x", vertex_offsets.x),
            ("y", vertex_offsets.y),
            ("z", vertex_offsets.z),
            ("radius", vertex_offsets.radius),
        ];
        let mut fields = [0usize; 4];
        for (i, (name, offset)) in resolved.iter().enumerate() {
            fields[i] =
                offset.ok_or_else(|| err(format!("missing vertex property `{}`", name)))?;
        }

        Ok(Self {
            input,
            source: source.to_string(),
            vertex_count,
            remaining: vertex_count,
            stride: vertex_stride,
            offsets: fields,
            leading_bytes,
            row: vec![0u8; vertex_stride],
        })
    }

    /// Number of splat records declared in the header.
    pub fn vertex_count(&self) -> u64 {
        self.vertex_count
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Fill `out` with up to `out.len()` splats, applying the smoothing
    /// factor to each radius. Returns the number of splats read; zero means
    /// the stream is exhausted.
    pub fn read_batch(&mut self, smoothing: f32, out: &mut [Splat]) -> Result<usize> {
        self.skip_leading()?;
        let want = (out.len() as u64).min(self.remaining) as usize;
        for slot in out[..want].iter_mut() {
            self.input.read_exact(&mut self.row).map_err(|_| {
                Error::Format(format!("{}: truncated vertex data", self.source))
            })?;
            let field = |offset: usize| {
                f32::from_le_bytes([
                    self.row[offset],
                    self.row[offset + 1],
                    self.row[offset + 2],
                    self.row[offset + 3],
                ])
            };
            *slot = Splat {
                position: [
                    field(self.offsets[0]),
                    field(self.offsets[1]),
                    field(self.offsets[2]),
                ],
                radius: field(self.offsets[3]) * smoothing,
            };
        }
        self.remaining -= want as u64;
        Ok(want)
    }

    /// Read every remaining splat.
    pub fn read_all(&mut self, smoothing: f32) -> Result<Vec<Splat>> {
        let mut splats = vec![Splat::new([0.0; 3], 0.0); self.remaining as usize];
        let mut filled = 0;
        while filled < splats.len() {
            let n = self.read_batch(smoothing, &mut splats[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        splats.truncate(filled);
        Ok(splats)
    }

    fn skip_leading(&mut self) -> Result<()> {
        while self.leading_bytes > 0 {
            let take = self.leading_bytes.min(self.row.len().max(256) as u64) as usize;
            let mut scratch = vec![0u8; take];
            self.input.read_exact(&mut scratch).map_err(|_| {
                Error::Format(format!("{}: truncated element data", self.source))
            })?;
            self.leading_bytes -= take as u64;
        }
        Ok(())
    }
}
