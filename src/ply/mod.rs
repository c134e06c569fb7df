//! Binary PLY input/output
//!
//! Only the little-endian binary flavor is supported, matching what the
//! scanning tools in this pipeline produce. The reader pulls splat records
//! out of the "vertex" element; the writer streams the reconstructed mesh as
//! a "vertex" element followed by a "face" element.

pub mod reader;
pub mod writer;

pub use reader::PlyReader;
pub use writer::PlySink;
