//! The splat input record

use bytemuck::{Pod, Zeroable};

/// An oriented point sample with an influence radius, the atomic input unit.
///
/// 16 bytes, laid out to match `vec4<f32>` so the device-side splat buffer
/// can be read without repacking. The radius already includes the smoothing
/// factor applied at load time.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Splat {
    pub position: [f32; 3],
    pub radius: f32,
}

impl Splat {
    pub fn new(position: [f32; 3], radius: f32) -> Self {
        Self { position, radius }
    }
}
