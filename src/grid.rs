//! Regular reconstruction grid
//!
//! The grid is defined by a reference point, three axis-aligned direction
//! vectors with uniform spacing, and an inclusive integer extent range per
//! axis. It is fitted once from the input splats and read-only afterwards.

use rayon::prelude::*;

use crate::core::error::Error;
use crate::core::types::{IVec3, Result, Vec3};
use crate::math::Aabb;
use crate::splat::Splat;

#[derive(Clone, Debug)]
pub struct Grid {
    reference: Vec3,
    spacing: f32,
    extents: [[i32; 2]; 3],
}

impl Grid {
    /// Create a grid with axis-aligned directions of uniform `spacing`.
    /// `extents[axis] = [lo, hi]` are inclusive vertex indices.
    pub fn new(reference: Vec3, spacing: f32, extents: [[i32; 2]; 3]) -> Self {
        assert!(spacing > 0.0, "grid spacing must be positive");
        Self {
            reference,
            spacing,
            extents,
        }
    }

    /// Fit a grid that encloses the bounding spheres of all input splats.
    ///
    /// The lower corner of the sample positions (ignoring radii) becomes the
    /// reference point; the extents cover the full influence bounding box.
    pub fn fit(splats: &[Splat], spacing: f32) -> Result<Self> {
        if splats.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot fit a grid to an empty splat set".to_string(),
            ));
        }

        let (low, bbox) = splats
            .par_iter()
            .fold(
                || (Vec3::splat(f32::INFINITY), Aabb::empty()),
                |(low, mut bbox), splat| {
                    bbox.expand_splat(splat);
                    (low.min(Vec3::from_array(splat.position)), bbox)
                },
            )
            .reduce(
                || (Vec3::splat(f32::INFINITY), Aabb::empty()),
                |(la, ba), (lb, bb)| (la.min(lb), ba.merged(&bb)),
            );

        let mut extents = [[0i32; 2]; 3];
        for axis in 0..3 {
            let l = (bbox.min[axis] - low[axis]) / spacing;
            let h = (bbox.max[axis] - low[axis]) / spacing;
            extents[axis] = [l.floor() as i32, h.ceil() as i32];
        }
        Ok(Self::new(low, spacing, extents))
    }

    pub fn reference(&self) -> Vec3 {
        self.reference
    }

    pub fn spacing(&self) -> f32 {
        self.spacing
    }

    pub fn direction(&self, axis: usize) -> Vec3 {
        let mut dir = Vec3::ZERO;
        dir[axis] = self.spacing;
        dir
    }

    /// Inclusive (lo, hi) vertex index range of one axis
    pub fn extent(&self, axis: usize) -> (i32, i32) {
        (self.extents[axis][0], self.extents[axis][1])
    }

    pub fn set_extent(&mut self, axis: usize, lo: i32, hi: i32) {
        assert!(lo <= hi, "extent must be non-empty");
        self.extents[axis] = [lo, hi];
    }

    /// Round extents up so the active compute region is an exact multiple of
    /// the work-group size on every axis. Returns the resulting dimensions.
    pub fn round_extents(&mut self, workgroup: [u32; 3]) -> [u32; 3] {
        let mut dims = [0u32; 3];
        for axis in 0..3 {
            let wgs = workgroup[axis] as i32;
            let (lo, hi) = self.extent(axis);
            let rounded = (hi - lo + wgs) / wgs * wgs;
            self.set_extent(axis, lo, lo + rounded - 1);
            dims[axis] = rounded as u32;
        }
        dims
    }

    /// Number of cells per axis in the active region (extents are inclusive)
    pub fn size(&self) -> [u32; 3] {
        [
            (self.extents[0][1] - self.extents[0][0] + 1) as u32,
            (self.extents[1][1] - self.extents[1][0] + 1) as u32,
            (self.extents[2][1] - self.extents[2][0] + 1) as u32,
        ]
    }

    /// World position of a grid vertex, indexed relative to the lower extent
    pub fn vertex(&self, x: i32, y: i32, z: i32) -> Vec3 {
        let cell = IVec3::new(
            self.extents[0][0] + x,
            self.extents[1][0] + y,
            self.extents[2][0] + z,
        );
        self.reference + cell.as_vec3() * self.spacing
    }

    /// Grid cell containing a world position, relative to the lower extent
    pub fn world_to_cell(&self, p: Vec3) -> IVec3 {
        let rel = (p - self.reference) / self.spacing;
        IVec3::new(
            rel.x.floor() as i32 - self.extents[0][0],
            rel.y.floor() as i32 - self.extents[1][0],
            rel.z.floor() as i32 - self.extents[2][0],
        )
    }

    /// (scale, bias) mapping cell coordinates to world: world = cell * scale + bias
    pub fn scale_bias(&self) -> (Vec3, Vec3) {
        (Vec3::splat(self.spacing), self.vertex(0, 0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_splats() -> Vec<Splat> {
        vec![
            Splat::new([0.0, 0.0, 0.0], 0.5),
            Splat::new([3.0, 1.0, 2.0], 1.0),
            Splat::new([-1.0, 4.0, 0.5], 0.25),
        ]
    }

    #[test]
    fn test_fit_covers_influence_spheres() {
        let grid = Grid::fit(&sample_splats(), 1.0).unwrap();
        assert_eq!(grid.reference(), Vec3::new(-1.0, 0.0, 0.0));
        // x: bbox [-1.25, 4.0] relative to -1.0 -> [-0.25, 5.0] -> [-1, 5]
        assert_eq!(grid.extent(0), (-1, 5));
        // y: bbox [-0.5, 4.25] -> [-1, 5]
        assert_eq!(grid.extent(1), (-1, 5));
        // z: bbox [-0.5, 3.0] -> [-1, 3]
        assert_eq!(grid.extent(2), (-1, 3));
    }

    #[test]
    fn test_fit_empty_fails() {
        assert!(matches!(
            Grid::fit(&[], 1.0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_round_extents() {
        let mut grid = Grid::new(Vec3::ZERO, 0.5, [[0, 10], [0, 16], [0, 1]]);
        let dims = grid.round_extents([16, 16, 1]);
        assert_eq!(dims, [16, 32, 2]);
        assert_eq!(grid.extent(0), (0, 15));
        assert_eq!(grid.extent(1), (0, 31));
        assert_eq!(grid.extent(2), (0, 1));
        assert_eq!(grid.size(), [16, 32, 2]);
    }

    #[test]
    fn test_vertex_and_cell_mapping() {
        let grid = Grid::new(Vec3::new(1.0, 2.0, 3.0), 0.5, [[-2, 6], [0, 8], [4, 12]]);
        let v = grid.vertex(0, 0, 0);
        assert_eq!(v, Vec3::new(0.0, 2.0, 5.0));
        assert_eq!(grid.world_to_cell(v + Vec3::splat(0.25)), IVec3::ZERO);
        assert_eq!(grid.world_to_cell(v + Vec3::new(1.0, 0.5, 0.0)), IVec3::new(2, 1, 0));

        let (scale, bias) = grid.scale_bias();
        assert_eq!(scale, Vec3::splat(0.5));
        assert_eq!(bias, v);
    }
}
