//! Axis-aligned bounding box

use crate::core::types::Vec3;
use crate::splat::Splat;

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// An empty box that any expand() fixes up
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }

    /// Get size (max - min)
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Expand AABB to include point
    pub fn expand(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Expand AABB to include a splat's full influence sphere
    pub fn expand_splat(&mut self, splat: &Splat) {
        let p = Vec3::from_array(splat.position);
        let r = Vec3::splat(splat.radius);
        self.min = self.min.min(p - r);
        self.max = self.max.max(p + r);
    }

    /// Return merged AABB containing both
    pub fn merged(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand() {
        let mut aabb = Aabb::empty();
        assert!(aabb.is_empty());
        aabb.expand(Vec3::ZERO);
        aabb.expand(Vec3::ONE);
        assert_eq!(aabb.size(), Vec3::ONE);
    }

    #[test]
    fn test_expand_splat() {
        let mut aabb = Aabb::empty();
        aabb.expand_splat(&Splat {
            position: [1.0, 2.0, 3.0],
            radius: 0.5,
        });
        assert_eq!(aabb.min, Vec3::new(0.5, 1.5, 2.5));
        assert_eq!(aabb.max, Vec3::new(1.5, 2.5, 3.5));
    }

    #[test]
    fn test_merged() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let b = Aabb::new(Vec3::splat(0.5), Vec3::splat(2.0));
        let m = a.merged(&b);
        assert_eq!(m.min, Vec3::ZERO);
        assert_eq!(m.max, Vec3::splat(2.0));
    }
}
