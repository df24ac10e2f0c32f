//! Orthonormal frames

#![allow(dead_code)]

use crate::common::*;

use super::{Normal3f, Vector3f};

/// Builds an orthonormal coordinate system around a unit vector.
///
/// * `v1` - The unit vector.
pub fn coordinate_system(v1: &Vector3f) -> (Vector3f, Vector3f) {
    let v2 = if abs(v1.x) > abs(v1.y) {
        let inv_len = 1.0 / (v1.x * v1.x + v1.z * v1.z).sqrt();
        Vector3f::new(-v1.z * inv_len, 0.0, v1.x * inv_len)
    } else {
        let inv_len = 1.0 / (v1.y * v1.y + v1.z * v1.z).sqrt();
        Vector3f::new(0.0, v1.z * inv_len, -v1.y * inv_len)
    };
    let v3 = v1.cross(&v2);
    (v2, v3)
}

/// A three-vector orthonormal coordinate frame used to express directions
/// relative to a surface normal.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Frame {
    /// First tangent.
    pub s: Vector3f,

    /// Second tangent.
    pub t: Vector3f,

    /// Normal.
    pub n: Normal3f,
}

impl Frame {
    /// Creates a frame from a unit normal, completing the tangents with an
    /// arbitrary orthonormal basis.
    ///
    /// * `n` - The unit normal.
    pub fn from_normal(n: Normal3f) -> Self {
        let (s, t) = coordinate_system(&Vector3f::from(n));
        Self { s, t, n }
    }

    /// Convert from world coordinates to local coordinates.
    ///
    /// * `v` - The world-space vector.
    pub fn to_local(&self, v: &Vector3f) -> Vector3f {
        Vector3f::new(v.dot(&self.s), v.dot(&self.t), self.n.dot(v))
    }

    /// Convert from local coordinates to world coordinates.
    ///
    /// * `v` - The local-space vector.
    pub fn to_world(&self, v: &Vector3f) -> Vector3f {
        self.s * v.x + self.t * v.y + Vector3f::from(self.n) * v.z
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn frame_is_orthonormal() {
        let n = Normal3f::new(0.0, 0.0, 1.0);
        let f = Frame::from_normal(n);
        assert!(approx_eq!(f32, f.s.dot(&f.t), 0.0, epsilon = 1e-6));
        assert!(approx_eq!(f32, f.n.dot(&f.s), 0.0, epsilon = 1e-6));
        assert!(approx_eq!(f32, f.s.length(), 1.0, epsilon = 1e-6));
        assert!(approx_eq!(f32, f.t.length(), 1.0, epsilon = 1e-6));
    }

    #[test]
    fn world_local_round_trip() {
        let f = Frame::from_normal(Normal3f::new(0.6, 0.0, 0.8));
        let v = Vector3f::new(0.3, -0.4, 0.5);
        let w = f.to_world(&f.to_local(&v));
        assert!(approx_eq!(f32, w.x, v.x, epsilon = 1e-5));
        assert!(approx_eq!(f32, w.y, v.y, epsilon = 1e-5));
        assert!(approx_eq!(f32, w.z, v.z, epsilon = 1e-5));
    }
}
