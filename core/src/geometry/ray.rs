//! Rays

#![allow(dead_code)]

use crate::common::*;

use super::{Point3f, Vector3f};

/// A ray segment with precomputed direction reciprocals.
///
/// Along with origin and direction, the ray stores the parametric segment
/// `[mint, maxt]` (whose entries may be infinite) and the componentwise
/// reciprocals of the direction, which traversal code needs constantly. The
/// reciprocals must be kept consistent with `d`; use [`Ray::update`] after
/// changing the direction.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Ray {
    /// Origin.
    pub o: Point3f,

    /// Direction. Unit length is not required.
    pub d: Vector3f,

    /// Componentwise reciprocals of the direction.
    pub d_rcp: Vector3f,

    /// Minimum position on the ray segment.
    pub mint: Float,

    /// Maximum position on the ray segment.
    pub maxt: Float,
}

impl Ray {
    /// Creates a new ray segment.
    ///
    /// * `o`    - Origin.
    /// * `d`    - Direction.
    /// * `mint` - Minimum position on the segment.
    /// * `maxt` - Maximum position on the segment.
    pub fn new(o: Point3f, d: Vector3f, mint: Float, maxt: Float) -> Self {
        Self {
            o,
            d,
            d_rcp: d.recip(),
            mint,
            maxt,
        }
    }

    /// Copies the ray but replaces the covered segment.
    ///
    /// * `mint` - Minimum position on the segment.
    /// * `maxt` - Maximum position on the segment.
    pub fn with_segment(&self, mint: Float, maxt: Float) -> Self {
        Self {
            mint,
            maxt,
            ..*self
        }
    }

    /// Recomputes the reciprocal directions after changing `d`.
    pub fn update(&mut self) {
        self.d_rcp = self.d.recip();
    }

    /// Return the position of a point along the ray.
    ///
    /// * `t` - Parameter to evaluate.
    pub fn at(&self, t: Float) -> Point3f {
        self.o + self.d * t
    }
}

impl Default for Ray {
    /// Returns a ray at the origin covering `[RAY_EPSILON, ∞)`.
    fn default() -> Self {
        Self::new(
            Point3f::zero(),
            Vector3f::new(0.0, 0.0, 1.0),
            RAY_EPSILON,
            INFINITY,
        )
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_evaluates_along_direction() {
        let r = Ray::new(
            Point3f::new(1.0, 0.0, 0.0),
            Vector3f::new(0.0, 2.0, 0.0),
            0.0,
            INFINITY,
        );
        assert_eq!(r.at(2.0), Point3f::new(1.0, 4.0, 0.0));
    }

    #[test]
    fn reciprocals_follow_direction() {
        let mut r = Ray::default();
        r.d = Vector3f::new(2.0, 0.0, -0.5);
        r.update();
        assert_eq!(r.d_rcp.x, 0.5);
        assert!(r.d_rcp.y.is_infinite());
        assert_eq!(r.d_rcp.z, -2.0);
    }
}
