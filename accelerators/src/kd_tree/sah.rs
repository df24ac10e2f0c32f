//! Tree construction cost heuristics.

use aster_core::geometry::{Bounds3f, Float, Vector3f};

/// Cost heuristic steering kd-tree construction.
///
/// An instance is created per node from the node's bounding box and maps a
/// candidate split plane to the probabilities of a query descending into
/// each child. For ray tracing the heuristic of choice is the surface area
/// heuristic, but the builder works with any implementation.
pub trait CostHeuristic {
    /// Precompute per-node terms from the bounds of a parent node.
    ///
    /// * `bbox` - The parent node bounds.
    fn new(bbox: &Bounds3f) -> Self;

    /// Given a split on `axis` producing children with widths `left_width`
    /// and `right_width` along that axis, compute the probabilities of
    /// traversing the left and right child during a typical query.
    ///
    /// * `axis`        - Split axis.
    /// * `left_width`  - Extent of the left child along the axis.
    /// * `right_width` - Extent of the right child along the axis.
    fn probabilities(&self, axis: usize, left_width: Float, right_width: Float) -> (Float, Float);

    /// The underlying quantity the probabilities are ratios of; used to
    /// compute the final tree cost.
    ///
    /// * `bbox` - A node's bounds.
    fn quantity(bbox: &Bounds3f) -> Float;
}

/// The 3-D surface area heuristic: traversal probabilities are proportional
/// to child surface areas over the parent surface area.
pub struct SurfaceAreaHeuristic3 {
    temp0: Vector3f,
    temp1: Vector3f,
}

impl CostHeuristic for SurfaceAreaHeuristic3 {
    fn new(bbox: &Bounds3f) -> Self {
        let extents = bbox.diagonal();
        let temp = 1.0
            / (extents.x * extents.y + extents.y * extents.z + extents.x * extents.z);
        Self {
            temp0: Vector3f::new(
                extents.y * extents.z,
                extents.x * extents.z,
                extents.x * extents.y,
            ) * temp,
            temp1: Vector3f::new(
                extents.y + extents.z,
                extents.x + extents.z,
                extents.x + extents.y,
            ) * temp,
        }
    }

    fn probabilities(&self, axis: usize, left_width: Float, right_width: Float) -> (Float, Float) {
        (
            self.temp0[axis] + self.temp1[axis] * left_width,
            self.temp0[axis] + self.temp1[axis] * right_width,
        )
    }

    fn quantity(bbox: &Bounds3f) -> Float {
        bbox.surface_area()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use aster_core::geometry::Point3f;
    use float_cmp::approx_eq;

    #[test]
    fn probabilities_sum_reflects_shared_faces() {
        let bbox = Bounds3f::new(Point3f::zero(), Point3f::new(2.0, 1.0, 1.0));
        let sah = SurfaceAreaHeuristic3::new(&bbox);

        // Splitting in the middle of the long axis gives two equal halves.
        let (pl, pr) = sah.probabilities(0, 1.0, 1.0);
        assert!(approx_eq!(f32, pl, pr, epsilon = 1e-6));

        // Unit cube halves: each child has area 4, parent 6.
        let cube = Bounds3f::new(Point3f::zero(), Point3f::new(1.0, 1.0, 1.0));
        let sah = SurfaceAreaHeuristic3::new(&cube);
        let (pl, pr) = sah.probabilities(2, 0.5, 0.5);
        assert!(approx_eq!(f32, pl, 4.0 / 6.0, epsilon = 1e-6));
        assert!(approx_eq!(f32, pr, 4.0 / 6.0, epsilon = 1e-6));
    }

    #[test]
    fn quantity_is_surface_area() {
        let bbox = Bounds3f::new(Point3f::zero(), Point3f::new(1.0, 2.0, 3.0));
        assert_eq!(SurfaceAreaHeuristic3::quantity(&bbox), 22.0);
    }
}
