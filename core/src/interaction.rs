//! Ray-surface intersections

use crate::geometry::{Float, Frame, Point2f, Point3f};

/// Detailed information about a ray-surface intersection.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Intersection {
    /// Position of the surface intersection.
    pub p: Point3f,

    /// Unoccluded distance along the ray.
    pub t: Float,

    /// UV coordinates, if any.
    pub uv: Point2f,

    /// Shading frame (based on the shading normal when the mesh provides
    /// per-vertex normals).
    pub sh_frame: Frame,

    /// Geometric frame (based on the true triangle normal).
    pub geo_frame: Frame,

    /// Index of the mesh that was hit.
    pub mesh_index: u32,

    /// Index of the triangle within the mesh that was hit.
    pub prim_index: u32,
}
