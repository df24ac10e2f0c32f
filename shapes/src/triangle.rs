//! Triangle meshes

use aster_core::common::*;
use aster_core::geometry::*;

/// An indexed triangle mesh.
///
/// Vertex positions are shared through an index buffer holding three vertex
/// indices per triangle. Normals and texture coordinates are optional; when
/// present they must cover every vertex.
#[derive(Clone, Debug, Default)]
pub struct TriangleMesh {
    positions: Vec<Point3f>,
    normals: Vec<Normal3f>,
    uvs: Vec<Point2f>,
    indices: Vec<u32>,
    bbox: Bounds3f,
}

impl TriangleMesh {
    /// Creates a new triangle mesh.
    ///
    /// * `positions` - Vertex positions.
    /// * `indices`   - Vertex indices, three per triangle.
    /// * `normals`   - Optional per-vertex shading normals.
    /// * `uvs`       - Optional per-vertex texture coordinates.
    pub fn new(
        positions: Vec<Point3f>,
        indices: Vec<u32>,
        normals: Option<Vec<Normal3f>>,
        uvs: Option<Vec<Point2f>>,
    ) -> Self {
        assert!(indices.len() % 3 == 0, "index buffer must hold triangles");
        assert!(
            indices.iter().all(|&i| (i as usize) < positions.len()),
            "vertex index out of bounds"
        );

        let normals = normals.unwrap_or_default();
        let uvs = uvs.unwrap_or_default();
        assert!(normals.is_empty() || normals.len() == positions.len());
        assert!(uvs.is_empty() || uvs.len() == positions.len());

        let mut bbox = Bounds3f::empty();
        for p in positions.iter() {
            bbox = bbox.union_point(p);
        }

        debug!(
            "Created a triangle mesh ({} triangles, {} vertices)",
            indices.len() / 3,
            positions.len()
        );

        Self {
            positions,
            normals,
            uvs,
            indices,
            bbox,
        }
    }

    /// Return the total number of triangles.
    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }

    /// Return the total number of vertices.
    pub fn vertex_count(&self) -> u32 {
        self.positions.len() as u32
    }

    /// Return an axis-aligned bounding box containing the whole mesh.
    pub fn bounding_box(&self) -> Bounds3f {
        self.bbox
    }

    /// Return true if the mesh carries per-vertex shading normals.
    pub fn has_normals(&self) -> bool {
        !self.normals.is_empty()
    }

    /// Return true if the mesh carries per-vertex texture coordinates.
    pub fn has_uvs(&self) -> bool {
        !self.uvs.is_empty()
    }

    /// Return the three vertex positions of a triangle.
    ///
    /// * `index` - Triangle index.
    #[inline]
    pub fn triangle(&self, index: u32) -> (Point3f, Point3f, Point3f) {
        let (i0, i1, i2) = self.vertex_indices(index);
        (
            self.positions[i0 as usize],
            self.positions[i1 as usize],
            self.positions[i2 as usize],
        )
    }

    /// Return the three vertex indices of a triangle.
    ///
    /// * `index` - Triangle index.
    #[inline]
    pub fn vertex_indices(&self, index: u32) -> (u32, u32, u32) {
        let base = 3 * index as usize;
        (
            self.indices[base],
            self.indices[base + 1],
            self.indices[base + 2],
        )
    }

    /// Return the shading normal of a vertex.
    ///
    /// * `vertex` - Vertex index.
    #[inline]
    pub fn normal(&self, vertex: u32) -> Normal3f {
        self.normals[vertex as usize]
    }

    /// Return the texture coordinates of a vertex.
    ///
    /// * `vertex` - Vertex index.
    #[inline]
    pub fn uv(&self, vertex: u32) -> Point2f {
        self.uvs[vertex as usize]
    }

    /// Return the surface area of a triangle.
    ///
    /// * `index` - Triangle index.
    pub fn surface_area(&self, index: u32) -> Float {
        let (p0, p1, p2) = self.triangle(index);
        0.5 * (p1 - p0).cross(&(p2 - p0)).length()
    }

    /// Return an axis-aligned bounding box containing a single triangle.
    ///
    /// * `index` - Triangle index.
    pub fn triangle_bounding_box(&self, index: u32) -> Bounds3f {
        let (p0, p1, p2) = self.triangle(index);
        Bounds3f::from(p0).union_point(&p1).union_point(&p2)
    }

    /// Returns the axis-aligned bounding box of a triangle after it has been
    /// clipped to the extents of another box.
    ///
    /// The triangle is clipped against the six box planes with
    /// Sutherland-Hodgman iterations carried out in double precision, then
    /// the result is rounded outward to single precision and intersected
    /// with the clip box. An invalid box is returned when the triangle lies
    /// fully outside.
    ///
    /// * `index` - Triangle index.
    /// * `clip`  - The clip box.
    pub fn clipped_bounding_box(&self, index: u32, clip: &Bounds3f) -> Bounds3f {
        let (p0, p1, p2) = self.triangle(index);

        // Room for the up-to-9 vertices a triangle can gain from 6 plane clips.
        let mut buf_a = [[0.0_f64; 3]; 10];
        let mut buf_b = [[0.0_f64; 3]; 10];
        buf_a[0] = [p0.x as f64, p0.y as f64, p0.z as f64];
        buf_a[1] = [p1.x as f64, p1.y as f64, p1.z as f64];
        buf_a[2] = [p2.x as f64, p2.y as f64, p2.z as f64];
        let mut count = 3;

        for axis in 0..3 {
            count = clip_polygon(
                &buf_a[..count],
                &mut buf_b,
                axis,
                clip.p_min[axis] as f64,
                true,
            );
            count = clip_polygon(
                &buf_b[..count],
                &mut buf_a,
                axis,
                clip.p_max[axis] as f64,
                false,
            );
            if count == 0 {
                return Bounds3f::empty();
            }
        }

        let mut p_min = Point3f::new(INFINITY, INFINITY, INFINITY);
        let mut p_max = Point3f::new(-INFINITY, -INFINITY, -INFINITY);
        for v in buf_a[..count].iter() {
            for axis in 0..3 {
                p_min[axis] = min(p_min[axis], cast_down(v[axis]));
                p_max[axis] = max(p_max[axis], cast_up(v[axis]));
            }
        }

        Bounds3f { p_min, p_max }.intersect(clip)
    }

    /// Intersect a ray against a triangle (Moeller-Trumbore) and return the
    /// parametric distance together with the barycentric hit coordinates.
    ///
    /// * `index` - Triangle index.
    /// * `ray`   - The ray segment.
    pub fn intersect_triangle(&self, index: u32, ray: &Ray) -> Option<(Float, Float, Float)> {
        let (p0, p1, p2) = self.triangle(index);

        let edge1 = p1 - p0;
        let edge2 = p2 - p0;

        let pvec = ray.d.cross(&edge2);
        let det = edge1.dot(&pvec);
        if det > -1e-8 && det < 1e-8 {
            return None;
        }
        let inv_det = 1.0 / det;

        let tvec = ray.o - p0;
        let u = tvec.dot(&pvec) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }

        let qvec = tvec.cross(&edge1);
        let v = ray.d.dot(&qvec) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }

        let t = edge2.dot(&qvec) * inv_det;
        if t >= ray.mint && t <= ray.maxt {
            Some((t, u, v))
        } else {
            None
        }
    }

    /// Shadow-ray fast path for [`TriangleMesh::intersect_triangle`].
    ///
    /// * `index` - Triangle index.
    /// * `ray`   - The ray segment.
    pub fn intersect_triangle_p(&self, index: u32, ray: &Ray) -> bool {
        self.intersect_triangle(index, ray).is_some()
    }
}

/// Clip a polygon against an axis-aligned plane, keeping the side selected
/// by `keep_below` (the negative side of the plane when true).
///
/// * `input`      - Input polygon vertices.
/// * `output`     - Output vertex buffer.
/// * `axis`       - Plane axis.
/// * `pos`        - Plane position along the axis.
/// * `keep_above` - Keep vertices with `v[axis] >= pos` when true, else
///                  those with `v[axis] <= pos`.
fn clip_polygon(
    input: &[[f64; 3]],
    output: &mut [[f64; 3]; 10],
    axis: usize,
    pos: f64,
    keep_above: bool,
) -> usize {
    let inside = |v: &[f64; 3]| {
        if keep_above {
            v[axis] >= pos
        } else {
            v[axis] <= pos
        }
    };

    let mut count = 0;
    for i in 0..input.len() {
        let cur = input[i];
        let next = input[(i + 1) % input.len()];
        let cur_in = inside(&cur);
        let next_in = inside(&next);

        if cur_in {
            output[count] = cur;
            count += 1;
        }
        if cur_in != next_in {
            let t = (pos - cur[axis]) / (next[axis] - cur[axis]);
            let mut hit = [0.0_f64; 3];
            for k in 0..3 {
                hit[k] = cur[k] + t * (next[k] - cur[k]);
            }
            hit[axis] = pos;
            output[count] = hit;
            count += 1;
        }
    }
    count
}

/// Round a double to the closest float at or below it.
fn cast_down(v: f64) -> Float {
    let f = v as Float;
    if f as f64 > v {
        next_float_down(f)
    } else {
        f
    }
}

/// Round a double to the closest float at or above it.
fn cast_up(v: f64) -> Float {
    let f = v as Float;
    if (f as f64) < v {
        next_float_up(f)
    } else {
        f
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    fn unit_triangle() -> TriangleMesh {
        TriangleMesh::new(
            vec![
                Point3f::new(0.0, 0.0, 0.0),
                Point3f::new(1.0, 0.0, 0.0),
                Point3f::new(0.0, 1.0, 0.0),
            ],
            vec![0, 1, 2],
            None,
            None,
        )
    }

    #[test]
    fn moeller_trumbore_hit() {
        let mesh = unit_triangle();
        let ray = Ray::new(
            Point3f::new(0.25, 0.25, 1.0),
            Vector3f::new(0.0, 0.0, -1.0),
            0.0,
            INFINITY,
        );
        let (t, u, v) = mesh.intersect_triangle(0, &ray).unwrap();
        assert!(approx_eq!(f32, t, 1.0, epsilon = 1e-6));
        assert!(approx_eq!(f32, u, 0.25, epsilon = 1e-6));
        assert!(approx_eq!(f32, v, 0.25, epsilon = 1e-6));
    }

    #[test]
    fn moeller_trumbore_miss_outside_barycentrics() {
        let mesh = unit_triangle();
        let ray = Ray::new(
            Point3f::new(0.75, 0.75, 1.0),
            Vector3f::new(0.0, 0.0, -1.0),
            0.0,
            INFINITY,
        );
        assert!(mesh.intersect_triangle(0, &ray).is_none());
    }

    #[test]
    fn moeller_trumbore_respects_segment() {
        let mesh = unit_triangle();
        let ray = Ray::new(
            Point3f::new(0.25, 0.25, 1.0),
            Vector3f::new(0.0, 0.0, -1.0),
            0.0,
            0.5,
        );
        assert!(mesh.intersect_triangle(0, &ray).is_none());
    }

    #[test]
    fn clipped_box_halves_triangle() {
        let mesh = unit_triangle();
        let clip = Bounds3f::new(
            Point3f::new(-1.0, -1.0, -1.0),
            Point3f::new(0.5, 1.0, 1.0),
        );
        let b = mesh.clipped_bounding_box(0, &clip);
        assert!(b.is_valid());
        assert!(approx_eq!(f32, b.p_max.x, 0.5, epsilon = 1e-6));
        assert!(approx_eq!(f32, b.p_max.y, 1.0, epsilon = 1e-6));
        assert_eq!(b.p_min.x, 0.0);
    }

    #[test]
    fn clipped_box_outside_is_invalid() {
        let mesh = unit_triangle();
        let clip = Bounds3f::new(
            Point3f::new(2.0, 2.0, 2.0),
            Point3f::new(3.0, 3.0, 3.0),
        );
        assert!(!mesh.clipped_bounding_box(0, &clip).is_valid());
    }

    #[test]
    fn clipped_box_of_planar_triangle_is_flat() {
        let mesh = unit_triangle();
        let clip = Bounds3f::new(
            Point3f::new(-1.0, -1.0, -1.0),
            Point3f::new(1.0, 1.0, 1.0),
        );
        let b = mesh.clipped_bounding_box(0, &clip);
        assert_eq!(b.p_min.z, 0.0);
        assert_eq!(b.p_max.z, 0.0);
        assert!(b.surface_area() > 0.0);
    }

    #[test]
    fn degenerate_triangle_clips_to_zero_area() {
        let mesh = TriangleMesh::new(
            vec![
                Point3f::new(0.0, 0.0, 0.0),
                Point3f::new(1.0, 0.0, 0.0),
                Point3f::new(2.0, 0.0, 0.0),
            ],
            vec![0, 1, 2],
            None,
            None,
        );
        let clip = Bounds3f::new(
            Point3f::new(-1.0, -1.0, -1.0),
            Point3f::new(3.0, 1.0, 1.0),
        );
        let b = mesh.clipped_bounding_box(0, &clip);
        assert_eq!(b.surface_area(), 0.0);
    }

    #[test]
    fn triangle_surface_area() {
        let mesh = unit_triangle();
        assert!(approx_eq!(f32, mesh.surface_area(0), 0.5, epsilon = 1e-6));
    }

    proptest::proptest! {
        #[test]
        fn clipped_box_is_contained(
            cx in -0.5..1.5f32,
            cy in -0.5..1.5f32,
            cz in -0.5..0.5f32,
            hx in 0.1..1.0f32,
            hy in 0.1..1.0f32,
            hz in 0.1..1.0f32,
        ) {
            let mesh = unit_triangle();
            let clip = Bounds3f::new(
                Point3f::new(cx - hx, cy - hy, cz - hz),
                Point3f::new(cx + hx, cy + hy, cz + hz),
            );
            let clipped = mesh.clipped_bounding_box(0, &clip);
            if clipped.is_valid() {
                // The result stays inside both the clip box and the
                // triangle's own bounds.
                proptest::prop_assert!(clip.intersect(&clipped) == clipped);
                let tri = mesh.triangle_bounding_box(0);
                let eps = 1e-5;
                proptest::prop_assert!(clipped.p_min.x >= tri.p_min.x - eps);
                proptest::prop_assert!(clipped.p_max.x <= tri.p_max.x + eps);
                proptest::prop_assert!(clipped.p_min.y >= tri.p_min.y - eps);
                proptest::prop_assert!(clipped.p_max.y <= tri.p_max.y + eps);
            }
        }
    }
}
