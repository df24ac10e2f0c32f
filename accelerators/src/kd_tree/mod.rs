//! SAH kd-tree over triangle meshes.
//!
//! The construction algorithm builds "perfect split" trees as outlined in
//! "On Building fast kd-Trees for Ray Tracing, and on doing that in
//! O(N log N)" by Wald and Havran: min-max binning near the root for cache
//! friendliness, an exact edge-event sweep with Sutherland-Hodgman
//! re-clipping further down, bad-refine gating and subtree retraction, with
//! sibling subtrees handed to a pool of worker threads. Queries run the
//! robust TA^B_rec traversal from Havran's thesis over 8-byte packed nodes.

mod bins;
mod builder;
mod common;
mod error;
mod events;
mod node;
mod sah;
mod traverse;

// Re-export
pub use builder::KdTreeConfig;
pub use common::BuildStats;
pub use error::{KdTreeError, Result};
pub use sah::{CostHeuristic, SurfaceAreaHeuristic3};
pub use traverse::KdTree;

use aster_core::geometry::{Bounds3f, Float, Frame, Normal3f, Point2f, Point3f, Ray, Vector3f};
use aster_core::interaction::Intersection;
use aster_core::primitive::Geometry;
use aster_shapes::TriangleMesh;

/// A three-dimensional kd-tree that intersects rays against triangle
/// meshes.
///
/// Meshes are registered with [`TriangleKdTree::add_mesh`] before a single
/// [`TriangleKdTree::build`] call; afterwards any number of threads may
/// query the tree concurrently. The builder sees all registered meshes as
/// one flat primitive set and the mapping back to (mesh, triangle) pairs is
/// kept in a monotonic offset table.
pub struct TriangleKdTree {
    meshes: Vec<TriangleMesh>,
    size_map: Vec<u32>,
    primitive_count: u32,
    config: KdTreeConfig,
    tree: Option<KdTree>,
}

impl TriangleKdTree {
    /// Create a new, empty kd-tree with default construction parameters.
    pub fn new() -> Self {
        Self::with_config(KdTreeConfig::default())
    }

    /// Create a new, empty kd-tree with the given construction parameters.
    ///
    /// * `config` - Construction parameters.
    pub fn with_config(config: KdTreeConfig) -> Self {
        Self {
            meshes: Vec::new(),
            size_map: vec![0],
            primitive_count: 0,
            config,
            tree: None,
        }
    }

    /// Access the construction parameters; meaningful before `build` only.
    pub fn config_mut(&mut self) -> &mut KdTreeConfig {
        &mut self.config
    }

    /// Register a triangle mesh for inclusion in the kd-tree. Only valid
    /// before [`TriangleKdTree::build`].
    ///
    /// * `mesh` - The mesh.
    pub fn add_mesh(&mut self, mesh: TriangleMesh) -> Result<()> {
        if self.tree.is_some() {
            return Err(KdTreeError::Configuration(
                "meshes can only be registered before the kd-tree is built".to_string(),
            ));
        }
        self.primitive_count += mesh.triangle_count();
        self.size_map
            .push(self.size_map[self.size_map.len() - 1] + mesh.triangle_count());
        self.meshes.push(mesh);
        Ok(())
    }

    /// Build the kd-tree. Rejects a second call.
    pub fn build(&mut self) -> Result<()> {
        if self.tree.is_some() {
            return Err(KdTreeError::Configuration(
                "the kd-tree has already been built".to_string(),
            ));
        }
        info!(
            "Constructing a SAH kd-tree ({} triangles, {} threads) ..",
            self.primitive_count,
            num_cpus::get()
        );
        let tree = builder::build::<Self, SurfaceAreaHeuristic3>(&self.config, self)?;
        self.tree = Some(tree);
        Ok(())
    }

    /// Return whether the kd-tree has been built.
    pub fn is_built(&self) -> bool {
        self.tree.is_some()
    }

    /// Return the total number of internally represented triangles.
    pub fn primitive_count(&self) -> u32 {
        self.primitive_count
    }

    /// Return the total number of registered meshes.
    pub fn mesh_count(&self) -> u32 {
        self.meshes.len() as u32
    }

    /// Return one of the registered meshes.
    ///
    /// * `index` - Mesh index.
    pub fn mesh(&self, index: u32) -> &TriangleMesh {
        &self.meshes[index as usize]
    }

    /// Return an axis-aligned bounding box containing the entire tree.
    /// Before `build` this is the union of the registered mesh bounds.
    pub fn bounding_box(&self) -> Bounds3f {
        match &self.tree {
            Some(tree) => *tree.bounding_box(),
            None => self
                .meshes
                .iter()
                .fold(Bounds3f::empty(), |b, m| b.union(&m.bounding_box())),
        }
    }

    /// Return the tight bounding box of the registered geometry, available
    /// once the tree is built.
    pub fn tight_bounding_box(&self) -> Option<&Bounds3f> {
        self.tree.as_ref().map(|t| t.tight_bounding_box())
    }

    /// Return the statistics recorded while building the tree.
    pub fn stats(&self) -> Option<&BuildStats> {
        self.tree.as_ref().map(|t| t.stats())
    }

    /// Intersect a ray against all registered triangle meshes and return
    /// detailed information about the closest intersection, if any.
    ///
    /// Queries against an unbuilt tree report no hit.
    ///
    /// * `ray` - The ray segment.
    pub fn ray_intersect(&self, ray: &Ray) -> Option<Intersection> {
        let tree = self.tree.as_ref()?;
        let (prim_index, t, u, v) = tree.ray_intersect(self, ray)?;
        Some(self.fill_intersection(prim_index, t, u, v))
    }

    /// Check whether a ray is occluded by any registered mesh without
    /// computing intersection details. This is usually much faster than
    /// [`TriangleKdTree::ray_intersect`].
    ///
    /// * `ray` - The ray segment.
    pub fn ray_intersect_p(&self, ray: &Ray) -> bool {
        match &self.tree {
            Some(tree) => tree.ray_intersect_p(self, ray),
            None => false,
        }
    }

    /// Compute the mesh index and local triangle index for a flat primitive
    /// index.
    ///
    /// * `index` - Flat primitive index.
    #[inline]
    fn find_mesh(&self, index: u32) -> (usize, u32) {
        let mesh_index = self.size_map.partition_point(|&s| s <= index) - 1;
        (mesh_index, index - self.size_map[mesh_index])
    }

    /// Recover the hit position, UV coordinates and surface frames from the
    /// barycentric coordinates of a triangle intersection.
    fn fill_intersection(&self, prim_index: u32, t: Float, u: Float, v: Float) -> Intersection {
        let (mesh_index, local) = self.find_mesh(prim_index);
        let mesh = &self.meshes[mesh_index];
        let (i0, i1, i2) = mesh.vertex_indices(local);
        let (p0, p1, p2) = mesh.triangle(local);
        let w = 1.0 - u - v;

        let p = Point3f::from(
            Vector3f::from(p0) * w + Vector3f::from(p1) * u + Vector3f::from(p2) * v,
        );

        let uv = if mesh.has_uvs() {
            mesh.uv(i0) * w + mesh.uv(i1) * u + mesh.uv(i2) * v
        } else {
            Point2f::new(u, v)
        };

        let geo_frame = Frame::from_normal(Normal3f::from(
            (p1 - p0).cross(&(p2 - p0)).normalize(),
        ));
        let sh_frame = if mesh.has_normals() {
            let n = mesh.normal(i0) * w + mesh.normal(i1) * u + mesh.normal(i2) * v;
            Frame::from_normal(n.normalize())
        } else {
            geo_frame
        };

        Intersection {
            p,
            t,
            uv,
            sh_frame,
            geo_frame,
            mesh_index: mesh_index as u32,
            prim_index: local,
        }
    }
}

impl Default for TriangleKdTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Geometry for TriangleKdTree {
    fn primitive_count(&self) -> u32 {
        self.primitive_count
    }

    fn bounding_box(&self, index: u32) -> Bounds3f {
        let (mesh_index, local) = self.find_mesh(index);
        self.meshes[mesh_index].triangle_bounding_box(local)
    }

    fn clipped_bounding_box(&self, index: u32, clip: &Bounds3f) -> Bounds3f {
        let (mesh_index, local) = self.find_mesh(index);
        self.meshes[mesh_index].clipped_bounding_box(local, clip)
    }

    fn intersect(&self, index: u32, ray: &Ray) -> Option<(Float, Float, Float)> {
        let (mesh_index, local) = self.find_mesh(index);
        self.meshes[mesh_index].intersect_triangle(local, ray)
    }

    fn intersect_p(&self, index: u32, ray: &Ray) -> bool {
        let (mesh_index, local) = self.find_mesh(index);
        self.meshes[mesh_index].intersect_triangle_p(local, ray)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use aster_core::common::{INFINITY, RAY_EPSILON};
    use aster_core::rng::Rng;
    use float_cmp::approx_eq;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn unit_triangle_mesh() -> TriangleMesh {
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

    /// Axis-aligned box with the given center and half extent, as 12
    /// triangles.
    fn box_mesh(center: Point3f, half: Float) -> TriangleMesh {
        let mut positions = Vec::with_capacity(8);
        for i in 0..8_u32 {
            let x = if i & 1 == 0 { -half } else { half };
            let y = if i & 2 == 0 { -half } else { half };
            let z = if i & 4 == 0 { -half } else { half };
            positions.push(Point3f::new(center.x + x, center.y + y, center.z + z));
        }
        let indices = vec![
            0, 1, 3, 0, 3, 2, // -z
            4, 5, 7, 4, 7, 6, // +z
            0, 1, 5, 0, 5, 4, // -y
            2, 3, 7, 2, 7, 6, // +y
            0, 2, 6, 0, 6, 4, // -x
            1, 3, 7, 1, 7, 5, // +x
        ];
        TriangleMesh::new(positions, indices, None, None)
    }

    /// Deterministic soup of small random triangles inside the unit cube.
    fn random_soup(count: u32, seed: u64) -> TriangleMesh {
        let mut rng = Rng::new(seed);
        let mut positions = Vec::with_capacity(3 * count as usize);
        let mut indices = Vec::with_capacity(3 * count as usize);
        for i in 0..count {
            let base = Point3f::new(
                rng.uniform_float(),
                rng.uniform_float(),
                rng.uniform_float(),
            );
            positions.push(base);
            positions.push(Point3f::new(
                base.x + 0.1 * (rng.uniform_float() - 0.5),
                base.y + 0.1 * (rng.uniform_float() - 0.5),
                base.z + 0.1 * (rng.uniform_float() - 0.5),
            ));
            positions.push(Point3f::new(
                base.x + 0.1 * (rng.uniform_float() - 0.5),
                base.y + 0.1 * (rng.uniform_float() - 0.5),
                base.z + 0.1 * (rng.uniform_float() - 0.5),
            ));
            indices.push(3 * i);
            indices.push(3 * i + 1);
            indices.push(3 * i + 2);
        }
        TriangleMesh::new(positions, indices, None, None)
    }

    fn random_ray(rng: &mut Rng, axis_aligned: bool) -> Ray {
        let o = Point3f::new(
            2.0 * rng.uniform_float() - 0.5,
            2.0 * rng.uniform_float() - 0.5,
            2.0 * rng.uniform_float() - 0.5,
        );
        let d = if axis_aligned {
            let mut d = Vector3f::zero();
            d[(rng.bounded_u32(3)) as usize] = if rng.bounded_u32(2) == 0 { 1.0 } else { -1.0 };
            d
        } else {
            Vector3f::new(
                rng.uniform_float() - 0.5,
                rng.uniform_float() - 0.5,
                rng.uniform_float() - 0.5,
            )
        };
        if d == Vector3f::zero() {
            return Ray::new(o, Vector3f::new(0.0, 0.0, 1.0), 0.0, INFINITY);
        }
        Ray::new(o, d, 0.0, INFINITY)
    }

    /// Reference intersection over every primitive.
    fn brute_force(tree: &TriangleKdTree, ray: &Ray) -> Option<(Float, u32)> {
        let mut best: Option<(Float, u32)> = None;
        let mut segment = *ray;
        for i in 0..Geometry::primitive_count(tree) {
            if let Some((t, _, _)) = tree.intersect(i, &segment) {
                segment.maxt = t;
                best = Some((t, i));
            }
        }
        best
    }

    #[test]
    fn single_triangle_hit() {
        init_logger();
        let mut tree = TriangleKdTree::new();
        tree.add_mesh(unit_triangle_mesh()).unwrap();
        tree.build().unwrap();

        let ray = Ray::new(
            Point3f::new(0.25, 0.25, 1.0),
            Vector3f::new(0.0, 0.0, -1.0),
            0.0,
            INFINITY,
        );
        let its = tree.ray_intersect(&ray).expect("expected a hit");
        assert!(approx_eq!(f32, its.t, 1.0, epsilon = 1e-6));
        assert!(approx_eq!(f32, its.uv.x, 0.25, epsilon = 1e-6));
        assert!(approx_eq!(f32, its.uv.y, 0.25, epsilon = 1e-6));
        assert!(approx_eq!(f32, its.p.z, 0.0, epsilon = 1e-6));
        assert_eq!(its.mesh_index, 0);
        assert_eq!(its.prim_index, 0);
        assert!(approx_eq!(f32, its.geo_frame.n.z, 1.0, epsilon = 1e-6));
    }

    #[test]
    fn empty_scene_builds_and_misses() {
        init_logger();
        let mut tree = TriangleKdTree::new();
        tree.build().unwrap();
        assert!(tree.is_built());
        assert_eq!(tree.stats().unwrap().node_count, 1);

        let ray = Ray::new(
            Point3f::new(0.0, 0.0, 5.0),
            Vector3f::new(0.0, 0.0, -1.0),
            0.0,
            INFINITY,
        );
        assert!(tree.ray_intersect(&ray).is_none());
        assert!(!tree.ray_intersect_p(&ray));
    }

    #[test]
    fn double_build_is_rejected() {
        let mut tree = TriangleKdTree::new();
        tree.add_mesh(unit_triangle_mesh()).unwrap();
        tree.build().unwrap();
        assert!(matches!(
            tree.build(),
            Err(KdTreeError::Configuration(_))
        ));
        assert!(matches!(
            tree.add_mesh(unit_triangle_mesh()),
            Err(KdTreeError::Configuration(_))
        ));
    }

    #[test]
    fn invalid_parameters_fail_synchronously() {
        for config in [
            KdTreeConfig {
                traversal_cost: 0.0,
                ..KdTreeConfig::default()
            },
            KdTreeConfig {
                query_cost: -1.0,
                ..KdTreeConfig::default()
            },
            KdTreeConfig {
                empty_space_bonus: 0.0,
                ..KdTreeConfig::default()
            },
            KdTreeConfig {
                empty_space_bonus: 1.5,
                ..KdTreeConfig::default()
            },
            KdTreeConfig {
                min_max_bins: 1,
                ..KdTreeConfig::default()
            },
        ] {
            let mut tree = TriangleKdTree::with_config(config);
            tree.add_mesh(unit_triangle_mesh()).unwrap();
            assert!(matches!(
                tree.build(),
                Err(KdTreeError::Configuration(_))
            ));
            assert!(!tree.is_built());
            assert!(tree.ray_intersect(&Ray::default()).is_none());
        }
    }

    #[test]
    fn shared_edge_reports_one_hit() {
        init_logger();
        let mesh = TriangleMesh::new(
            vec![
                Point3f::new(0.0, 0.0, 0.0),
                Point3f::new(1.0, 0.0, 0.0),
                Point3f::new(1.0, 1.0, 0.0),
                Point3f::new(0.0, 1.0, 0.0),
            ],
            vec![0, 1, 2, 0, 2, 3],
            None,
            None,
        );
        let mut tree = TriangleKdTree::new();
        tree.add_mesh(mesh).unwrap();
        tree.build().unwrap();

        // Straight through the shared diagonal edge.
        let ray = Ray::new(
            Point3f::new(0.5, 0.5, 1.0),
            Vector3f::new(0.0, 0.0, -1.0),
            0.0,
            INFINITY,
        );
        let its = tree.ray_intersect(&ray).expect("expected a hit");
        assert!(approx_eq!(f32, its.t, 1.0, epsilon = 1e-6));
        assert!(tree.ray_intersect_p(&ray));
    }

    #[test]
    fn axis_aligned_box_first_hit() {
        init_logger();
        let mut tree = TriangleKdTree::new();
        tree.add_mesh(box_mesh(Point3f::zero(), 1.0)).unwrap();
        tree.build().unwrap();

        let ray = Ray::new(
            Point3f::new(5.0, 0.1, 0.1),
            Vector3f::new(-1.0, 0.0, 0.0),
            RAY_EPSILON,
            INFINITY,
        );
        let its = tree.ray_intersect(&ray).expect("expected a hit");
        assert!(approx_eq!(f32, its.t, 4.0, epsilon = 1e-4));
        assert!(approx_eq!(f32, its.p.x, 1.0, epsilon = 1e-4));
    }

    #[test]
    fn shadow_ray_monotonicity() {
        let mut tree = TriangleKdTree::new();
        tree.add_mesh(box_mesh(Point3f::zero(), 1.0)).unwrap();
        tree.build().unwrap();

        let o = Point3f::new(5.0, 0.1, 0.1);
        let d = Vector3f::new(-1.0, 0.0, 0.0);
        let t_star = tree
            .ray_intersect(&Ray::new(o, d, 0.0, INFINITY))
            .unwrap()
            .t;

        assert!(tree.ray_intersect_p(&Ray::new(o, d, 0.0, t_star + 1e-3)));
        assert!(!tree.ray_intersect_p(&Ray::new(o, d, 0.0, t_star - 1e-3)));
    }

    #[test]
    fn degenerate_triangle_does_not_break_neighbors() {
        init_logger();
        let mesh = TriangleMesh::new(
            vec![
                // Zero-area triangle (collinear points).
                Point3f::new(0.0, 0.0, 0.5),
                Point3f::new(1.0, 0.0, 0.5),
                Point3f::new(2.0, 0.0, 0.5),
                // A real triangle behind it.
                Point3f::new(0.0, 0.0, 0.0),
                Point3f::new(1.0, 0.0, 0.0),
                Point3f::new(0.0, 1.0, 0.0),
            ],
            vec![0, 1, 2, 3, 4, 5],
            None,
            None,
        );
        let mut tree = TriangleKdTree::new();
        tree.add_mesh(mesh).unwrap();
        tree.build().unwrap();

        let ray = Ray::new(
            Point3f::new(0.25, 0.25, 1.0),
            Vector3f::new(0.0, 0.0, -1.0),
            0.0,
            INFINITY,
        );
        let its = tree.ray_intersect(&ray).expect("expected a hit");
        assert!(approx_eq!(f32, its.t, 1.0, epsilon = 1e-6));
        assert_eq!(its.prim_index, 1);
    }

    #[test]
    fn random_soup_matches_brute_force() {
        init_logger();
        let mut tree = TriangleKdTree::new();
        tree.add_mesh(random_soup(10_000, 42)).unwrap();
        tree.build().unwrap();

        let mut rng = Rng::new(7);
        let mut hits = 0;
        for i in 0..1000 {
            let ray = random_ray(&mut rng, i % 3 == 0);
            let reference = brute_force(&tree, &ray);
            let result = tree.ray_intersect(&ray);

            assert_eq!(
                reference.is_some(),
                result.is_some(),
                "hit mismatch for ray {:?}",
                ray
            );
            if let (Some((t_ref, _)), Some(its)) = (reference, result) {
                let tol = 1e-4 * ray.d.length();
                assert!(
                    (t_ref - its.t).abs() <= tol,
                    "t mismatch: {} vs {}",
                    t_ref,
                    its.t
                );
                hits += 1;

                // Shadow queries agree with the detailed query.
                assert!(tree.ray_intersect_p(&ray));

                // Continuation rays start exactly on surfaces and split
                // planes; the traversal must not lose them.
                let cont = Ray::new(ray.at(its.t), ray.d, 1e-4, INFINITY);
                let cont_ref = brute_force(&tree, &cont);
                let cont_result = tree.ray_intersect(&cont);
                assert_eq!(cont_ref.is_some(), cont_result.is_some());
            }
        }
        assert!(hits > 100, "suspiciously few hits: {}", hits);
    }

    #[test]
    fn parallel_build_is_deterministic() {
        init_logger();
        let soup = random_soup(10_000, 11);

        // Two parallel builds over the same input must agree bit for bit;
        // worker scheduling affects who builds a subtree, never its shape.
        let mut first = TriangleKdTree::new();
        first.config_mut().exact_prim_threshold = 512;
        first.add_mesh(soup.clone()).unwrap();
        first.build().unwrap();

        let mut second = TriangleKdTree::new();
        second.config_mut().exact_prim_threshold = 512;
        second.add_mesh(soup.clone()).unwrap();
        second.build().unwrap();

        let a = first.stats().unwrap();
        let b = second.stats().unwrap();
        assert_eq!(a.node_count, b.node_count);
        assert_eq!(a.index_count, b.index_count);
        assert_eq!(a.inner_node_count, b.inner_node_count);
        assert_eq!(a.leaf_node_count, b.leaf_node_count);
        assert_eq!(a.retracted_splits, b.retracted_splits);
        assert_eq!(a.pruned_primitives, b.pruned_primitives);
        assert_eq!(a.heuristic_cost.to_bits(), b.heuristic_cost.to_bits());

        // A serial build of the same scene must answer queries identically.
        let mut serial = TriangleKdTree::new();
        serial.config_mut().exact_prim_threshold = 512;
        serial.config_mut().parallel_build = false;
        serial.add_mesh(soup).unwrap();
        serial.build().unwrap();

        let mut rng = Rng::new(3);
        for _ in 0..200 {
            let ray = random_ray(&mut rng, false);
            let p = first.ray_intersect(&ray);
            let q = second.ray_intersect(&ray);
            let s = serial.ray_intersect(&ray);
            assert_eq!(p.is_some(), q.is_some());
            assert_eq!(p.is_some(), s.is_some());
            if let (Some(p), Some(q), Some(s)) = (p, q, s) {
                assert_eq!(p.t.to_bits(), q.t.to_bits());
                assert_eq!(p.t.to_bits(), s.t.to_bits());
                assert_eq!((p.mesh_index, p.prim_index), (q.mesh_index, q.prim_index));
            }
        }
    }

    #[test]
    fn disabling_clipping_still_matches_brute_force() {
        init_logger();
        let mut tree = TriangleKdTree::new();
        tree.config_mut().clip = false;
        tree.add_mesh(random_soup(2000, 19)).unwrap();
        tree.build().unwrap();

        let mut rng = Rng::new(23);
        for i in 0..300 {
            let ray = random_ray(&mut rng, i % 4 == 0);
            let reference = brute_force(&tree, &ray);
            let result = tree.ray_intersect(&ray);
            assert_eq!(reference.is_some(), result.is_some());
            if let (Some((t_ref, _)), Some(its)) = (reference, result) {
                assert!((t_ref - its.t).abs() <= 1e-4 * ray.d.length());
            }
        }
    }

    #[test]
    fn heavily_overlapping_triangles_build_and_answer() {
        init_logger();
        // Fifty coincident copies of one triangle defeat every split plane,
        // driving the bad-refine and retraction machinery.
        let mut positions = Vec::new();
        let mut indices = Vec::new();
        for i in 0..50_u32 {
            positions.push(Point3f::new(0.0, 0.0, 0.0));
            positions.push(Point3f::new(1.0, 0.0, 0.0));
            positions.push(Point3f::new(0.0, 1.0, 0.0));
            indices.extend_from_slice(&[3 * i, 3 * i + 1, 3 * i + 2]);
        }
        // Plus some spread-out geometry (shifted aside) so the tree still
        // splits.
        let soup = random_soup(500, 29);
        let base = positions.len() as u32;
        let shift = Vector3f::new(3.0, 0.0, 0.0);
        for t in 0..soup.triangle_count() {
            let (p0, p1, p2) = soup.triangle(t);
            positions.extend_from_slice(&[p0 + shift, p1 + shift, p2 + shift]);
            indices.extend_from_slice(&[base + 3 * t, base + 3 * t + 1, base + 3 * t + 2]);
        }

        let mut tree = TriangleKdTree::new();
        tree.add_mesh(TriangleMesh::new(positions, indices, None, None))
            .unwrap();
        tree.build().unwrap();

        let ray = Ray::new(
            Point3f::new(0.25, 0.25, -1.0),
            Vector3f::new(0.0, 0.0, 1.0),
            0.0,
            INFINITY,
        );
        let its = tree.ray_intersect(&ray).expect("expected a hit");
        assert!(approx_eq!(f32, its.t, 1.0, epsilon = 1e-6));

        let mut rng = Rng::new(31);
        for _ in 0..100 {
            let ray = random_ray(&mut rng, false);
            let reference = brute_force(&tree, &ray);
            let result = tree.ray_intersect(&ray);
            assert_eq!(reference.is_some(), result.is_some());
        }
    }

    #[test]
    fn tree_cost_beats_single_leaf() {
        init_logger();
        let mut tree = TriangleKdTree::new();
        tree.add_mesh(random_soup(1000, 5)).unwrap();
        tree.build().unwrap();

        let stats = *tree.stats().unwrap();
        let leaf_cost = 1000.0 * KdTreeConfig::default().query_cost;
        assert!(stats.heuristic_cost > 0.0);
        assert!(stats.heuristic_cost < leaf_cost);

        // The cost is a pure function of the input.
        let mut again = TriangleKdTree::new();
        again.add_mesh(random_soup(1000, 5)).unwrap();
        again.build().unwrap();
        assert_eq!(
            stats.heuristic_cost.to_bits(),
            again.stats().unwrap().heuristic_cost.to_bits()
        );
    }

    #[test]
    fn grazing_rays_on_box_faces() {
        init_logger();
        let mut tree = TriangleKdTree::new();
        tree.add_mesh(box_mesh(Point3f::zero(), 1.0)).unwrap();
        tree.build().unwrap();

        // From inside toward each face.
        for axis in 0..3_usize {
            for sign in [-1.0_f32, 1.0] {
                let mut d = Vector3f::zero();
                d[axis] = sign;
                let ray = Ray::new(Point3f::zero(), d, 0.0, INFINITY);
                let its = tree.ray_intersect(&ray).expect("expected a hit");
                assert!(approx_eq!(f32, its.t, 1.0, epsilon = 1e-5));
            }
        }

        // Origin exactly in a face plane, shooting along the plane.
        let ray = Ray::new(
            Point3f::new(1.0, -2.0, 0.1),
            Vector3f::new(0.0, 1.0, 0.0),
            0.0,
            INFINITY,
        );
        let reference = brute_force(&tree, &ray);
        let result = tree.ray_intersect(&ray);
        assert_eq!(reference.is_some(), result.is_some());
        if let (Some((t_ref, _)), Some(its)) = (reference, result) {
            assert!(approx_eq!(f32, t_ref, its.t, epsilon = 1e-4));
        }
    }

    #[test]
    fn multiple_meshes_resolve_correctly() {
        init_logger();
        let mut tree = TriangleKdTree::new();
        tree.add_mesh(unit_triangle_mesh()).unwrap();
        tree.add_mesh(box_mesh(Point3f::new(4.0, 0.0, 0.0), 1.0))
            .unwrap();
        tree.build().unwrap();
        assert_eq!(tree.mesh_count(), 2);
        assert_eq!(tree.primitive_count(), 13);

        let ray = Ray::new(
            Point3f::new(4.0, 0.0, 5.0),
            Vector3f::new(0.0, 0.0, -1.0),
            0.0,
            INFINITY,
        );
        let its = tree.ray_intersect(&ray).expect("expected a hit");
        assert_eq!(its.mesh_index, 1);
        assert!(approx_eq!(f32, its.t, 4.0, epsilon = 1e-4));

        let ray = Ray::new(
            Point3f::new(0.25, 0.25, 1.0),
            Vector3f::new(0.0, 0.0, -1.0),
            0.0,
            INFINITY,
        );
        let its = tree.ray_intersect(&ray).expect("expected a hit");
        assert_eq!(its.mesh_index, 0);
    }
}
