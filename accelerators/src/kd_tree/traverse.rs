//! Robust kd-tree ray traversal (Havran's TA^B_rec).

use aster_core::common::{abs, max, min, RAY_EPSILON};
use aster_core::geometry::{Bounds3f, Float, Point3f, Ray};
use aster_core::primitive::Geometry;

use super::common::{BuildStats, KD_MAX_DEPTH};
use super::node::{KdNode, NodeArray, ROOT_NODE};

/// A fully built kd-tree: the packed node array, the flat primitive index
/// array, the indirection table for oversized child offsets, and the scene
/// bounds. Queries are read-only and need no synchronization.
pub struct KdTree {
    nodes: NodeArray,
    indices: Vec<u32>,
    indirections: Vec<u32>,
    bbox: Bounds3f,
    tight_bbox: Bounds3f,
    stats: BuildStats,
}

/// Traversal stack entry: a node paired with the point where the ray enters
/// or leaves its cell, plus a link to the previous entry point.
#[derive(Copy, Clone, Default)]
struct StackEntry {
    /// Node to process next (0 marks the end of the traversal).
    node: u32,

    /// Index of the previous entry point on the stack.
    prev: usize,

    /// Parametric distance of the entry/exit point.
    t: Float,

    /// The entry/exit point itself.
    p: Point3f,
}

impl KdTree {
    pub(super) fn new(
        nodes: NodeArray,
        indices: Vec<u32>,
        indirections: Vec<u32>,
        bbox: Bounds3f,
        tight_bbox: Bounds3f,
        stats: BuildStats,
    ) -> Self {
        Self {
            nodes,
            indices,
            indirections,
            bbox,
            tight_bbox,
            stats,
        }
    }

    /// Return the (slightly enlarged) bounds containing all primitives.
    pub fn bounding_box(&self) -> &Bounds3f {
        &self.bbox
    }

    /// Return the tight bounds containing all primitives.
    pub fn tight_bounding_box(&self) -> &Bounds3f {
        &self.tight_bbox
    }

    /// Return the statistics recorded while building the tree.
    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    /// Resolve an inner node's left child slot.
    #[inline]
    fn left_child(&self, index: u32, node: &KdNode) -> u32 {
        if !node.is_indirection() {
            index + node.left_offset()
        } else {
            self.indirections[node.indirection_index() as usize]
        }
    }

    /// Clip the ray against the scene bounds and derive the traversal
    /// interval. Scales the near clip with the origin magnitude to counter
    /// precision loss far from the origin when the caller kept the default
    /// epsilon.
    fn clip_interval(&self, ray: &Ray) -> Option<(Float, Float)> {
        let (near, far) = self.bbox.ray_intersect(ray)?;
        let mut mint = max(ray.mint, near);
        let maxt = min(ray.maxt, far);
        if mint == RAY_EPSILON {
            let o_mag = max(abs(ray.o.x), max(abs(ray.o.y), abs(ray.o.z)));
            mint = max(mint, mint * o_mag);
        }
        if maxt < mint {
            return None;
        }
        Some((mint, maxt))
    }

    /// Intersect a ray against all primitives in the tree and return the
    /// closest hit as `(primitive index, t, u, v)`.
    ///
    /// * `geometry` - Geometry adapter the tree was built over.
    /// * `ray`      - The ray segment.
    pub fn ray_intersect<G: Geometry>(
        &self,
        geometry: &G,
        ray: &Ray,
    ) -> Option<(u32, Float, Float, Float)> {
        let (mint, mut maxt) = self.clip_interval(ray)?;

        let mut stack = [StackEntry::default(); KD_MAX_DEPTH];
        let mut en = 0_usize;
        stack[en].t = mint;
        stack[en].p = ray.at(mint);
        let mut ex = 1_usize;
        stack[ex].t = maxt;
        stack[ex].p = ray.at(maxt);
        stack[ex].node = 0;

        let mut hit: Option<(u32, Float, Float, Float)> = None;
        let mut leaf_ray = ray.with_segment(mint, maxt);
        let mut curr = ROOT_NODE;

        while curr != 0 {
            let mut node = self.nodes[curr];

            // Descend until a leaf is reached.
            while !node.is_leaf() {
                let split = node.split();
                let axis = node.axis();
                let far_child;

                if stack[en].p[axis] <= split {
                    if stack[ex].p[axis] <= split {
                        // Cases N1, N2, N3, P5, Z2 and Z3: the ray interval
                        // lies entirely below the plane.
                        curr = self.left_child(curr, &node);
                        node = self.nodes[curr];
                        continue;
                    }
                    if stack[en].p[axis] == split {
                        // Case Z1: the entry point lies in the plane; the
                        // exit point decides, so go right. (This corrects an
                        // errata in the original case table.)
                        curr = self.left_child(curr, &node) + 1;
                        node = self.nodes[curr];
                        continue;
                    }
                    // Case N4: near side is the left child.
                    curr = self.left_child(curr, &node);
                    far_child = curr + 1;
                } else {
                    if split < stack[ex].p[axis] {
                        // Cases P1, P2, P3 and N5: entirely above the plane.
                        curr = self.left_child(curr, &node) + 1;
                        node = self.nodes[curr];
                        continue;
                    }
                    // Case P4: near side is the right child.
                    far_child = self.left_child(curr, &node);
                    curr = far_child + 1;
                }

                // Cases P4 and N4: the interval straddles the plane. Push a
                // new exit point for the far child.
                let t_split = (split - ray.o[axis]) * ray.d_rcp[axis];

                let prev = ex;
                ex += 1;
                if ex == en {
                    // Do not overwrite the entry point.
                    ex += 1;
                }
                debug_assert!(ex < KD_MAX_DEPTH);
                stack[ex].prev = prev;
                stack[ex].node = far_child;
                stack[ex].t = t_split;
                stack[ex].p = ray.at(t_split);
                stack[ex].p[axis] = split;

                node = self.nodes[curr];
            }

            // Process the leaf's primitives against the current interval.
            leaf_ray.mint = mint;
            leaf_ray.maxt = maxt;
            for entry in node.prim_start()..node.prim_end() {
                let prim_index = self.indices[entry as usize];
                if let Some((t, u, v)) = geometry.intersect(prim_index, &leaf_ray) {
                    maxt = t;
                    leaf_ray.maxt = t;
                    hit = Some((prim_index, t, u, v));
                }
            }

            if stack[ex].t > maxt {
                break;
            }

            // Pop the next cell along the ray.
            en = ex;
            curr = stack[ex].node;
            ex = stack[en].prev;
        }

        hit
    }

    /// Shadow-ray fast path: report whether the ray hits anything without
    /// computing hit details.
    ///
    /// * `geometry` - Geometry adapter the tree was built over.
    /// * `ray`      - The ray segment.
    pub fn ray_intersect_p<G: Geometry>(&self, geometry: &G, ray: &Ray) -> bool {
        let Some((mint, maxt)) = self.clip_interval(ray) else {
            return false;
        };

        let mut stack = [StackEntry::default(); KD_MAX_DEPTH];
        let mut en = 0_usize;
        stack[en].t = mint;
        stack[en].p = ray.at(mint);
        let mut ex = 1_usize;
        stack[ex].t = maxt;
        stack[ex].p = ray.at(maxt);
        stack[ex].node = 0;

        let leaf_ray = ray.with_segment(mint, maxt);
        let mut curr = ROOT_NODE;

        while curr != 0 {
            let mut node = self.nodes[curr];

            while !node.is_leaf() {
                let split = node.split();
                let axis = node.axis();
                let far_child;

                if stack[en].p[axis] <= split {
                    if stack[ex].p[axis] <= split {
                        curr = self.left_child(curr, &node);
                        node = self.nodes[curr];
                        continue;
                    }
                    if stack[en].p[axis] == split {
                        curr = self.left_child(curr, &node) + 1;
                        node = self.nodes[curr];
                        continue;
                    }
                    curr = self.left_child(curr, &node);
                    far_child = curr + 1;
                } else {
                    if split < stack[ex].p[axis] {
                        curr = self.left_child(curr, &node) + 1;
                        node = self.nodes[curr];
                        continue;
                    }
                    far_child = self.left_child(curr, &node);
                    curr = far_child + 1;
                }

                let t_split = (split - ray.o[axis]) * ray.d_rcp[axis];

                let prev = ex;
                ex += 1;
                if ex == en {
                    ex += 1;
                }
                debug_assert!(ex < KD_MAX_DEPTH);
                stack[ex].prev = prev;
                stack[ex].node = far_child;
                stack[ex].t = t_split;
                stack[ex].p = ray.at(t_split);
                stack[ex].p[axis] = split;

                node = self.nodes[curr];
            }

            for entry in node.prim_start()..node.prim_end() {
                let prim_index = self.indices[entry as usize];
                if geometry.intersect_p(prim_index, &leaf_ray) {
                    return true;
                }
            }

            if stack[ex].t > maxt {
                break;
            }

            en = ex;
            curr = stack[ex].node;
            ex = stack[en].prev;
        }

        false
    }
}
