//! Min-max binning.

use aster_core::common::{max, min, next_float_up};
use aster_core::geometry::{Bounds3f, Float, Vector3f};
use aster_core::memory::{ArenaSlice, OrderedArena};
use aster_core::primitive::Geometry;

use super::common::SplitCandidate;
use super::sah::CostHeuristic;

/// Min-max binning as described in "Highly Parallel Fast KD-tree
/// Construction for Interactive Ray Tracing of Dynamic Scenes" by Shevtsov,
/// Soupikov and Kapustin.
///
/// Per axis, one histogram counts primitive minima and another primitive
/// maxima; a sweep over the bin boundaries then evaluates the cost
/// heuristic. This is much more cache-friendly than the exact edge-event
/// optimizer and is used near the top of the tree where primitive counts
/// are large.
pub struct MinMaxBins {
    min_bins: Vec<u32>,
    max_bins: Vec<u32>,
    prim_count: u32,
    bin_count: usize,
    bbox: Bounds3f,
    bin_size: Vector3f,
    inv_bin_size: Vector3f,
}

impl MinMaxBins {
    /// Creates a binner with `bin_count` bins per axis.
    ///
    /// * `bin_count` - Number of bins.
    pub fn new(bin_count: u32) -> Self {
        let bin_count = bin_count as usize;
        Self {
            min_bins: vec![0; 3 * bin_count],
            max_bins: vec![0; 3 * bin_count],
            prim_count: 0,
            bin_count,
            bbox: Bounds3f::empty(),
            bin_size: Vector3f::zero(),
            inv_bin_size: Vector3f::zero(),
        }
    }

    /// Prepare to bin for the specified bounds.
    ///
    /// * `bbox` - Tight bounds of the geometry to be binned.
    pub fn set_bounding_box(&mut self, bbox: &Bounds3f) {
        self.bbox = *bbox;
        self.bin_size = bbox.diagonal() / self.bin_count as Float;
        for axis in 0..3 {
            self.inv_bin_size[axis] = 1.0 / self.bin_size[axis];
        }
    }

    /// Run min-max binning over a primitive index list.
    ///
    /// * `geometry` - Geometry adapter.
    /// * `indices`  - Primitive indices to bin.
    pub fn bin<G: Geometry>(&mut self, geometry: &G, indices: &[u32]) {
        self.prim_count = indices.len() as u32;
        self.min_bins.iter_mut().for_each(|b| *b = 0);
        self.max_bins.iter_mut().for_each(|b| *b = 0);
        let max_bin = self.bin_count as i64 - 1;

        for &index in indices.iter() {
            let bbox = geometry.bounding_box(index);
            for axis in 0..3 {
                let min_idx = ((bbox.p_min[axis] - self.bbox.p_min[axis])
                    * self.inv_bin_size[axis]) as i64;
                let max_idx = ((bbox.p_max[axis] - self.bbox.p_min[axis])
                    * self.inv_bin_size[axis]) as i64;
                self.max_bins[axis * self.bin_count + max(0, min(max_idx, max_bin)) as usize] += 1;
                self.min_bins[axis * self.bin_count + max(0, min(min_idx, max_bin)) as usize] += 1;
            }
        }
    }

    /// Evaluate the cost heuristic at each bin boundary and return the
    /// minimizer for the given cost constants. Min-max binning applies no
    /// empty-space bonus since it cannot create such splits.
    ///
    /// The returned split position is validated to classify primitives
    /// exactly as the binning above did; when the straightforward formula
    /// disagrees (reciprocals and roundoff are involved), a bounded
    /// bisection searches for a consistent boundary and a cost of `+∞` is
    /// reported if none exists.
    ///
    /// * `traversal_cost` - Cost of visiting an inner node.
    /// * `query_cost`     - Cost of testing a primitive.
    pub fn minimize_cost<H: CostHeuristic>(
        &self,
        traversal_cost: Float,
        query_cost: Float,
    ) -> SplitCandidate {
        let mut candidate = SplitCandidate::default();
        let mut bin_idx = 0_usize;
        let mut left_bin = 0_i64;
        let tch = H::new(&self.bbox);
        let extents = self.bbox.diagonal();

        for axis in 0..3 {
            let mut num_left = 0_u32;
            let mut num_right = self.prim_count;
            let mut left_width = 0.0;
            let mut right_width = extents[axis];
            let bin_size = self.bin_size[axis];

            for i in 0..self.bin_count - 1 {
                num_left += self.min_bins[bin_idx];
                num_right -= self.max_bins[bin_idx];
                left_width += bin_size;
                right_width -= bin_size;

                let (p_left, p_right) = tch.probabilities(axis, left_width, right_width);
                let cost = traversal_cost
                    + query_cost * (p_left * num_left as Float + p_right * num_right as Float);

                if cost < candidate.cost {
                    candidate.cost = cost;
                    candidate.axis = axis;
                    candidate.num_left = num_left;
                    candidate.num_right = num_right;
                    left_bin = i as i64;
                }

                bin_idx += 1;
            }
            bin_idx += 1;
        }

        let axis = candidate.axis;
        let axis_min = self.bbox.p_min[axis];

        // The returned plane must classify primitives exactly like the
        // binning pass, or the partitioning code would disagree with the
        // precomputed left/right counts. The plane should pass through the
        // last float that still lands in the left bin; when the direct
        // formula misses that boundary, bisect for it.
        let inv_bin_size = self.inv_bin_size[axis];
        let mut split = axis_min + (left_bin + 1) as Float * self.bin_size[axis];
        let mut split_next = next_float_up(split);
        let mut idx = ((split - axis_min) * inv_bin_size) as i64;
        let mut idx_next = ((split_next - axis_min) * inv_bin_size) as i64;

        if !(idx == left_bin && idx_next == left_bin + 1) {
            let mut left = self.bbox.p_min[axis];
            let mut right = self.bbox.p_max[axis];
            let mut it = 0;
            loop {
                split = left + (right - left) / 2.0;
                split_next = next_float_up(split);
                idx = ((split - axis_min) * inv_bin_size) as i64;
                idx_next = ((split_next - axis_min) * inv_bin_size) as i64;

                if idx == left_bin && idx_next == left_bin + 1 {
                    break;
                }
                it += 1;
                if (idx - idx_next).abs() > 1 || it > 50 {
                    // Insufficient floating point resolution; the caller
                    // will fall back to the exact optimizer.
                    candidate.cost = Float::INFINITY;
                    break;
                }

                if idx <= left_bin {
                    left = split;
                } else {
                    right = split;
                }
            }
        }

        if split <= self.bbox.p_min[axis] || split >= self.bbox.p_max[axis] {
            candidate.cost = Float::INFINITY;
        }

        candidate.pos = split;
        candidate
    }

    /// Given a suitable split candidate, partition the index list, compute
    /// tight bounding boxes for both subtrees, and return the per-side
    /// index lists.
    ///
    /// The parent's index list is reused in place for the side indicated by
    /// `is_left_child`; the other side is drawn from that side's arena.
    /// When a gap opens between the children's tight boxes the plane is
    /// snapped onto the cheaper of the two box faces.
    ///
    /// * `left_alloc`     - Arena feeding left-side allocations.
    /// * `right_alloc`    - Arena feeding right-side allocations.
    /// * `geometry`       - Geometry adapter.
    /// * `prim_indices`   - The parent's primitive index list.
    /// * `split`          - The split candidate; position and cost may be
    ///                      refined by snapping.
    /// * `is_left_child`  - Whether the node being split is a left child.
    /// * `traversal_cost` - Cost of visiting an inner node.
    /// * `query_cost`     - Cost of testing a primitive.
    #[allow(clippy::too_many_arguments)]
    pub fn partition<G: Geometry, H: CostHeuristic>(
        &self,
        left_alloc: &OrderedArena,
        right_alloc: &OrderedArena,
        geometry: &G,
        mut prim_indices: ArenaSlice<u32>,
        split: &mut SplitCandidate,
        is_left_child: bool,
        traversal_cost: Float,
        query_cost: Float,
    ) -> (Bounds3f, ArenaSlice<u32>, Bounds3f, ArenaSlice<u32>) {
        let split_pos = split.pos;
        let axis = split.axis;
        let mut num_left = 0_usize;
        let mut num_right = 0_usize;
        let mut left_bounds = Bounds3f::empty();
        let mut right_bounds = Bounds3f::empty();

        let (left_indices, right_indices) = if is_left_child {
            let mut right_indices = right_alloc.alloc_slice::<u32>(split.num_right as usize);
            for i in 0..self.prim_count as usize {
                let prim_index = prim_indices[i];
                let bbox = geometry.bounding_box(prim_index);

                if bbox.p_max[axis] <= split_pos {
                    left_bounds = left_bounds.union(&bbox);
                    prim_indices[num_left] = prim_index;
                    num_left += 1;
                } else if bbox.p_min[axis] > split_pos {
                    right_bounds = right_bounds.union(&bbox);
                    right_indices[num_right] = prim_index;
                    num_right += 1;
                } else {
                    left_bounds = left_bounds.union(&bbox);
                    right_bounds = right_bounds.union(&bbox);
                    prim_indices[num_left] = prim_index;
                    num_left += 1;
                    right_indices[num_right] = prim_index;
                    num_right += 1;
                }
            }
            left_alloc.shrink(&mut prim_indices, split.num_left as usize);
            (prim_indices, right_indices)
        } else {
            let mut left_indices = left_alloc.alloc_slice::<u32>(split.num_left as usize);
            for i in 0..self.prim_count as usize {
                let prim_index = prim_indices[i];
                let bbox = geometry.bounding_box(prim_index);

                if bbox.p_max[axis] <= split_pos {
                    left_bounds = left_bounds.union(&bbox);
                    left_indices[num_left] = prim_index;
                    num_left += 1;
                } else if bbox.p_min[axis] > split_pos {
                    right_bounds = right_bounds.union(&bbox);
                    prim_indices[num_right] = prim_index;
                    num_right += 1;
                } else {
                    left_bounds = left_bounds.union(&bbox);
                    right_bounds = right_bounds.union(&bbox);
                    left_indices[num_left] = prim_index;
                    num_left += 1;
                    prim_indices[num_right] = prim_index;
                    num_right += 1;
                }
            }
            right_alloc.shrink(&mut prim_indices, split.num_right as usize);
            (left_indices, prim_indices)
        };

        debug_assert_eq!(num_left as u32, split.num_left);
        debug_assert_eq!(num_right as u32, split.num_right);

        left_bounds = left_bounds.intersect(&self.bbox);
        right_bounds = right_bounds.intersect(&self.bbox);

        left_bounds.p_max[axis] = min(left_bounds.p_max[axis], split_pos);
        right_bounds.p_min[axis] = max(right_bounds.p_min[axis], split_pos);

        if left_bounds.p_max[axis] != right_bounds.p_min[axis] {
            // There is some space between the child boxes; move the split
            // plane onto one of them, whichever yields the cheaper split.
            let tch = H::new(&self.bbox);

            let (p1_left, p1_right) = tch.probabilities(
                axis,
                left_bounds.p_max[axis] - self.bbox.p_min[axis],
                self.bbox.p_max[axis] - left_bounds.p_max[axis],
            );
            let (p2_left, p2_right) = tch.probabilities(
                axis,
                right_bounds.p_min[axis] - self.bbox.p_min[axis],
                self.bbox.p_max[axis] - right_bounds.p_min[axis],
            );
            let cost1 = traversal_cost
                + query_cost * (p1_left * num_left as Float + p1_right * num_right as Float);
            let cost2 = traversal_cost
                + query_cost * (p2_left * num_left as Float + p2_right * num_right as Float);

            if cost1 <= cost2 {
                split.cost = cost1;
                split.pos = left_bounds.p_max[axis];
            } else {
                split.cost = cost2;
                split.pos = right_bounds.p_min[axis];
            }

            left_bounds.p_max[axis] = min(left_bounds.p_max[axis], split.pos);
            right_bounds.p_min[axis] = max(right_bounds.p_min[axis], split.pos);
        }

        (left_bounds, left_indices, right_bounds, right_indices)
    }
}
