//! KD Tree common types.

use aster_core::geometry::Float;

/// Compile-time kd-tree depth limit, which allows traversal to keep its
/// state on the stack.
pub const KD_MAX_DEPTH: usize = 48;

/// The scene bounding box is enlarged by this relative amount after
/// construction to sidestep numerical issues with planar scenes.
pub const KD_BBOX_EPSILON: Float = 1e-3;

/// Number of edge events a single primitive can contribute per child (two
/// per axis).
pub const EVENTS_PER_PRIM: usize = 6;

/// Split candidate computed by the cost optimizers.
///
/// A cost of `+∞` means "no viable split".
#[derive(Copy, Clone, Debug)]
pub struct SplitCandidate {
    /// Heuristic cost of the split.
    pub cost: Float,

    /// Split plane position.
    pub pos: Float,

    /// Split plane axis.
    pub axis: usize,

    /// Number of primitives on the left side.
    pub num_left: u32,

    /// Number of primitives on the right side.
    pub num_right: u32,

    /// Side that primitives lying exactly in the split plane are sent to.
    pub planar_left: bool,
}

impl Default for SplitCandidate {
    fn default() -> Self {
        Self {
            cost: Float::INFINITY,
            pos: 0.0,
            axis: 0,
            num_left: 0,
            num_right: 0,
            planar_left: false,
        }
    }
}

/// Structural and qualitative statistics recorded while building a kd-tree.
#[derive(Copy, Clone, Debug, Default)]
pub struct BuildStats {
    /// Total number of packed nodes.
    pub node_count: u32,

    /// Total number of primitive index entries.
    pub index_count: u32,

    /// Number of inner nodes.
    pub inner_node_count: u32,

    /// Number of leaf nodes.
    pub leaf_node_count: u32,

    /// Number of non-empty leaf nodes.
    pub nonempty_leaf_node_count: u32,

    /// Number of retracted (torn down) splits.
    pub retracted_splits: u32,

    /// Number of primitives pruned by perfect-split clipping.
    pub pruned_primitives: u32,

    /// Largest primitive count over all leaves.
    pub max_prims_in_leaf: u32,

    /// Expected number of inner-node traversals per query.
    pub exp_traversal_steps: Float,

    /// Expected number of leaf visits per query.
    pub exp_leaves_visited: Float,

    /// Expected number of primitive intersections per query.
    pub exp_primitives_intersected: Float,

    /// Final cost of the tree under the construction heuristic.
    pub heuristic_cost: Float,
}
