//! KD-tree construction.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::thread;

use aster_core::common::{log2, max, min};
use aster_core::geometry::{Bounds3f, Float, Vector3f};
use aster_core::memory::{
    ArenaSlice, BlockedVector, Classification, ClassificationStore, OrderedArena,
};
use aster_core::primitive::Geometry;

use super::bins::MinMaxBins;
use super::common::{BuildStats, SplitCandidate, EVENTS_PER_PRIM, KD_BBOX_EPSILON, KD_MAX_DEPTH};
use super::error::{KdTreeError, Result};
use super::events::{merge_events, EdgeEvent, EventKind};
use super::node::{KdNode, NodeArray, ROOT_NODE};
use super::sah::CostHeuristic;
use super::traverse::KdTree;

/// Construction parameters for the kd-tree builder. Every parameter can be
/// adjusted before the first `build` call.
#[derive(Copy, Clone, Debug)]
pub struct KdTreeConfig {
    /// Cost of traversing an inner node.
    pub traversal_cost: Float,

    /// Cost of running a query against a contained primitive.
    pub query_cost: Float,

    /// Cost multiplier rewarding splits that cut off empty space.
    pub empty_space_bonus: Float,

    /// Clip primitives to node boxes ("perfect splits") during construction.
    pub clip: bool,

    /// Primitive count at which recursion stops.
    pub stop_prims: u32,

    /// Number of subsequent cost-increasing splits tolerated before a leaf
    /// is created.
    pub max_bad_refines: u32,

    /// Primitive count below which the builder switches from min-max
    /// binning to the exact O(n log n) optimizer.
    pub exact_prim_threshold: u32,

    /// Maximum tree depth (0 = choose from the primitive count).
    pub max_depth: u32,

    /// Permit tearing down subtrees whose final cost exceeds a leaf's.
    pub retract: bool,

    /// Build subtrees on worker threads.
    pub parallel_build: bool,

    /// Number of bins used for min-max binning.
    pub min_max_bins: u32,
}

impl Default for KdTreeConfig {
    fn default() -> Self {
        Self {
            traversal_cost: 15.0,
            query_cost: 20.0,
            empty_space_bonus: 0.9,
            clip: true,
            stop_prims: 6,
            max_bad_refines: 3,
            exact_prim_threshold: 65536,
            max_depth: 0,
            retract: true,
            parallel_build: true,
            min_max_bins: 128,
        }
    }
}

impl KdTreeConfig {
    fn validate(&self) -> Result<()> {
        if self.traversal_cost <= 0.0 {
            return Err(KdTreeError::Configuration(
                "the traversal cost must be > 0".to_string(),
            ));
        }
        if self.query_cost <= 0.0 {
            return Err(KdTreeError::Configuration(
                "the query cost must be > 0".to_string(),
            ));
        }
        if self.empty_space_bonus <= 0.0 || self.empty_space_bonus > 1.0 {
            return Err(KdTreeError::Configuration(
                "the empty space bonus must be in (0, 1]".to_string(),
            ));
        }
        if self.min_max_bins <= 1 {
            return Err(KdTreeError::Configuration(
                "the number of min-max bins must be > 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Effective parameters for one build run.
#[derive(Copy, Clone, Debug)]
struct BuildParams {
    traversal_cost: Float,
    query_cost: Float,
    empty_space_bonus: Float,
    clip: bool,
    stop_prims: u32,
    max_bad_refines: u32,
    exact_prim_threshold: u32,
    max_depth: u32,
    retract: bool,
    parallel: bool,
    min_max_bins: u32,
}

/// Which of a node's two per-thread arenas an allocation belongs to.
#[derive(Copy, Clone, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Per-thread context holding the memory pools used during construction,
/// together with some statistics counters.
pub(super) struct BuildContext {
    left_alloc: OrderedArena,
    right_alloc: OrderedArena,
    nodes: BlockedVector<KdNode>,
    indices: BlockedVector<u32>,
    class_storage: ClassificationStore,
    min_max_bins: MinMaxBins,

    leaf_node_count: u32,
    nonempty_leaf_node_count: u32,
    inner_node_count: u32,
    prim_index_count: u32,
    retracted_splits: u32,
    pruned: u32,

    /// Dispatcher-only record of which worker built which subtree:
    /// dispatcher node slot -> (worker id, root slot in that worker's
    /// node vector).
    job_map: HashMap<u32, (u32, u32)>,
}

impl BuildContext {
    fn new(prim_count: u32, bin_count: u32) -> Self {
        Self {
            left_alloc: OrderedArena::new(),
            right_alloc: OrderedArena::new(),
            nodes: BlockedVector::new(),
            indices: BlockedVector::new(),
            class_storage: ClassificationStore::new(prim_count as usize),
            min_max_bins: MinMaxBins::new(bin_count),
            leaf_node_count: 0,
            nonempty_leaf_node_count: 0,
            inner_node_count: 0,
            prim_index_count: 0,
            retracted_splits: 0,
            pruned: 0,
            job_map: HashMap::new(),
        }
    }

    fn arena(&self, side: Side) -> &OrderedArena {
        match side {
            Side::Left => &self.left_alloc,
            Side::Right => &self.right_alloc,
        }
    }

    fn size(&self) -> usize {
        self.left_alloc.size()
            + self.right_alloc.size()
            + self.nodes.capacity() * std::mem::size_of::<KdNode>()
            + self.indices.capacity() * std::mem::size_of::<u32>()
            + self.class_storage.size()
    }
}

/// Job description for building a subtree on a worker thread.
struct SubtreeJob {
    depth: u32,
    node: u32,
    bbox: Bounds3f,
    events: Vec<EdgeEvent>,
    prim_count: u32,
    bad_refines: u32,
}

/// A worker's acknowledgement that it accepted a job.
struct JobAck {
    node: u32,
    worker: u32,
    root: u32,
}

#[derive(Default)]
struct InterfaceState {
    done: bool,
    job: Option<SubtreeJob>,
    ack: Option<JobAck>,
}

/// Communication between the dispatcher and the builder threads: a
/// single-slot job mailbox with one condition variable to wake workers and
/// one for the dispatcher to await the hand-off.
struct BuildInterface {
    state: Mutex<InterfaceState>,
    wake: Condvar,
    job_taken: Condvar,
}

impl BuildInterface {
    fn new() -> Self {
        Self {
            state: Mutex::new(InterfaceState::default()),
            wake: Condvar::new(),
            job_taken: Condvar::new(),
        }
    }
}

struct TreeBuilder<'a, G, H> {
    geometry: &'a G,
    params: BuildParams,
    interface: BuildInterface,
    _heuristic: std::marker::PhantomData<fn() -> H>,
}

/// Build a kd-tree over the supplied geometry.
///
/// * `config`   - Construction parameters.
/// * `geometry` - Geometry adapter.
pub(super) fn build<G, H>(config: &KdTreeConfig, geometry: &G) -> Result<KdTree>
where
    G: Geometry + Sync,
    H: CostHeuristic,
{
    config.validate()?;

    let prim_count = geometry.primitive_count();
    if prim_count > 1 << 30 {
        return Err(KdTreeError::Capacity(format!(
            "{} primitives exceed the leaf offset range",
            prim_count
        )));
    }

    if prim_count == 0 {
        warn!("kd-tree contains no geometry!");
        // The alignment slot keeps the sibling arithmetic well-defined even
        // for the empty tree.
        let mut nodes = NodeArray::new(1);
        nodes[ROOT_NODE].init_leaf(0, 0);
        return Ok(KdTree::new(
            nodes,
            Vec::new(),
            Vec::new(),
            Bounds3f::empty(),
            Bounds3f::empty(),
            BuildStats {
                node_count: 1,
                leaf_node_count: 1,
                ..BuildStats::default()
            },
        ));
    }

    let max_depth = if config.max_depth == 0 {
        (8.0 + 1.3 * log2(prim_count as Float)).ceil() as u32
    } else {
        config.max_depth
    };
    let max_depth = min(max_depth, KD_MAX_DEPTH as u32);

    let core_count = num_cpus::get() as u32;
    let worker_count = if config.parallel_build && prim_count > config.exact_prim_threshold {
        core_count.saturating_sub(1)
    } else {
        0
    };

    let params = BuildParams {
        traversal_cost: config.traversal_cost,
        query_cost: config.query_cost,
        empty_space_bonus: config.empty_space_bonus,
        clip: config.clip,
        stop_prims: config.stop_prims,
        max_bad_refines: config.max_bad_refines,
        exact_prim_threshold: config.exact_prim_threshold,
        max_depth,
        retract: config.retract,
        parallel: worker_count > 0,
        min_max_bins: config.min_max_bins,
    };

    let mut ctx = BuildContext::new(prim_count, params.min_max_bins);
    let mut indices = ctx.left_alloc.alloc_slice::<u32>(prim_count as usize);

    let mut bbox = Bounds3f::empty();
    for i in 0..prim_count {
        let b = geometry.bounding_box(i);
        if b.p_min.x > b.p_max.x || b.p_min.y > b.p_max.y || b.p_min.z > b.p_max.z {
            return Err(KdTreeError::Integrity(format!(
                "primitive {} reported an inverted bounding box",
                i
            )));
        }
        bbox = bbox.union(&b);
        indices[i as usize] = i;
    }

    debug!(
        "kd-tree configuration: traversal cost {}, query cost {}, empty space bonus {}, \
         max depth {}, min-max bins {}, exact method below {} primitives, clip {}, \
         retract {}, stop primitives {}, parallel {}",
        params.traversal_cost,
        params.query_cost,
        params.empty_space_bonus,
        params.max_depth,
        params.min_max_bins,
        params.exact_prim_threshold,
        params.clip,
        params.retract,
        params.stop_prims,
        params.parallel,
    );

    let builder = TreeBuilder::<G, H> {
        geometry,
        params,
        interface: BuildInterface::new(),
        _heuristic: std::marker::PhantomData,
    };

    let indices_ptr = indices.as_ptr();
    let prelim_root = ctx.nodes.allocate(1) as u32;

    let worker_contexts = thread::scope(|s| {
        let builder_ref = &builder;
        let handles: Vec<_> = (0..worker_count)
            .map(|id| s.spawn(move || builder_ref.worker_run(id, prim_count)))
            .collect();

        builder.build_tree_min_max(&mut ctx, 1, prelim_root, bbox, bbox, indices, true, 0);

        if params.parallel {
            let mut st = builder.interface.state.lock().unwrap();
            st.done = true;
            builder.interface.wake.notify_all();
            drop(st);
        }

        let mut contexts = Vec::with_capacity(handles.len());
        let mut panic_payload = None;
        for handle in handles {
            match handle.join() {
                Ok(c) => contexts.push(c),
                Err(p) => panic_payload = Some(p),
            }
        }
        if let Some(p) = panic_payload {
            std::panic::resume_unwind(p);
        }
        contexts
    });
    ctx.left_alloc.release(indices_ptr);

    let mut contexts = Vec::with_capacity(1 + worker_contexts.len());
    contexts.push(ctx);
    contexts.extend(worker_contexts);

    let temp_memory: usize = contexts.iter().map(|c| c.size()).sum();

    let (nodes, final_indices, indirections, stats) =
        compactify::<H>(&contexts, &bbox, &params);

    // Slightly enlarge the bounding box; necessary e.g. when the scene is
    // planar.
    let tight_bbox = bbox;
    let mut bbox = bbox;
    let adjustment = bbox.diagonal() * KD_BBOX_EPSILON
        + Vector3f::new(KD_BBOX_EPSILON, KD_BBOX_EPSILON, KD_BBOX_EPSILON);
    bbox.p_min -= adjustment;
    bbox.p_max += adjustment;

    info!(
        "Finished kd-tree construction ({} nodes, {} inner, {} leaves of which {} non-empty, \
         {} retracted splits, {} pruned primitives, {} KiB of temporary memory)",
        stats.node_count,
        stats.inner_node_count,
        stats.leaf_node_count,
        stats.nonempty_leaf_node_count,
        stats.retracted_splits,
        stats.pruned_primitives,
        temp_memory / 1024,
    );
    info!(
        "The final kd-tree requires {} KiB of memory (final cost = {})",
        (stats.node_count as usize * std::mem::size_of::<KdNode>()
            + stats.index_count as usize * std::mem::size_of::<u32>())
            / 1024,
        stats.heuristic_cost,
    );

    Ok(KdTree::new(
        nodes,
        final_indices,
        indirections,
        bbox,
        tight_bbox,
        stats,
    ))
}

impl<'a, G, H> TreeBuilder<'a, G, H>
where
    G: Geometry + Sync,
    H: CostHeuristic,
{
    /// Worker thread body: block on the mailbox for subtree jobs and build
    /// each one into this worker's own context.
    fn worker_run(&self, worker_id: u32, prim_count: u32) -> BuildContext {
        let mut ctx = BuildContext::new(prim_count, self.params.min_max_bins);
        loop {
            let (job, root) = {
                let mut st = self.interface.state.lock().unwrap();
                loop {
                    if st.job.is_some() {
                        break;
                    }
                    if st.done {
                        return ctx;
                    }
                    st = self.interface.wake.wait(st).unwrap();
                }
                let job = st.job.take().unwrap();
                let root = ctx.nodes.allocate(1) as u32;
                st.ack = Some(JobAck {
                    node: job.node,
                    worker: worker_id,
                    root,
                });
                self.interface.job_taken.notify_one();
                (job, root)
            };

            let mut events = ctx.left_alloc.alloc_slice::<EdgeEvent>(job.events.len());
            events.copy_from_slice(&job.events);
            drop(job.events);
            events.sort_unstable_by(|a, b| a.ordering(b));

            let events_ptr = events.as_ptr();
            self.build_tree(
                &mut ctx,
                job.depth,
                root,
                job.bbox,
                events,
                job.prim_count,
                true,
                job.bad_refines,
            );
            ctx.left_alloc.release(events_ptr);
        }
    }

    /// Leaf creation from a plain index list (min-max phase).
    fn create_leaf_from_indices(&self, ctx: &mut BuildContext, node: u32, indices: &[u32]) {
        let prim_count = indices.len() as u32;
        let mut n = KdNode::default();
        n.init_leaf(ctx.indices.len() as u32, prim_count);
        ctx.nodes[node as usize] = n;
        if prim_count > 0 {
            ctx.nonempty_leaf_node_count += 1;
            for &index in indices {
                ctx.indices.push(index);
            }
            ctx.prim_index_count += prim_count;
        }
        ctx.leaf_node_count += 1;
    }

    /// Leaf creation from an edge event list (O(n log n) phase). Every live
    /// primitive has a start or planar event on the first axis.
    fn create_leaf_from_events(
        &self,
        ctx: &mut BuildContext,
        node: u32,
        events: &[EdgeEvent],
        prim_count: u32,
    ) {
        let mut n = KdNode::default();
        n.init_leaf(ctx.indices.len() as u32, prim_count);
        ctx.nodes[node as usize] = n;
        if prim_count > 0 {
            ctx.nonempty_leaf_node_count += 1;
            let mut seen = 0;
            for event in events.iter().take_while(|e| e.axis() == 0) {
                if matches!(event.kind(), EventKind::Start | EventKind::Planar) {
                    ctx.indices.push(event.index);
                    seen += 1;
                }
            }
            debug_assert_eq!(seen, prim_count);
            ctx.prim_index_count += prim_count;
        }
        ctx.leaf_node_count += 1;
    }

    /// Collapse a just-torn-down subtree into a leaf holding the
    /// deduplicated union of its primitives.
    ///
    /// * `start` - Index list position recorded before the subtree was built.
    fn create_leaf_after_retraction(&self, ctx: &mut BuildContext, node: u32, start: usize) {
        let index_count = ctx.indices.len() - start;

        // The subtree's indices are not contiguous in memory, so sort a
        // temporary copy.
        let mut temp = ctx.left_alloc.alloc_slice::<u32>(index_count);
        for i in 0..index_count {
            temp[i] = ctx.indices[start + i];
        }
        temp.sort_unstable();

        let mut write = start;
        let mut read = 0;
        while read < index_count {
            let value = temp[read];
            ctx.indices[write] = value;
            write += 1;
            while read < index_count && temp[read] == value {
                read += 1;
            }
        }

        let n_seen = write - start;
        ctx.prim_index_count = ctx.prim_index_count - index_count as u32 + n_seen as u32;
        ctx.indices.resize(write);
        ctx.left_alloc.release(temp.as_ptr());

        let mut n = KdNode::default();
        n.init_leaf(start as u32, n_seen as u32);
        ctx.nodes[node as usize] = n;
        ctx.nonempty_leaf_node_count += 1;
        ctx.leaf_node_count += 1;
    }

    /// Create an edge event list for a list of primitives when passing from
    /// min-max binning to the exact optimizer. With clipping enabled,
    /// primitives whose clipped box is empty produce no events and drop out
    /// of the subtree; the returned count reflects that.
    fn create_event_list(
        &self,
        ctx: &BuildContext,
        side: Side,
        node_bbox: &Bounds3f,
        indices: &[u32],
    ) -> (ArenaSlice<EdgeEvent>, u32) {
        let initial_size = indices.len() * EVENTS_PER_PRIM;
        let mut events = ctx.arena(side).alloc_slice::<EdgeEvent>(initial_size);
        let mut n = 0_usize;
        let mut actual_prim_count = 0_u32;

        for &index in indices {
            let bbox = if self.params.clip {
                let b = self.geometry.clipped_bounding_box(index, node_bbox);
                if !b.is_valid() || b.surface_area() == 0.0 {
                    continue;
                }
                b
            } else {
                self.geometry.bounding_box(index)
            };

            for axis in 0..3 {
                let (mn, mx) = (bbox.p_min[axis], bbox.p_max[axis]);
                if mn == mx {
                    events[n] = EdgeEvent::new(EventKind::Planar, axis, mn, index);
                    n += 1;
                } else {
                    events[n] = EdgeEvent::new(EventKind::Start, axis, mn, index);
                    events[n + 1] = EdgeEvent::new(EventKind::End, axis, mx, index);
                    n += 2;
                }
            }
            actual_prim_count += 1;
        }

        if n != initial_size {
            ctx.arena(side).shrink(&mut events, n);
        }
        (events, actual_prim_count)
    }

    /// Transition from min-max binning to the O(n log n) optimization,
    /// either inline or by handing the subtree to a worker thread.
    #[allow(clippy::too_many_arguments)]
    fn transition_to_nlogn(
        &self,
        ctx: &mut BuildContext,
        depth: u32,
        node: u32,
        node_bbox: &Bounds3f,
        indices: &[u32],
        is_left_child: bool,
        bad_refines: u32,
    ) -> Float {
        let side = if is_left_child { Side::Left } else { Side::Right };
        let (events, prim_count) = self.create_event_list(ctx, side, node_bbox, indices);
        let events_ptr = events.as_ptr();

        if self.params.parallel {
            let event_copy = events.to_vec();
            ctx.arena(side).release(events_ptr);

            let mut st = self.interface.state.lock().unwrap();
            st.job = Some(SubtreeJob {
                depth,
                node,
                bbox: *node_bbox,
                events: event_copy,
                prim_count,
                bad_refines,
            });
            self.interface.wake.notify_one();

            // Wait for a worker thread to take this job.
            while st.ack.is_none() {
                st = self.interface.job_taken.wait(st).unwrap();
            }
            let ack = st.ack.take().unwrap();
            drop(st);

            debug_assert_eq!(ack.node, node);
            ctx.job_map.insert(ack.node, (ack.worker, ack.root));

            // Never tear down this subtree.
            return -Float::INFINITY;
        }

        let mut events = events;
        events.sort_unstable_by(|a, b| a.ordering(b));
        let cost = self.build_tree(
            ctx,
            depth,
            node,
            *node_bbox,
            events,
            prim_count,
            is_left_child,
            bad_refines,
        );
        ctx.arena(side).release(events_ptr);
        cost
    }

    /// Build helper for the min-max binning phase, used while the primitive
    /// count is above the exact-optimizer threshold.
    ///
    /// * `node_bbox`  - Cell of the current node.
    /// * `tight_bbox` - Tight box of the contained geometry (for binning).
    /// * `indices`    - The node's primitive index list; the caller releases
    ///                  its arena region after this returns.
    #[allow(clippy::too_many_arguments)]
    fn build_tree_min_max(
        &self,
        ctx: &mut BuildContext,
        depth: u32,
        node: u32,
        node_bbox: Bounds3f,
        tight_bbox: Bounds3f,
        indices: ArenaSlice<u32>,
        is_left_child: bool,
        bad_refines: u32,
    ) -> Float {
        let prim_count = indices.len() as u32;
        let leaf_cost = prim_count as Float * self.params.query_cost;
        if prim_count <= self.params.stop_prims || depth >= self.params.max_depth {
            self.create_leaf_from_indices(ctx, node, &indices);
            return leaf_cost;
        }

        if prim_count <= self.params.exact_prim_threshold {
            return self.transition_to_nlogn(
                ctx,
                depth,
                node,
                &node_bbox,
                &indices,
                is_left_child,
                bad_refines,
            );
        }

        // ------------------------------------------------------------------
        // Binning and split candidate search
        // ------------------------------------------------------------------

        ctx.min_max_bins.set_bounding_box(&tight_bbox);
        ctx.min_max_bins.bin(self.geometry, &indices);
        let mut best = ctx
            .min_max_bins
            .minimize_cost::<H>(self.params.traversal_cost, self.params.query_cost);

        if best.cost.is_infinite() {
            // Either floating point precision ran out (e.g. the tight box
            // collapsed along an axis) or the two binning stages became
            // inconsistent. Fall through to the exact optimizer.
            warn!("Min-max binning failed; retrying with the O(n log n) greedy algorithm");
            return self.transition_to_nlogn(
                ctx,
                depth,
                node,
                &node_bbox,
                &indices,
                is_left_child,
                bad_refines,
            );
        }

        // "Bad refines" heuristic from PBRT.
        let mut bad_refines = bad_refines;
        if best.cost >= leaf_cost {
            if (best.cost > 4.0 * leaf_cost && prim_count < 16)
                || bad_refines >= self.params.max_bad_refines
            {
                self.create_leaf_from_indices(ctx, node, &indices);
                return leaf_cost;
            }
            bad_refines += 1;
        }

        // ------------------------------------------------------------------
        // Partitioning
        // ------------------------------------------------------------------

        let (left_bounds, left_indices, right_bounds, right_indices) =
            ctx.min_max_bins.partition::<G, H>(
                &ctx.left_alloc,
                &ctx.right_alloc,
                self.geometry,
                indices,
                &mut best,
                is_left_child,
                self.params.traversal_cost,
                self.params.query_cost,
            );

        // ------------------------------------------------------------------
        // Recursion
        // ------------------------------------------------------------------

        let children = ctx.nodes.allocate(2) as u32;

        let node_pos = ctx.nodes.len();
        let index_pos = ctx.indices.len();
        let leaf_count_snapshot = ctx.leaf_node_count;
        let nonempty_snapshot = ctx.nonempty_leaf_node_count;
        let inner_snapshot = ctx.inner_node_count;

        let mut inner = KdNode::default();
        if !inner.init_inner(best.axis, best.pos, children - node) {
            panic!("kd-tree build context exceeded the packed child offset range");
        }
        ctx.nodes[node as usize] = inner;
        ctx.inner_node_count += 1;

        let left_ptr = left_indices.as_ptr();
        let right_ptr = right_indices.as_ptr();

        let mut child_bbox = node_bbox;
        child_bbox.p_max[best.axis] = best.pos;
        let left_cost = self.build_tree_min_max(
            ctx,
            depth + 1,
            children,
            child_bbox,
            left_bounds,
            left_indices,
            true,
            bad_refines,
        );

        child_bbox.p_min[best.axis] = best.pos;
        child_bbox.p_max[best.axis] = node_bbox.p_max[best.axis];
        let right_cost = self.build_tree_min_max(
            ctx,
            depth + 1,
            children + 1,
            child_bbox,
            right_bounds,
            right_indices,
            false,
            bad_refines,
        );

        let tch = H::new(&node_bbox);
        let (p_left, p_right) = tch.probabilities(
            best.axis,
            best.pos - node_bbox.p_min[best.axis],
            node_bbox.p_max[best.axis] - best.pos,
        );
        let final_cost =
            self.params.traversal_cost + p_left * left_cost + p_right * right_cost;

        // Release the index list the children no longer need; the inherited
        // one belongs to the caller.
        if is_left_child {
            ctx.right_alloc.release(right_ptr);
        } else {
            ctx.left_alloc.release(left_ptr);
        }

        // ------------------------------------------------------------------
        // Final decision
        // ------------------------------------------------------------------

        if !self.params.retract || final_cost < prim_count as Float * self.params.query_cost {
            final_cost
        } else {
            // Splitting did not reduce the cost after all. Tear down the
            // subtree and create a leaf.
            ctx.nodes.resize(node_pos);
            ctx.retracted_splits += 1;
            ctx.leaf_node_count = leaf_count_snapshot;
            ctx.nonempty_leaf_node_count = nonempty_snapshot;
            ctx.inner_node_count = inner_snapshot;
            self.create_leaf_after_retraction(ctx, node, index_pos);
            leaf_cost
        }
    }

    /// Build helper for the greedy O(n log n) optimization phase.
    ///
    /// * `events` - Sorted edge event list for the node. The caller releases
    ///              its arena region after this returns.
    #[allow(clippy::too_many_arguments)]
    fn build_tree(
        &self,
        ctx: &mut BuildContext,
        depth: u32,
        node: u32,
        node_bbox: Bounds3f,
        events: ArenaSlice<EdgeEvent>,
        prim_count: u32,
        is_left_child: bool,
        bad_refines: u32,
    ) -> Float {
        let leaf_cost = prim_count as Float * self.params.query_cost;
        if prim_count <= self.params.stop_prims || depth >= self.params.max_depth {
            self.create_leaf_from_events(ctx, node, &events, prim_count);
            return leaf_cost;
        }

        // ------------------------------------------------------------------
        // Split candidate search
        // ------------------------------------------------------------------

        // The optimal split plane is found in O(n) as a sweep over the
        // sorted edge events. Initially the plane lies left of the scene, so
        // all geometry is on its right side.
        let mut num_left = [0_u32; 3];
        let mut num_right = [prim_count; 3];
        let mut events_by_axis = [0_usize; 3];
        let mut events_by_axis_ctr = 1;
        let tch = H::new(&node_bbox);
        let mut best = SplitCandidate::default();

        let n_events = events.len();
        let mut i = 0;
        while i < n_events {
            let axis = events[i].axis();
            let pos = events[i].pos;
            let (mut num_end, mut num_planar, mut num_start) = (0_u32, 0_u32, 0_u32);

            // Count the events sharing this position. The sort ordering
            // groups them as end, planar, start.
            while i < n_events
                && events[i].axis() == axis
                && events[i].pos == pos
                && events[i].kind() == EventKind::End
            {
                num_end += 1;
                i += 1;
            }
            while i < n_events
                && events[i].axis() == axis
                && events[i].pos == pos
                && events[i].kind() == EventKind::Planar
            {
                num_planar += 1;
                i += 1;
            }
            while i < n_events
                && events[i].axis() == axis
                && events[i].pos == pos
                && events[i].kind() == EventKind::Start
            {
                num_start += 1;
                i += 1;
            }

            // Keep track of where each axis' events begin.
            if i < n_events && events[i].axis() != axis {
                events_by_axis[events_by_axis_ctr] = i;
                events_by_axis_ctr += 1;
            }

            // The split plane can now be moved onto the position; planar and
            // ending primitives drop off the right side.
            num_right[axis] -= num_planar + num_end;

            if pos > node_bbox.p_min[axis] && pos < node_bbox.p_max[axis] {
                let n_l = num_left[axis];
                let n_r = num_right[axis];
                let (p_left, p_right) = tch.probabilities(
                    axis,
                    pos - node_bbox.p_min[axis],
                    node_bbox.p_max[axis] - pos,
                );

                if num_planar == 0 {
                    let mut cost = self.params.traversal_cost
                        + self.params.query_cost
                            * (p_left * n_l as Float + p_right * n_r as Float);
                    if n_l == 0 || n_r == 0 {
                        cost *= self.params.empty_space_bonus;
                    }
                    if cost < best.cost {
                        best.cost = cost;
                        best.pos = pos;
                        best.axis = axis;
                        best.num_left = n_l;
                        best.num_right = n_r;
                    }
                } else {
                    // Planar primitives can be sent to either side; evaluate
                    // both and keep the cheaper assignment.
                    let mut cost_planar_left = self.params.traversal_cost
                        + self.params.query_cost
                            * (p_left * (n_l + num_planar) as Float + p_right * n_r as Float);
                    let mut cost_planar_right = self.params.traversal_cost
                        + self.params.query_cost
                            * (p_left * n_l as Float + p_right * (n_r + num_planar) as Float);

                    if n_l + num_planar == 0 || n_r == 0 {
                        cost_planar_left *= self.params.empty_space_bonus;
                    }
                    if n_l == 0 || n_r + num_planar == 0 {
                        cost_planar_right *= self.params.empty_space_bonus;
                    }

                    if cost_planar_left < best.cost || cost_planar_right < best.cost {
                        best.pos = pos;
                        best.axis = axis;
                        if cost_planar_left < cost_planar_right {
                            best.cost = cost_planar_left;
                            best.num_left = n_l + num_planar;
                            best.num_right = n_r;
                            best.planar_left = true;
                        } else {
                            best.cost = cost_planar_right;
                            best.num_left = n_l;
                            best.num_right = n_r + num_planar;
                            best.planar_left = false;
                        }
                    }
                }
            }

            // The plane moves past the position; planar and starting
            // primitives join the left side.
            num_left[axis] += num_start + num_planar;
        }

        debug_assert!(
            (0..3).all(|a| num_left[a] == prim_count && num_right[a] == 0),
            "edge event sweep out of balance"
        );

        // "Bad refines" heuristic from PBRT.
        let mut bad_refines = bad_refines;
        if best.cost >= leaf_cost {
            if (best.cost > 4.0 * leaf_cost && prim_count < 16)
                || bad_refines >= self.params.max_bad_refines
                || best.cost.is_infinite()
            {
                self.create_leaf_from_events(ctx, node, &events, prim_count);
                return leaf_cost;
            }
            bad_refines += 1;
        }

        // ------------------------------------------------------------------
        // Primitive classification
        // ------------------------------------------------------------------

        let axis_events_start = events_by_axis[best.axis];

        // Initially mark every primitive as straddling.
        let mut j = axis_events_start;
        while j < n_events && events[j].axis() == best.axis {
            ctx.class_storage.set(events[j].index, Classification::BothSides);
            j += 1;
        }

        let mut prims_left = 0_u32;
        let mut prims_right = 0_u32;
        let mut prims_both = prim_count;

        let mut j = axis_events_start;
        while j < n_events && events[j].axis() == best.axis {
            let event = events[j];
            match event.kind() {
                EventKind::End if event.pos <= best.pos => {
                    // The interval ends at or before the split plane.
                    ctx.class_storage.set(event.index, Classification::LeftSide);
                    prims_both -= 1;
                    prims_left += 1;
                }
                EventKind::Start if event.pos >= best.pos => {
                    // The interval starts at or after the split plane.
                    ctx.class_storage.set(event.index, Classification::RightSide);
                    prims_both -= 1;
                    prims_right += 1;
                }
                EventKind::Planar => {
                    // Off-plane planar primitives classify trivially; those
                    // exactly in the plane go to the side chosen by the cost
                    // comparison.
                    if event.pos < best.pos || (event.pos == best.pos && best.planar_left) {
                        ctx.class_storage.set(event.index, Classification::LeftSide);
                        prims_both -= 1;
                        prims_left += 1;
                    } else {
                        ctx.class_storage.set(event.index, Classification::RightSide);
                        prims_both -= 1;
                        prims_right += 1;
                    }
                }
                _ => {}
            }
            j += 1;
        }

        let mut left_node_bbox = node_bbox;
        left_node_bbox.p_max[best.axis] = best.pos;
        let mut right_node_bbox = node_bbox;
        right_node_bbox.p_min[best.axis] = best.pos;

        let mut pruned_left = 0_u32;
        let mut pruned_right = 0_u32;

        // ------------------------------------------------------------------
        // Partitioning
        // ------------------------------------------------------------------

        let parent_len = events.len();
        let left_cap = best.num_left as usize * EVENTS_PER_PRIM;
        let right_cap = best.num_right as usize * EVENTS_PER_PRIM;

        // The parent's event list serves in place as the initial buffer of
        // the child on the same arena side; the other child gets a fresh
        // buffer from its own arena. Temporaries go to the opposite arena so
        // the in-place buffer stays the topmost allocation of its own.
        let parent_side = if is_left_child { Side::Left } else { Side::Right };
        let temp_side = parent_side.other();

        let left_events: ArenaSlice<EdgeEvent>;
        let right_events: ArenaSlice<EdgeEvent>;
        let left_inherited: bool;
        let right_inherited: bool;

        if self.params.clip {
            // Fresh full-capacity output for the opposite side, allocated
            // before the temporaries so it survives their release.
            let mut fresh_out = ctx
                .arena(temp_side)
                .alloc_slice::<EdgeEvent>(if is_left_child { right_cap } else { left_cap });

            let mut left_temp = ctx
                .arena(temp_side)
                .alloc_slice::<EdgeEvent>(prims_left as usize * EVENTS_PER_PRIM);
            let mut right_temp = ctx
                .arena(temp_side)
                .alloc_slice::<EdgeEvent>(prims_right as usize * EVENTS_PER_PRIM);
            let mut new_left = ctx
                .arena(temp_side)
                .alloc_slice::<EdgeEvent>(prims_both as usize * EVENTS_PER_PRIM);
            let mut new_right = ctx
                .arena(temp_side)
                .alloc_slice::<EdgeEvent>(prims_both as usize * EVENTS_PER_PRIM);

            let (mut lt, mut rt, mut nl, mut nr) = (0_usize, 0_usize, 0_usize, 0_usize);

            for event in events.iter() {
                match ctx.class_storage.get(event.index) {
                    Classification::LeftSide => {
                        left_temp[lt] = *event;
                        lt += 1;
                    }
                    Classification::RightSide => {
                        right_temp[rt] = *event;
                        rt += 1;
                    }
                    Classification::BothSides => {
                        // The primitive straddles the plane; re-clip against
                        // both child cells and emit fresh events.
                        let index = event.index;

                        let clipped_left = self
                            .geometry
                            .clipped_bounding_box(index, &left_node_bbox);
                        let clipped_right = self
                            .geometry
                            .clipped_bounding_box(index, &right_node_bbox);

                        if clipped_left.is_valid() && clipped_left.surface_area() > 0.0 {
                            for axis in 0..3 {
                                let (mn, mx) =
                                    (clipped_left.p_min[axis], clipped_left.p_max[axis]);
                                if mn == mx {
                                    new_left[nl] =
                                        EdgeEvent::new(EventKind::Planar, axis, mn, index);
                                    nl += 1;
                                } else {
                                    new_left[nl] =
                                        EdgeEvent::new(EventKind::Start, axis, mn, index);
                                    new_left[nl + 1] =
                                        EdgeEvent::new(EventKind::End, axis, mx, index);
                                    nl += 2;
                                }
                            }
                        } else {
                            pruned_left += 1;
                        }

                        if clipped_right.is_valid() && clipped_right.surface_area() > 0.0 {
                            for axis in 0..3 {
                                let (mn, mx) =
                                    (clipped_right.p_min[axis], clipped_right.p_max[axis]);
                                if mn == mx {
                                    new_right[nr] =
                                        EdgeEvent::new(EventKind::Planar, axis, mn, index);
                                    nr += 1;
                                } else {
                                    new_right[nr] =
                                        EdgeEvent::new(EventKind::Start, axis, mn, index);
                                    new_right[nr + 1] =
                                        EdgeEvent::new(EventKind::End, axis, mx, index);
                                    nr += 2;
                                }
                            }
                        } else {
                            pruned_right += 1;
                        }

                        // Clip each straddling primitive only once.
                        ctx.class_storage
                            .set(index, Classification::BothSidesProcessed);
                    }
                    Classification::BothSidesProcessed => {}
                }
            }

            ctx.pruned += pruned_left + pruned_right;

            new_left[..nl].sort_unstable_by(|a, b| a.ordering(b));
            new_right[..nr].sort_unstable_by(|a, b| a.ordering(b));

            // Reuse the parent's buffer for the same-side child, regrown to
            // worst-case capacity. The fallback allocation only triggers
            // when the parent's slab has no room left.
            let mut inherited_out = events;
            let inherited_cap = if is_left_child { left_cap } else { right_cap };
            let inherited = ctx
                .arena(parent_side)
                .try_grow(&mut inherited_out, max(inherited_cap, parent_len));
            if !inherited {
                inherited_out = ctx
                    .arena(parent_side)
                    .alloc_slice::<EdgeEvent>(inherited_cap);
            }

            if is_left_child {
                let left_count = merge_events(&mut inherited_out, &left_temp[..lt], &new_left[..nl]);
                let right_count = merge_events(&mut fresh_out, &right_temp[..rt], &new_right[..nr]);

                ctx.arena(temp_side).release(new_right.as_ptr());
                ctx.arena(temp_side).release(new_left.as_ptr());
                ctx.arena(temp_side).release(right_temp.as_ptr());
                ctx.arena(temp_side).release(left_temp.as_ptr());

                ctx.arena(parent_side).shrink(&mut inherited_out, left_count);
                ctx.arena(temp_side).shrink(&mut fresh_out, right_count);

                left_events = inherited_out;
                right_events = fresh_out;
                left_inherited = inherited;
                right_inherited = false;
            } else {
                let left_count = merge_events(&mut fresh_out, &left_temp[..lt], &new_left[..nl]);
                let right_count =
                    merge_events(&mut inherited_out, &right_temp[..rt], &new_right[..nr]);

                ctx.arena(temp_side).release(new_right.as_ptr());
                ctx.arena(temp_side).release(new_left.as_ptr());
                ctx.arena(temp_side).release(right_temp.as_ptr());
                ctx.arena(temp_side).release(left_temp.as_ptr());

                ctx.arena(temp_side).shrink(&mut fresh_out, left_count);
                ctx.arena(parent_side).shrink(&mut inherited_out, right_count);

                left_events = fresh_out;
                right_events = inherited_out;
                left_inherited = false;
                right_inherited = inherited;
            }
        } else {
            // Without clipping, straddling primitives contribute their
            // events to both child lists. The same-side child compacts the
            // parent's buffer in place (writes trail reads).
            if is_left_child {
                let mut right_out = ctx.right_alloc.alloc_slice::<EdgeEvent>(right_cap);
                let mut left_out = events;
                let (mut l, mut r) = (0_usize, 0_usize);
                for i in 0..parent_len {
                    let event = left_out[i];
                    match ctx.class_storage.get(event.index) {
                        Classification::LeftSide => {
                            left_out[l] = event;
                            l += 1;
                        }
                        Classification::RightSide => {
                            right_out[r] = event;
                            r += 1;
                        }
                        Classification::BothSides => {
                            left_out[l] = event;
                            l += 1;
                            right_out[r] = event;
                            r += 1;
                        }
                        Classification::BothSidesProcessed => {}
                    }
                }
                ctx.left_alloc.shrink(&mut left_out, l);
                ctx.right_alloc.shrink(&mut right_out, r);
                left_events = left_out;
                right_events = right_out;
                left_inherited = true;
                right_inherited = false;
            } else {
                let mut left_out = ctx.left_alloc.alloc_slice::<EdgeEvent>(left_cap);
                let mut right_out = events;
                let (mut l, mut r) = (0_usize, 0_usize);
                for i in 0..parent_len {
                    let event = right_out[i];
                    match ctx.class_storage.get(event.index) {
                        Classification::LeftSide => {
                            left_out[l] = event;
                            l += 1;
                        }
                        Classification::RightSide => {
                            right_out[r] = event;
                            r += 1;
                        }
                        Classification::BothSides => {
                            left_out[l] = event;
                            l += 1;
                            right_out[r] = event;
                            r += 1;
                        }
                        Classification::BothSidesProcessed => {}
                    }
                }
                ctx.left_alloc.shrink(&mut left_out, l);
                ctx.right_alloc.shrink(&mut right_out, r);
                left_events = left_out;
                right_events = right_out;
                left_inherited = false;
                right_inherited = true;
            }
        }

        // ------------------------------------------------------------------
        // Recursion
        // ------------------------------------------------------------------

        let children = ctx.nodes.allocate(2) as u32;

        let node_pos = ctx.nodes.len();
        let index_pos = ctx.indices.len();
        let leaf_count_snapshot = ctx.leaf_node_count;
        let nonempty_snapshot = ctx.nonempty_leaf_node_count;
        let inner_snapshot = ctx.inner_node_count;

        let mut inner = KdNode::default();
        if !inner.init_inner(best.axis, best.pos, children - node) {
            panic!("kd-tree build context exceeded the packed child offset range");
        }
        ctx.nodes[node as usize] = inner;
        ctx.inner_node_count += 1;

        let left_ptr = left_events.as_ptr();
        let right_ptr = right_events.as_ptr();

        let left_cost = self.build_tree(
            ctx,
            depth + 1,
            children,
            left_node_bbox,
            left_events,
            best.num_left - pruned_left,
            true,
            bad_refines,
        );
        let right_cost = self.build_tree(
            ctx,
            depth + 1,
            children + 1,
            right_node_bbox,
            right_events,
            best.num_right - pruned_right,
            false,
            bad_refines,
        );

        let (p_left, p_right) = tch.probabilities(
            best.axis,
            best.pos - node_bbox.p_min[best.axis],
            node_bbox.p_max[best.axis] - best.pos,
        );
        let final_cost =
            self.params.traversal_cost + p_left * left_cost + p_right * right_cost;

        // Release the event lists the children no longer need; an inherited
        // buffer belongs to the caller.
        if !right_inherited {
            ctx.right_alloc.release(right_ptr);
        }
        if !left_inherited {
            ctx.left_alloc.release(left_ptr);
        }

        // ------------------------------------------------------------------
        // Final decision
        // ------------------------------------------------------------------

        if !self.params.retract || final_cost < prim_count as Float * self.params.query_cost {
            final_cost
        } else {
            // Splitting did not reduce the cost after all. Tear down the
            // subtree and create a leaf.
            ctx.nodes.resize(node_pos);
            ctx.retracted_splits += 1;
            ctx.leaf_node_count = leaf_count_snapshot;
            ctx.nonempty_leaf_node_count = nonempty_snapshot;
            ctx.inner_node_count = inner_snapshot;
            self.create_leaf_after_retraction(ctx, node, index_pos);
            leaf_cost
        }
    }
}

/// Rewrite the preliminary per-context trees into the final packed node and
/// index arrays, computing the tree cost along the way.
fn compactify<H: CostHeuristic>(
    contexts: &[BuildContext],
    root_bbox: &Bounds3f,
    params: &BuildParams,
) -> (NodeArray, Vec<u32>, Vec<u32>, BuildStats) {
    let mut stats = BuildStats::default();
    for ctx in contexts {
        stats.leaf_node_count += ctx.leaf_node_count;
        stats.nonempty_leaf_node_count += ctx.nonempty_leaf_node_count;
        stats.inner_node_count += ctx.inner_node_count;
        stats.index_count += ctx.prim_index_count;
        stats.retracted_splits += ctx.retracted_splits;
        stats.pruned_primitives += ctx.pruned;
    }
    stats.node_count = stats.inner_node_count + stats.leaf_node_count;

    let mut nodes = NodeArray::new(stats.node_count as usize);
    let mut final_indices = vec![0_u32; stats.index_count as usize];
    let indirections: Mutex<Vec<u32>> = Mutex::new(Vec::new());
    let job_map = &contexts[0].job_map;

    let mut node_ptr: u32 = ROOT_NODE;
    let mut index_ptr: usize = 0;

    let mut stack: Vec<(usize, u32, u32, Bounds3f)> = Vec::new();
    stack.push((0, 0, node_ptr, *root_bbox));
    node_ptr += 1;

    while let Some((mut ctx_id, mut src, target, bbox)) = stack.pop() {
        // Detect crossing into a subtree built by a worker thread.
        if ctx_id == 0 {
            if let Some(&(worker, root)) = job_map.get(&src) {
                ctx_id = worker as usize + 1;
                src = root;
            }
        }
        let node = contexts[ctx_id].nodes[src as usize];

        if node.is_leaf() {
            let start = node.prim_start();
            let end = node.prim_end();
            let prims_in_leaf = end - start;

            nodes[target].init_leaf(index_ptr as u32, prims_in_leaf);

            let quantity = H::quantity(&bbox);
            let weighted = quantity * prims_in_leaf as Float;
            stats.exp_leaves_visited += quantity;
            stats.exp_primitives_intersected += weighted;
            stats.heuristic_cost += weighted * params.query_cost;
            stats.max_prims_in_leaf = max(stats.max_prims_in_leaf, prims_in_leaf);

            let indices = &contexts[ctx_id].indices;
            for idx in start..end {
                final_indices[index_ptr] = indices[idx as usize];
                index_ptr += 1;
            }
        } else {
            let quantity = H::quantity(&bbox);
            stats.exp_traversal_steps += quantity;
            stats.heuristic_cost += quantity * params.traversal_cost;

            let left_src = src + node.left_offset();
            let children = node_ptr;
            node_ptr += 2;

            let axis = node.axis();
            let split = node.split();
            let mut target_node = KdNode::default();
            if !target_node.init_inner(axis, split, children - target) {
                // The relative offset overflowed; fall back to the shared
                // indirection table.
                let mut table = indirections.lock().unwrap();
                let entry = table.len() as u32;
                table.push(children);
                target_node.init_indirection(axis, split, entry);
            }
            nodes[target] = target_node;

            let mut right_bbox = bbox;
            right_bbox.p_min[axis] = split;
            let mut left_bbox = bbox;
            left_bbox.p_max[axis] = split;
            stack.push((ctx_id, left_src + 1, children + 1, right_bbox));
            stack.push((ctx_id, left_src, children, left_bbox));
        }
    }

    debug_assert_eq!(node_ptr, stats.node_count + 1);
    debug_assert_eq!(index_ptr, stats.index_count as usize);

    let root_quantity = H::quantity(root_bbox);
    stats.exp_traversal_steps /= root_quantity;
    stats.exp_leaves_visited /= root_quantity;
    stats.exp_primitives_intersected /= root_quantity;
    stats.heuristic_cost /= root_quantity;

    let indirections = indirections.into_inner().unwrap();
    (nodes, final_indices, indirections, stats)
}
