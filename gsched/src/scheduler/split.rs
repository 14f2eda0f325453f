//! Assignment of nodes to backends and cutting of the graph into splits.
//!
//! 1. Tensors with memory, view sources in memory, graph inputs and consumers of weights.
//! 2. Assigned backends spread to neighbouring nodes, non fallback backends first.
//! 3. Remaining nodes go to the backend supporting the most of their sources,
//!    assigned nodes move to higher priority backends sharing their buffer type.
//! 4. Leftover sources and views inherit from consumers and view sources.
//! 5. Consecutive nodes on one backend form splits, sources from elsewhere become split inputs.

use super::{Scheduler, Split, MAX_SPLIT_INPUTS};
use crate::{
    graph::Graph,
    tensor::{TensorFlags, TensorId, MAX_SRC},
};
use std::mem;

impl Scheduler {
    fn fallback_id(&self) -> usize {
        self.backends.len() - 1
    }

    fn assigned(&self, id: TensorId) -> usize {
        self.table
            .backend_id(id)
            .unwrap_or_else(|| panic!("tensor {id} has no backend assigned"))
    }

    /// Highest priority backend able to use memory of `tensor` for computing `op`
    fn backend_from_buffer(&self, graph: &Graph, tensor: TensorId, op: TensorId) -> Option<usize> {
        let buffer = graph.tensor(tensor).buffer()?;
        let found = self
            .backends
            .iter()
            .position(|b| b.supports_buft(buffer.buffer_type()) && b.supports_op(graph, op));
        if found.is_none() && self.debug.sched() {
            println!(
                "Warning: no backend supports op {} with buffer type {} used by tensor {:?}",
                graph.tensor(op).op().name(),
                buffer.buffer_type().name(),
                graph.tensor(tensor).name()
            );
        }
        found
    }

    /// Backend implied by the tensor itself, its memory, flags and weight sources
    fn backend_from_cur(&self, graph: &Graph, id: TensorId) -> Option<usize> {
        let t = graph.tensor(id);
        if let Some(b) = self.backend_from_buffer(graph, id, id) {
            return Some(b);
        }
        if let Some(view_src) = t.view_src() {
            if let Some(b) = self.backend_from_buffer(graph, view_src, id) {
                return Some(b);
            }
        }
        if t.flags().contains(TensorFlags::INPUT) {
            return Some(self.fallback_id());
        }
        for src in t.srcs() {
            if !graph.tensor(src).is_weights() {
                continue;
            }
            let src_backend = self.backend_from_buffer(graph, src, id);
            // Weights in host memory, see if a better backend wants the op anyway
            if src_backend == Some(self.fallback_id()) {
                for b in 0..self.fallback_id() {
                    if self.backends[b].supports_op(graph, id) && self.backends[b].offload_op(graph, id) {
                        return Some(b);
                    }
                }
            }
            return src_backend;
        }
        None
    }

    /// Can `backend_id` read `tensor` where it is or where it will be?
    fn buffer_supported(&self, graph: &Graph, tensor: TensorId, backend_id: usize) -> bool {
        let t = graph.tensor(tensor);
        let buffer = match t.view_src() {
            Some(view_src) => graph.tensor(view_src).buffer().or(t.buffer()),
            None => t.buffer(),
        };
        let buft = match buffer {
            Some(buffer) => Some(buffer.buffer_type().clone()),
            None => self
                .table
                .backend_id(tensor)
                .or_else(|| t.view_src().and_then(|v| self.table.backend_id(v)))
                .map(|b| self.bufts[b].clone()),
        };
        buft.is_some_and(|buft| self.backends[backend_id].supports_buft(&buft))
    }

    fn set_if_supported(&mut self, graph: &Graph, node: TensorId, backend_id: usize) {
        if self.backends[backend_id].supports_op(graph, node) {
            self.table.set_backend_id(node, Some(backend_id));
        }
    }

    /// Spreads assigned backends to unassigned neighbours in one direction
    fn expand(&mut self, graph: &Graph, order: impl Iterator<Item = usize>, skip_fallback: bool) {
        let mut cur = None;
        for i in order {
            let node = graph.nodes()[i];
            if graph.tensor(node).op().is_view() {
                continue;
            }
            match self.table.backend_id(node) {
                Some(b) if skip_fallback && b == self.fallback_id() => cur = None,
                Some(b) => cur = Some(b),
                None => {
                    if let Some(b) = cur {
                        self.set_if_supported(graph, node, b);
                    }
                }
            }
        }
    }

    /// Assigns every node and leaf of `graph` to a backend and cuts the graph into splits.
    /// Previous scheduling of the graph is undone first.
    pub fn split_graph(&mut self, graph: &mut Graph) {
        graph.restore();
        self.is_reset = false;
        self.splits.clear();
        self.graph_inputs.clear();
        self.table.reset(graph.len());
        for (&node, &b) in &self.overrides {
            self.table.set_backend_id(node, Some(b));
        }

        self.assign_pinned(graph);
        self.expand_assignments(graph);
        self.assign_remaining(graph);
        self.assign_sources(graph);
        self.cut_splits(graph);
        self.flatten(graph);

        if self.debug.sched() {
            self.print_assignments(graph);
        }
    }

    // Pass 1
    fn assign_pinned(&mut self, graph: &Graph) {
        for &leaf in graph.leafs() {
            if self.table.backend_id(leaf).is_none() {
                let b = self.backend_from_cur(graph, leaf);
                self.table.set_backend_id(leaf, b);
            }
        }
        for &node in graph.nodes() {
            if self.table.backend_id(node).is_none() {
                let b = self.backend_from_cur(graph, node);
                self.table.set_backend_id(node, b);
            }
        }
    }

    // Pass 2
    fn expand_assignments(&mut self, graph: &Graph) {
        let n = graph.n_nodes();
        self.expand(graph, 0..n, true);
        self.expand(graph, (0..n).rev(), true);
        self.expand(graph, 0..n, false);
        self.expand(graph, (0..n).rev(), false);
    }

    // Pass 3
    fn assign_remaining(&mut self, graph: &Graph) {
        for &node in graph.nodes() {
            let t = graph.tensor(node);
            if t.op().is_view() {
                continue;
            }
            match self.table.backend_id(node) {
                None => {
                    let mut best: Option<(usize, usize)> = None;
                    for b in 0..self.backends.len() {
                        if !self.backends[b].supports_op(graph, node) {
                            continue;
                        }
                        let n_supported = t
                            .srcs()
                            .filter(|&src| {
                                let assigned = self.table.backend_id(src).is_some()
                                    || graph
                                        .tensor(src)
                                        .view_src()
                                        .is_some_and(|v| self.table.backend_id(v).is_some());
                                assigned && self.buffer_supported(graph, src, b)
                            })
                            .count();
                        if best.map_or(true, |(n, _)| n_supported > n) {
                            best = Some((n_supported, b));
                        }
                    }
                    let (_, b) = best.unwrap_or_else(|| panic!("no backend supports op {}", t.op().name()));
                    self.table.set_backend_id(node, Some(b));
                }
                Some(cur) => {
                    // Same memory, higher priority backend
                    for b in 0..cur {
                        if self.bufts[b] == self.bufts[cur]
                            && self.backends[b].supports_op(graph, node)
                            && t.srcs().all(|src| self.buffer_supported(graph, src, b))
                        {
                            self.table.set_backend_id(node, Some(b));
                            break;
                        }
                    }
                }
            }
        }
    }

    // Pass 4
    fn assign_sources(&mut self, graph: &Graph) {
        for &node in graph.nodes() {
            let t = graph.tensor(node);
            let mut cur = self.table.backend_id(node);
            if cur.is_none() {
                if let Some(view_src) = t.view_src() {
                    cur = self.table.backend_id(view_src);
                    self.table.set_backend_id(node, cur);
                }
            }
            for src in t.srcs() {
                if self.table.backend_id(src).is_none() {
                    let b = match graph.tensor(src).view_src() {
                        Some(view_src) => self.table.backend_id(view_src),
                        None => cur,
                    };
                    self.table.set_backend_id(src, b);
                }
            }
        }
        // Views of tensors that are still unassigned take their consumers' backend
        for &node in graph.nodes().iter().rev() {
            let Some(cur) = self.table.backend_id(node) else { continue };
            for src in graph.tensor(node).srcs() {
                if self.table.backend_id(src).is_none() {
                    self.table.set_backend_id(src, Some(cur));
                }
                if let Some(view_src) = graph.tensor(src).view_src() {
                    if self.table.backend_id(view_src).is_none() {
                        self.table.set_backend_id(view_src, Some(cur));
                    }
                }
            }
        }
        let fallback = self.fallback_id();
        for &id in graph.nodes().iter().chain(graph.leafs()) {
            if self.table.backend_id(id).is_none() {
                self.table.set_backend_id(id, Some(fallback));
            }
        }
    }

    /// Is `src` computed elsewhere, unreadable by `backend_id` and not copied there yet?
    fn needs_copy(&self, graph: &Graph, src: TensorId, backend_id: usize) -> bool {
        self.assigned(src) != backend_id
            && self.table.copy(src, backend_id, 0).is_none()
            && !self.buffer_supported(graph, src, backend_id)
    }

    /// Copy of `src` in slot `c`, the slot of the current copy reuses `src` itself for graph inputs
    fn make_copy(&mut self, graph: &mut Graph, src: TensorId, backend_id: usize, c: usize) -> TensorId {
        let name = format!("{}#{}#{c}", self.backends[backend_id].name(), graph.tensor(src).name());
        let copy = graph.dup_scratch(src, name);
        if self.n_copies > 1 {
            let t = graph.tensor_mut(copy);
            t.flags.insert(TensorFlags::INPUT);
            t.flags.insert(TensorFlags::OUTPUT);
        }
        copy
    }

    // Pass 5
    fn cut_splits(&mut self, graph: &mut Graph) {
        let n_nodes = graph.n_nodes();
        if n_nodes == 0 {
            return;
        }
        let first = graph.nodes().iter().position(|&n| !graph.tensor(n).op().is_view());
        let mut cur_backend = self.assigned(graph.nodes()[first.unwrap_or(0)]);
        let mut split = Split { backend_id: cur_backend, start: 0, end: 0, inputs: Vec::new() };

        for i in first.unwrap_or(n_nodes)..n_nodes {
            let node = graph.nodes()[i];
            if graph.tensor(node).op().is_view() {
                continue;
            }
            let node_backend = self.assigned(node);

            // Weights from another backend or too many inputs start a new split
            let mut need_new_split = false;
            if node_backend == cur_backend && !split.inputs.is_empty() {
                let t = graph.tensor(node);
                let weights_elsewhere = t
                    .srcs()
                    .any(|src| graph.tensor(src).is_weights() && self.table.backend_id(src) != Some(cur_backend));
                let mut srcs: Vec<TensorId> = t.srcs().collect();
                srcs.sort_unstable();
                srcs.dedup();
                let new_inputs = srcs.into_iter().filter(|&src| self.needs_copy(graph, src, cur_backend)).count();
                need_new_split = weights_elsewhere || split.inputs.len() + new_inputs > MAX_SPLIT_INPUTS;
            }

            if node_backend != cur_backend || need_new_split {
                split.end = i;
                let next = Split { backend_id: node_backend, start: i, end: 0, inputs: Vec::new() };
                self.splits.push(mem::replace(&mut split, next));
                cur_backend = node_backend;
            }

            for slot in 0..MAX_SRC {
                let Some(src) = graph.tensor(node).src(slot) else { continue };
                let src_backend = self.assigned(src);

                if graph.tensor(src).is_input() && self.n_copies > 1 && self.table.copy(src, src_backend, 0).is_none() {
                    for c in 0..self.n_copies {
                        let copy = if c == self.cur_copy { src } else { self.make_copy(graph, src, src_backend, c) };
                        self.table.set_copy(src, src_backend, c, copy);
                    }
                    assert!(self.graph_inputs.len() < MAX_SPLIT_INPUTS, "too many graph inputs");
                    self.graph_inputs.push(src);
                }

                if src_backend != cur_backend && !self.buffer_supported(graph, src, cur_backend) {
                    if self.table.copy(src, cur_backend, 0).is_none() {
                        for c in 0..self.n_copies {
                            let copy = self.make_copy(graph, src, cur_backend, c);
                            self.table.set_copy(src, cur_backend, c, copy);
                        }
                        assert!(
                            split.inputs.len() < MAX_SPLIT_INPUTS,
                            "split on {} has too many inputs",
                            self.backends[cur_backend].name()
                        );
                        split.inputs.push(src);
                    }
                    let copy = self.table.copy(src, cur_backend, self.cur_copy);
                    if let Some(copy) = copy {
                        graph.rewrite_src(node, slot, copy);
                    }
                }
            }
        }
        split.end = n_nodes;
        self.splits.push(split);
    }

    /// Builds graph for the allocator: each split's input copies preceded by views
    /// keeping the originals alive, then the split's nodes. Then copies of inputs and leafs.
    fn flatten(&mut self, graph: &mut Graph) {
        self.ids.swap();
        self.flat_nodes.clear();
        self.flat_leafs.clear();
        let splits = mem::take(&mut self.splits);
        for split in &splits {
            for &input in &split.inputs {
                let input_backend = self.assigned(input);
                let input_cpy = self.table.copy(input, split.backend_id, self.cur_copy).unwrap_or(input);
                let dep = graph.dependency_scratch(input);
                self.flat_nodes.push(dep);
                self.ids.push_node(input_backend);
                self.flat_nodes.push(input_cpy);
                self.ids.push_node(split.backend_id);
            }
            for &node in &graph.nodes()[split.nodes()] {
                self.flat_nodes.push(node);
                self.ids.push_node(self.assigned(node));
            }
        }
        if self.n_copies > 1 {
            for &input in &self.graph_inputs {
                let b = self.assigned(input);
                for c in 0..self.n_copies {
                    if let Some(copy) = self.table.copy(input, b, c) {
                        self.flat_leafs.push(copy);
                        self.ids.push_leaf(b);
                    }
                }
            }
            for split in &splits {
                for &input in &split.inputs {
                    for c in 0..self.n_copies {
                        if let Some(copy) = self.table.copy(input, split.backend_id, c) {
                            self.flat_leafs.push(copy);
                            self.ids.push_leaf(split.backend_id);
                        }
                    }
                }
            }
        }
        for &leaf in graph.leafs() {
            self.flat_leafs.push(leaf);
            self.ids.push_leaf(self.assigned(leaf));
        }
        self.splits = splits;
    }
}
