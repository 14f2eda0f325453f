//! Scheduler assigns graph nodes to backends, cuts the graph into splits
//! computed by one backend each, copies split inputs between backends and runs the splits.
//!
//! Backends are ordered by priority, lower index wins. The last backend is the fallback
//! and must support every op.

use crate::{
    allocator::{AllocPlan, GraphAllocator, LinearAllocator},
    backend::{Backend, Event},
    buffer::BufferType,
    config::{Config, DebugMask},
    error::SchedError,
    graph::Graph,
    table::TensorTable,
    tensor::{TensorId, MAX_SRC},
};
use std::{collections::BTreeMap, ops::Range, sync::Arc};

mod compute;
mod split;

/// Maximum number of backends of one scheduler
pub const MAX_BACKENDS: usize = 16;
/// Maximum number of inputs of one split
pub const MAX_SPLIT_INPUTS: usize = MAX_SRC;
/// Maximum number of pipelined copies
pub const MAX_COPIES: usize = 4;

/// Called for each node with `ask == true` to ask whether the caller wants to observe it,
/// then with `ask == false` after it was computed. Returning false from the second call
/// stops computation of the current split.
pub type EvalCallback = Box<dyn FnMut(&Graph, TensorId, bool) -> bool + Send>;

/// Contiguous range of nodes computed by one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    /// Backend computing this split
    pub backend_id: usize,
    /// First node
    pub start: usize,
    /// One past the last node
    pub end: usize,
    /// Tensors computed elsewhere that are copied to this split's backend before it runs
    pub inputs: Vec<TensorId>,
}

impl Split {
    #[must_use]
    pub fn nodes(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Backend ids of the flattened graph of the current and the previous scheduling
#[derive(Debug, Default)]
struct BackendIds {
    nodes: [Vec<usize>; 2],
    leafs: [Vec<usize>; 2],
    current: usize,
}

impl BackendIds {
    fn swap(&mut self) {
        self.current ^= 1;
        self.nodes[self.current].clear();
        self.leafs[self.current].clear();
    }

    fn push_node(&mut self, backend_id: usize) {
        self.nodes[self.current].push(backend_id);
    }

    fn push_leaf(&mut self, backend_id: usize) {
        self.leafs[self.current].push(backend_id);
    }

    fn nodes(&self) -> &[usize] {
        &self.nodes[self.current]
    }

    fn leafs(&self) -> &[usize] {
        &self.leafs[self.current]
    }

    fn prev_nodes(&self) -> &[usize] {
        &self.nodes[self.current ^ 1]
    }

    fn prev_leafs(&self) -> &[usize] {
        &self.leafs[self.current ^ 1]
    }
}

/// Multi backend scheduler
pub struct Scheduler {
    is_reset: bool,
    is_alloc: bool,
    backends: Vec<Arc<dyn Backend>>,
    bufts: Vec<BufferType>,
    galloc: Box<dyn GraphAllocator>,
    table: TensorTable,
    // Assignments made by the user, applied on every scheduling until reset
    overrides: BTreeMap<TensorId, usize>,
    // Flattened graph handed to the allocator
    flat_nodes: Vec<TensorId>,
    flat_leafs: Vec<TensorId>,
    ids: BackendIds,
    splits: Vec<Split>,
    graph_inputs: Vec<TensorId>,
    n_copies: usize,
    cur_copy: usize,
    // [backend][copy]
    events: Vec<Vec<Option<Box<dyn Event>>>>,
    eval_callback: Option<EvalCallback>,
    debug: DebugMask,
}

impl Scheduler {
    /// Creates scheduler over `backends` ordered by priority.
    /// `bufts` defaults to each backend's default buffer type.
    /// `n_copies` above 1 enables pipelining of consecutive computations.
    #[must_use]
    pub fn new(
        backends: Vec<Arc<dyn Backend>>,
        bufts: Option<Vec<BufferType>>,
        graph_size: usize,
        n_copies: usize,
    ) -> Scheduler {
        let bufts = bufts.unwrap_or_else(|| backends.iter().map(|b| b.default_buffer_type()).collect());
        let galloc = Box::new(LinearAllocator::new(bufts.clone()));
        Scheduler::with_allocator(backends, bufts, graph_size, n_copies, galloc)
    }

    /// Creates scheduler with settings from config
    #[must_use]
    pub fn from_config(backends: Vec<Arc<dyn Backend>>, config: &Config) -> Scheduler {
        let mut sched = Scheduler::new(backends, None, config.graph_size(), config.copies());
        sched.debug = config.debug_mask();
        sched
    }

    /// Creates scheduler with custom graph allocator
    #[must_use]
    pub fn with_allocator(
        backends: Vec<Arc<dyn Backend>>,
        bufts: Vec<BufferType>,
        graph_size: usize,
        n_copies: usize,
        galloc: Box<dyn GraphAllocator>,
    ) -> Scheduler {
        let n_backends = backends.len();
        assert!(
            (1..=MAX_BACKENDS).contains(&n_backends),
            "scheduler needs between 1 and {MAX_BACKENDS} backends, got {n_backends}"
        );
        assert!(backends[n_backends - 1].is_fallback(), "the last backend must be the fallback backend");
        assert!((1..=MAX_COPIES).contains(&n_copies), "n_copies must be between 1 and {MAX_COPIES}");
        assert_eq!(bufts.len(), n_backends, "one buffer type per backend is required");
        for (backend, buft) in backends.iter().zip(&bufts) {
            assert!(
                backend.supports_buft(buft),
                "backend {} does not support buffer type {}",
                backend.name(),
                buft.name()
            );
        }
        let events = backends
            .iter()
            .map(|backend| {
                (0..n_copies).map(|_| if n_copies > 1 { backend.event_new() } else { None }).collect()
            })
            .collect();
        let mut sched = Scheduler {
            is_reset: false,
            is_alloc: false,
            backends,
            bufts,
            galloc,
            table: TensorTable::new(graph_size, n_backends, n_copies),
            overrides: BTreeMap::new(),
            flat_nodes: Vec::with_capacity(graph_size),
            flat_leafs: Vec::new(),
            ids: BackendIds::default(),
            splits: Vec::new(),
            graph_inputs: Vec::new(),
            n_copies,
            cur_copy: 0,
            events,
            eval_callback: None,
            debug: DebugMask::from_env(),
        };
        sched.reset();
        sched
    }

    pub fn set_debug(&mut self, debug: DebugMask) {
        self.debug = debug;
    }

    /// Forgets all assignments, the next computation schedules the graph again
    pub fn reset(&mut self) {
        if !self.is_reset {
            self.table.reset(0);
            self.overrides.clear();
            self.is_reset = true;
        }
        self.is_alloc = false;
    }

    /// Schedules `graph` and reserves buffers big enough for it, without binding any tensors.
    /// Use the biggest graph that will be computed.
    pub fn reserve(&mut self, graph: &mut Graph) -> Result<(), SchedError> {
        self.synchronize()?;
        self.split_graph(graph);
        let plan = AllocPlan {
            nodes: &self.flat_nodes,
            node_backend_ids: self.ids.nodes(),
            leafs: &self.flat_leafs,
            leaf_backend_ids: self.ids.leafs(),
        };
        let reserved = self.galloc.reserve(graph, &plan);
        graph.restore();
        self.reset();
        if reserved {
            Ok(())
        } else {
            Err(SchedError::AllocationFailed)
        }
    }

    /// Schedules `graph` and binds all its tensors to memory
    pub fn alloc_graph(&mut self, graph: &mut Graph) -> Result<(), SchedError> {
        self.split_graph(graph);
        self.alloc_splits(graph)?;
        self.is_alloc = true;
        Ok(())
    }

    /// Computes `graph` and waits for the result
    pub fn graph_compute(&mut self, graph: &mut Graph) -> Result<(), SchedError> {
        self.graph_compute_async(graph)?;
        self.synchronize()
    }

    /// Computes `graph`, backends may still be running when this returns
    pub fn graph_compute_async(&mut self, graph: &mut Graph) -> Result<(), SchedError> {
        if !self.is_reset && !self.is_alloc {
            self.reset();
        }
        if !self.is_alloc {
            self.alloc_graph(graph)?;
        }
        self.compute_splits(graph)
    }

    /// Waits for all backends
    pub fn synchronize(&self) -> Result<(), SchedError> {
        for backend in &self.backends {
            backend.synchronize()?;
        }
        Ok(())
    }

    pub fn set_eval_callback(&mut self, callback: Option<EvalCallback>) {
        self.eval_callback = callback;
    }

    #[must_use]
    pub fn n_splits(&self) -> usize {
        self.splits.len()
    }

    #[must_use]
    pub fn splits(&self) -> &[Split] {
        &self.splits
    }

    /// Number of copies of split inputs
    #[must_use]
    pub fn n_copies(&self) -> usize {
        self.n_copies
    }

    /// Copy slot used by the next computation
    #[must_use]
    pub fn cur_copy(&self) -> usize {
        self.cur_copy
    }

    #[must_use]
    pub fn n_backends(&self) -> usize {
        self.backends.len()
    }

    #[must_use]
    pub fn backend(&self, i: usize) -> &Arc<dyn Backend> {
        &self.backends[i]
    }

    /// Index of `backend` in this scheduler
    #[must_use]
    pub fn backend_id(&self, backend: &Arc<dyn Backend>) -> Option<usize> {
        self.backends.iter().position(|b| Arc::ptr_eq(b, backend))
    }

    /// Bytes reserved for graph tensors of backend
    #[must_use]
    pub fn buffer_size(&self, backend: &Arc<dyn Backend>) -> usize {
        self.backend_id(backend).map_or(0, |b| self.galloc.buffer_size(b))
    }

    /// Pins node to backend. Pins are kept until [`Scheduler::reset`].
    pub fn set_tensor_backend(&mut self, node: TensorId, backend: &Arc<dyn Backend>) {
        let backend_id = self.backend_id(backend).expect("backend is not part of this scheduler");
        self.overrides.insert(node, backend_id);
        self.table.set_backend_id(node, Some(backend_id));
        self.is_reset = false;
    }

    /// Backend assigned to tensor by the last scheduling
    #[must_use]
    pub fn tensor_backend(&self, node: TensorId) -> Option<&Arc<dyn Backend>> {
        self.tensor_backend_id(node).map(|b| &self.backends[b])
    }

    #[must_use]
    pub fn tensor_backend_id(&self, node: TensorId) -> Option<usize> {
        self.table.backend_id(node)
    }

    /// Copy of `tensor` made for `backend_id` in copy slot `copy`
    #[must_use]
    pub fn tensor_copy(&self, tensor: TensorId, backend_id: usize, copy: usize) -> Option<TensorId> {
        self.table.copy(tensor, backend_id, copy)
    }

    /// Prints splits and assignment of every node and its sources
    pub fn print_assignments(&self, graph: &Graph) {
        let mut cur_split = 0;
        for (i, &node) in graph.nodes().iter().enumerate() {
            if cur_split < self.splits.len() && i == self.splits[cur_split].start {
                let split = &self.splits[cur_split];
                print!("\n## SPLIT #{cur_split}: {} # {} inputs: ", self.backends[split.backend_id].name(), split.inputs.len());
                for &input in &split.inputs {
                    print!("[{} ({:5.5})] ", graph.tensor(input).name(), fmt_size(graph.tensor(input).nbytes()));
                }
                println!();
                cur_split += 1;
            }
            let t = graph.tensor(node);
            if t.op().is_view() {
                continue;
            }
            print!(
                "node #{i:3} ({:>10.10}): {:>20.20} ({:5.5}) [{:>5.5}]:",
                t.op().name(),
                t.name(),
                fmt_size(t.nbytes()),
                self.backend_name(node)
            );
            for src in t.srcs() {
                print!(
                    " {:>20.20} ({:5.5}) [{:>5.5}]",
                    graph.tensor(src).name(),
                    fmt_size(graph.tensor(src).nbytes()),
                    self.backend_name(src)
                );
            }
            println!();
        }
    }

    fn backend_name(&self, id: TensorId) -> &str {
        self.table.backend_id(id).map_or("NULL", |b| self.backends[b].name())
    }
}

fn fmt_size(size: usize) -> String {
    if size >= 1024 * 1024 {
        format!("{}M", size / 1024 / 1024)
    } else {
        format!("{}K", size / 1024)
    }
}
