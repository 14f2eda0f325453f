//! Graph allocation. Places every unallocated tensor of a scheduled graph into
//! one buffer per backend.

use crate::{
    buffer::{Buffer, BufferType},
    config::DebugMask,
    graph::{align_up, Graph},
    tensor::TensorId,
};
use std::collections::BTreeSet;

/// Flattened graph produced by scheduling, with backend of each tensor
#[derive(Debug, Clone, Copy)]
pub struct AllocPlan<'a> {
    pub nodes: &'a [TensorId],
    pub node_backend_ids: &'a [usize],
    pub leafs: &'a [TensorId],
    pub leaf_backend_ids: &'a [usize],
}

impl AllocPlan<'_> {
    /// Leafs then nodes with their backends, each tensor once
    fn tensors(&self) -> Vec<(TensorId, usize)> {
        let mut seen = BTreeSet::new();
        self.leafs
            .iter()
            .zip(self.leaf_backend_ids)
            .chain(self.nodes.iter().zip(self.node_backend_ids))
            .filter(|(id, _)| seen.insert(**id))
            .map(|(&id, &b)| (id, b))
            .collect()
    }
}

/// Memory planner used by the scheduler
pub trait GraphAllocator: Send {
    /// Makes sure buffers are big enough for `plan`. Returns false if a buffer could not be allocated.
    fn reserve(&mut self, graph: &Graph, plan: &AllocPlan<'_>) -> bool;
    /// Binds all unallocated tensors of `plan`. Returns false if reserved buffers are too small.
    fn alloc_graph(&mut self, graph: &mut Graph, plan: &AllocPlan<'_>) -> bool;
    /// Size of the buffer reserved for backend
    fn buffer_size(&self, backend_id: usize) -> usize;
}

/// Places tensors one after another without reusing memory
pub struct LinearAllocator {
    bufts: Vec<BufferType>,
    buffers: Vec<Option<Buffer>>,
    debug: DebugMask,
}

impl LinearAllocator {
    #[must_use]
    pub fn new(bufts: Vec<BufferType>) -> LinearAllocator {
        let buffers = vec![None; bufts.len()];
        LinearAllocator { bufts, buffers, debug: DebugMask::from_env() }
    }

    fn required_sizes(&self, graph: &Graph, plan: &AllocPlan<'_>) -> Vec<usize> {
        let mut sizes = vec![0; self.bufts.len()];
        for (id, b) in plan.tensors() {
            let t = graph.tensor(id);
            if t.is_allocated() || t.view_src().is_some() {
                continue;
            }
            let buft = &self.bufts[b];
            sizes[b] += align_up(buft.alloc_size(t), buft.alignment());
        }
        sizes
    }
}

impl GraphAllocator for LinearAllocator {
    fn reserve(&mut self, graph: &Graph, plan: &AllocPlan<'_>) -> bool {
        let sizes = self.required_sizes(graph, plan);
        for (b, &size) in sizes.iter().enumerate() {
            let current = self.buffers[b].as_ref().map_or(0, Buffer::size);
            if size <= current {
                continue;
            }
            if self.debug.alloc() {
                println!("Reallocating {} buffer from {current} B to {size} B", self.bufts[b].name());
            }
            // Release old buffer first
            self.buffers[b] = None;
            match self.bufts[b].alloc_buffer(size) {
                Ok(buffer) => self.buffers[b] = Some(buffer),
                Err(e) => {
                    if self.debug.alloc() {
                        println!("Failed to allocate {} buffer of {size} B, {e}", self.bufts[b].name());
                    }
                    return false;
                }
            }
        }
        true
    }

    fn alloc_graph(&mut self, graph: &mut Graph, plan: &AllocPlan<'_>) -> bool {
        let sizes = self.required_sizes(graph, plan);
        for (b, &size) in sizes.iter().enumerate() {
            let current = self.buffers[b].as_ref().map_or(0, Buffer::size);
            if size > current {
                if self.debug.alloc() {
                    println!("{} buffer of {current} B is too small, need {size} B", self.bufts[b].name());
                }
                return false;
            }
        }
        let mut cursors: Vec<usize> = self
            .buffers
            .iter()
            .map(|buffer| {
                buffer.as_ref().map_or(0, |buffer| {
                    buffer.reset();
                    buffer.base()
                })
            })
            .collect();
        for (id, b) in plan.tensors() {
            let t = graph.tensor(id);
            if t.is_allocated() {
                continue;
            }
            if let Some(view_src) = t.view_src() {
                if graph.tensor(view_src).is_allocated() {
                    graph.init_view_transient(id);
                }
                continue;
            }
            let Some(buffer) = &self.buffers[b] else {
                return false;
            };
            let buft = &self.bufts[b];
            let size = align_up(buft.alloc_size(t), buft.alignment());
            graph.bind_transient(id, buffer, cursors[b]);
            cursors[b] += size;
        }
        true
    }

    fn buffer_size(&self, backend_id: usize) -> usize {
        self.buffers[backend_id].as_ref().map_or(0, Buffer::size)
    }
}
