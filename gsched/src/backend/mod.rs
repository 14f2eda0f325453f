//! Backend agnostic interface to compute devices.
//! The scheduler only talks to devices through [Backend] and [Event].
//! Backends may execute asynchronously, events order work between them.

use crate::{
    buffer::{self, BufferType},
    error::BackendError,
    graph::Graph,
    tensor::{Tensor, TensorId},
};
use std::any::Any;

pub mod dummy;

/// Contiguous range of graph nodes computed by one backend
#[derive(Debug, Clone, Copy)]
pub struct Subgraph<'a> {
    /// Graph owning the tensors
    pub graph: &'a Graph,
    /// Nodes to compute, in order
    pub nodes: &'a [TensorId],
}

impl<'a> Subgraph<'a> {
    /// All nodes of the graph
    #[must_use]
    pub fn new(graph: &'a Graph) -> Subgraph<'a> {
        Subgraph { graph, nodes: graph.nodes() }
    }

    /// Node tensor with its sources
    pub fn node(&self, id: TensorId) -> (&'a Tensor, Vec<&'a Tensor>) {
        let node = self.graph.tensor(id);
        let srcs = node.srcs().map(|src| self.graph.tensor(src)).collect();
        (node, srcs)
    }
}

/// Compute device
pub trait Backend: Send + Sync {
    /// Name of the backend
    fn name(&self) -> &str;

    /// Buffer type used for tensors computed by this backend
    fn default_buffer_type(&self) -> BufferType;

    /// Write into tensor, may return before the write is finished
    fn set_tensor_async(&self, tensor: &Tensor, data: &[u8], offset: usize) -> Result<(), BackendError> {
        buffer::tensor_set(tensor, data, offset)
    }

    /// Read from tensor, `data` is valid after [`Backend::synchronize`]
    fn get_tensor_async(&self, tensor: &Tensor, data: &mut [u8], offset: usize) -> Result<(), BackendError> {
        self.synchronize()?;
        buffer::tensor_get(tensor, data, offset)
    }

    /// Copy `src` computed by `src_backend` into `dst` on this backend without waiting.
    /// Returns false if not supported, caller then copies synchronously.
    fn cpy_tensor_async(&self, src_backend: &dyn Backend, src: &Tensor, dst: &Tensor) -> Result<bool, BackendError> {
        let _ = (src_backend, src, dst);
        Ok(false)
    }

    /// Wait for all submitted work
    fn synchronize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Submit nodes for computation, may return before they are computed
    fn graph_compute_async(&self, subgraph: Subgraph<'_>) -> Result<(), BackendError>;

    /// Compute nodes and wait for the result
    fn graph_compute(&self, subgraph: Subgraph<'_>) -> Result<(), BackendError> {
        self.graph_compute_async(subgraph)?;
        self.synchronize()
    }

    /// Can this backend compute node `op`?
    fn supports_op(&self, graph: &Graph, op: TensorId) -> bool;

    /// Can this backend read and write memory of `buft`?
    fn supports_buft(&self, buft: &BufferType) -> bool;

    /// Should node `op` be moved here even though its weights are in host memory?
    fn offload_op(&self, graph: &Graph, op: TensorId) -> bool {
        let _ = (graph, op);
        false
    }

    /// Backend that supports every op and can be used as the last resort
    fn is_fallback(&self) -> bool {
        false
    }

    /// New event, None if events are not supported
    fn event_new(&self) -> Option<Box<dyn Event>> {
        None
    }

    /// Make future work submitted to this backend wait until `event` completes
    fn event_wait(&self, event: &dyn Event) -> Result<(), BackendError> {
        event.synchronize()
    }
}

/// Marker in a backend's stream of work
pub trait Event: Send + Sync {
    /// Marks the current end of the owning backend's submitted work
    fn record(&self) -> Result<(), BackendError>;
    /// Blocks until the work before the last record is complete
    fn synchronize(&self) -> Result<(), BackendError>;
    /// Downcasting for backends waiting on their own events
    fn as_any(&self) -> &dyn Any;
}
