//! # gsched
//!
//! Runs one compute graph across several heterogeneous backends.
//!
//! Graph nodes are assigned to backends ordered by priority, the graph is cut into splits
//! computed by one backend each, tensors crossing backends are copied, and the splits
//! are computed in order with optional pipelining of consecutive computations.
//!
//! ```rust
//! use gsched::{DType, Graph};
//! let mut graph = Graph::new();
//! let x = graph.new_tensor(DType::F32, &[4]);
//! let y = graph.relu(x);
//! graph.build_forward(y);
//! assert_eq!(graph.n_nodes(), 1);
//! ```
//!
//! Backends are configured in `gsched/config.json` found in xdg config directories,
//! see [Config].

#![forbid(unsafe_code)]
#![forbid(rustdoc::broken_intra_doc_links)]
#![forbid(rustdoc::private_intra_doc_links)]
#![forbid(rustdoc::invalid_codeblock_attributes)]
#![forbid(rustdoc::invalid_rust_codeblocks)]
#![forbid(rustdoc::bare_urls)]

mod allocator;
pub mod backend;
mod buffer;
mod config;
mod dtype;
mod error;
mod graph;
mod graph_copy;
pub mod host;
pub mod interpreter;
mod registry;
mod scheduler;
mod table;
mod tensor;

pub use allocator::{AllocPlan, GraphAllocator, LinearAllocator};
pub use backend::{Backend, Event, Subgraph};
pub use buffer::{
    composite_buffer, tensor_alloc, tensor_copy, tensor_get, tensor_set, view_init, Buffer, BufferInterface,
    BufferType, BufferTypeInterface, BufferUsage,
};
pub use config::{Config, CpuConfig, DebugMask, DEFAULT_GRAPH_SIZE};
pub use dtype::DType;
pub use error::{BackendError, ErrorStatus, SchedError};
pub use graph::Graph;
pub use graph_copy::{compare_graph_backend, graph_copy, GraphCopy};
pub use registry::{BackendInitFn, BackendRegistry, MAX_REGISTERED_BACKENDS};
pub use scheduler::{EvalCallback, Scheduler, Split, MAX_BACKENDS, MAX_COPIES, MAX_SPLIT_INPUTS};
pub use table::TensorTable;
pub use tensor::{Op, Tensor, TensorFlags, TensorId, MAX_DIMS, MAX_SRC};
