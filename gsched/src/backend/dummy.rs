//! Emulated accelerator for testing. Has its own non host memory, an in-order
//! work queue that only runs on synchronization and events marking positions in that queue.

use super::{Backend, Event, Subgraph};
use crate::{
    buffer::{self, BufferInterface, BufferType, BufferTypeInterface},
    error::{BackendError, ErrorStatus},
    graph::Graph,
    host::{tensor_addr, HostMemory},
    interpreter,
    registry::BackendRegistry,
    tensor::{Tensor, TensorId},
};
use nanoserde::DeJson;
use std::{
    any::Any,
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

const DUMMY_ALIGNMENT: usize = 64;

#[derive(DeJson, Debug, Clone, Default)]
pub struct DummyConfig {
    /// Register dummy backend
    #[nserde(default)]
    pub enabled: bool,
    /// Backend name, "Dummy" if empty
    #[nserde(default)]
    pub name: String,
    /// Op names this backend computes, all if empty
    #[nserde(default)]
    pub supported_ops: Vec<String>,
    /// Op names pulled onto this backend away from host weights
    #[nserde(default)]
    pub offload_ops: Vec<String>,
    /// Support events
    #[nserde(default)]
    pub events: bool,
    /// Device memory in bytes, 0 is unlimited
    #[nserde(default)]
    pub memory: usize,
}

/// Counters of work done by a dummy backend
#[derive(Debug, Default)]
pub struct DummyStats {
    pub computed_nodes: AtomicUsize,
    pub synchronizations: AtomicUsize,
    pub event_records: AtomicUsize,
    pub event_waits: AtomicUsize,
    pub async_copies: AtomicUsize,
}

enum Task {
    Compute(Vec<(Tensor, Vec<Tensor>)>),
    Write { tensor: Tensor, data: Vec<u8>, offset: usize },
    Copy { src: Tensor, dst: Tensor },
}

#[derive(Default)]
struct Queue {
    tasks: Mutex<VecDeque<Task>>,
    submitted: AtomicU64,
    completed: AtomicU64,
}

impl Queue {
    fn submit(&self, task: Task) -> Result<(), BackendError> {
        let mut tasks = self.tasks.lock().map_err(|_| poisoned())?;
        tasks.push_back(task);
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Runs tasks in order until `mark` tasks have completed
    fn drain(&self, mark: u64, stats: &DummyStats) -> Result<(), BackendError> {
        while self.completed.load(Ordering::SeqCst) < mark {
            let task = self.tasks.lock().map_err(|_| poisoned())?.pop_front();
            let Some(task) = task else { break };
            let res = run(task, stats);
            self.completed.fetch_add(1, Ordering::SeqCst);
            res?;
        }
        Ok(())
    }

    fn drain_all(&self, stats: &DummyStats) -> Result<(), BackendError> {
        self.drain(self.submitted.load(Ordering::SeqCst), stats)
    }
}

fn poisoned() -> BackendError {
    BackendError::new(ErrorStatus::Compute, "dummy queue lock is poisoned")
}

fn run(task: Task, stats: &DummyStats) -> Result<(), BackendError> {
    match task {
        Task::Compute(nodes) => {
            for (node, srcs) in &nodes {
                let srcs: Vec<&Tensor> = srcs.iter().collect();
                interpreter::compute_node(node, &srcs)?;
                stats.computed_nodes.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        }
        Task::Write { tensor, data, offset } => buffer::tensor_set(&tensor, &data, offset),
        Task::Copy { src, dst } => buffer::tensor_copy(&src, &dst),
    }
}

struct DummyBufferType {
    name: String,
    memory: usize,
}

impl BufferTypeInterface for DummyBufferType {
    fn name(&self) -> &str {
        &self.name
    }

    fn alloc_buffer(&self, size: usize) -> Result<Box<dyn BufferInterface>, BackendError> {
        Ok(Box::new(DummyBuffer { name: self.name.clone(), memory: HostMemory::new(size, DUMMY_ALIGNMENT)? }))
    }

    fn alignment(&self) -> usize {
        DUMMY_ALIGNMENT
    }

    fn max_size(&self) -> usize {
        if self.memory == 0 {
            usize::MAX
        } else {
            self.memory
        }
    }
}

struct DummyBuffer {
    name: String,
    memory: HostMemory,
}

impl BufferInterface for DummyBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    fn base(&self) -> usize {
        self.memory.base()
    }

    fn set_tensor(&self, tensor: &Tensor, data: &[u8], offset: usize) -> Result<(), BackendError> {
        self.memory.write(tensor_addr(tensor, offset)?, data)
    }

    fn get_tensor(&self, tensor: &Tensor, data: &mut [u8], offset: usize) -> Result<(), BackendError> {
        self.memory.read(tensor_addr(tensor, offset)?, data)
    }

    fn cpy_tensor(&self, src: &Tensor, dst: &Tensor) -> Result<bool, BackendError> {
        // Device to device within the same buffer type
        let same_type = match (src.buffer(), dst.buffer()) {
            (Some(s), Some(d)) => s.buffer_type() == d.buffer_type(),
            _ => false,
        };
        if !same_type {
            return Ok(false);
        }
        let mut data = vec![0u8; src.nbytes()];
        buffer::tensor_get(src, &mut data, 0)?;
        self.memory.write(tensor_addr(dst, 0)?, &data)?;
        Ok(true)
    }

    fn clear(&self, value: u8) -> Result<(), BackendError> {
        self.memory.fill(value)
    }
}

/// Dummy accelerator
pub struct DummyBackend {
    name: String,
    buft: BufferType,
    supported_ops: Vec<String>,
    offload_ops: Vec<String>,
    events: bool,
    queue: Arc<Queue>,
    stats: Arc<DummyStats>,
}

impl DummyBackend {
    #[must_use]
    pub fn new(config: &DummyConfig) -> DummyBackend {
        let name = if config.name.is_empty() { "Dummy".to_string() } else { config.name.clone() };
        let buft = BufferType::new(DummyBufferType { name: name.clone(), memory: config.memory });
        DummyBackend::with_buffer_type(config, buft)
    }

    /// Dummy backend computing into memory of another buffer type
    #[must_use]
    pub fn with_buffer_type(config: &DummyConfig, buft: BufferType) -> DummyBackend {
        DummyBackend {
            name: if config.name.is_empty() { "Dummy".to_string() } else { config.name.clone() },
            buft,
            supported_ops: config.supported_ops.iter().map(|op| op.to_uppercase()).collect(),
            offload_ops: config.offload_ops.iter().map(|op| op.to_uppercase()).collect(),
            events: config.events,
            queue: Arc::new(Queue::default()),
            stats: Arc::new(DummyStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &DummyStats {
        &self.stats
    }

    /// Number of tasks submitted but not yet run
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.queue.submitted.load(Ordering::SeqCst) - self.queue.completed.load(Ordering::SeqCst)
    }
}

impl Backend for DummyBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_buffer_type(&self) -> BufferType {
        self.buft.clone()
    }

    fn set_tensor_async(&self, tensor: &Tensor, data: &[u8], offset: usize) -> Result<(), BackendError> {
        self.queue.submit(Task::Write { tensor: tensor.clone(), data: data.to_vec(), offset })
    }

    fn cpy_tensor_async(&self, src_backend: &dyn Backend, src: &Tensor, dst: &Tensor) -> Result<bool, BackendError> {
        let _ = src_backend;
        let on_device = |t: &Tensor| t.buffer().is_some_and(|b| b.buffer_type() == &self.buft);
        if !on_device(src) || !on_device(dst) {
            return Ok(false);
        }
        self.stats.async_copies.fetch_add(1, Ordering::Relaxed);
        self.queue.submit(Task::Copy { src: src.clone(), dst: dst.clone() })?;
        Ok(true)
    }

    fn synchronize(&self) -> Result<(), BackendError> {
        self.stats.synchronizations.fetch_add(1, Ordering::Relaxed);
        self.queue.drain_all(&self.stats)
    }

    fn graph_compute_async(&self, subgraph: Subgraph<'_>) -> Result<(), BackendError> {
        let mut nodes = Vec::with_capacity(subgraph.nodes.len());
        for &id in subgraph.nodes {
            let (node, srcs) = subgraph.node(id);
            if node.op().is_view() {
                continue;
            }
            if !self.supports_op(subgraph.graph, id) {
                return Err(BackendError::new(
                    ErrorStatus::UnsupportedOp,
                    format!("{} does not support {}", self.name, node.op().name()),
                ));
            }
            nodes.push((node.clone(), srcs.into_iter().cloned().collect()));
        }
        self.queue.submit(Task::Compute(nodes))
    }

    fn supports_op(&self, graph: &Graph, op: TensorId) -> bool {
        let op = graph.tensor(op).op();
        op.is_view()
            || op == crate::tensor::Op::None
            || self.supported_ops.is_empty()
            || self.supported_ops.iter().any(|name| name == op.name())
    }

    fn supports_buft(&self, buft: &BufferType) -> bool {
        buft == &self.buft
    }

    fn offload_op(&self, graph: &Graph, op: TensorId) -> bool {
        let name = graph.tensor(op).op().name();
        self.offload_ops.iter().any(|o| o == name)
    }

    fn event_new(&self) -> Option<Box<dyn Event>> {
        if !self.events {
            return None;
        }
        Some(Box::new(DummyEvent {
            queue: self.queue.clone(),
            stats: self.stats.clone(),
            mark: AtomicU64::new(0),
        }))
    }

    fn event_wait(&self, event: &dyn Event) -> Result<(), BackendError> {
        self.stats.event_waits.fetch_add(1, Ordering::Relaxed);
        match event.as_any().downcast_ref::<DummyEvent>() {
            // In order queue, later work already runs after the marked work
            Some(e) if Arc::ptr_eq(&e.queue, &self.queue) => Ok(()),
            _ => event.synchronize(),
        }
    }
}

struct DummyEvent {
    queue: Arc<Queue>,
    stats: Arc<DummyStats>,
    mark: AtomicU64,
}

impl Event for DummyEvent {
    fn record(&self) -> Result<(), BackendError> {
        self.stats.event_records.fetch_add(1, Ordering::Relaxed);
        self.mark.store(self.queue.submitted.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    fn synchronize(&self) -> Result<(), BackendError> {
        self.queue.drain(self.mark.load(Ordering::SeqCst), &self.stats)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registers dummy backend if enabled in config
pub fn register(registry: &mut BackendRegistry, config: &DummyConfig) -> Result<(), BackendError> {
    if !config.enabled {
        return Err(BackendError::new(ErrorStatus::Initialization, "Configured out."));
    }
    let backend = Arc::new(DummyBackend::new(config));
    let buft = backend.default_buffer_type();
    let name = backend.name().to_string();
    let config = config.clone();
    registry.register(
        &name,
        Box::new(move |params: &str| {
            // The first instance shares the registered buffer type
            if params.is_empty() {
                return Ok(backend.clone() as Arc<dyn Backend>);
            }
            let mut config = config.clone();
            config.name = params.to_string();
            Ok(Arc::new(DummyBackend::new(&config)) as Arc<dyn Backend>)
        }),
        buft,
    );
    Ok(())
}
