//! Host cpu backend for gsched.
//!
//! Computes directly in host memory using a rayon thread pool.
//! It supports every op, so it is used as the fallback backend.
//! ```rust
//! use std::sync::Arc;
//! let cpu = Arc::new(gsched_cpu::CpuBackend::new()?);
//! let sched = gsched::Scheduler::new(vec![cpu], None, gsched::DEFAULT_GRAPH_SIZE, 1);
//! assert_eq!(sched.n_backends(), 1);
//! # Ok::<(), gsched::BackendError>(())
//! ```

#![forbid(unsafe_code)]
#![forbid(rustdoc::broken_intra_doc_links)]
#![forbid(rustdoc::private_intra_doc_links)]
#![forbid(rustdoc::invalid_rust_codeblocks)]
#![forbid(rustdoc::bare_urls)]

mod kernels;

use gsched::{
    host::host_buffer_type, Backend, BackendError, BackendRegistry, BufferType, Config, CpuConfig, ErrorStatus,
    Graph, Subgraph, TensorId,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

/// Returns true to stop computation between nodes
pub type AbortCallback = Box<dyn Fn() -> bool + Send + Sync>;

/// Host cpu backend
pub struct CpuBackend {
    pool: Mutex<Arc<rayon::ThreadPool>>,
    n_threads: AtomicUsize,
    abort_callback: Mutex<Option<AbortCallback>>,
}

fn build_pool(n_threads: usize) -> Result<rayon::ThreadPool, BackendError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .thread_name(|i| format!("gsched-cpu-{i}"))
        .build()
        .map_err(|e| BackendError::new(ErrorStatus::Initialization, format!("failed to start cpu threads, {e}")))
}

impl CpuBackend {
    /// Cpu backend with one thread per core
    pub fn new() -> Result<CpuBackend, BackendError> {
        CpuBackend::with_config(&CpuConfig::default())
    }

    pub fn with_config(config: &CpuConfig) -> Result<CpuBackend, BackendError> {
        let pool = build_pool(config.n_threads)?;
        Ok(CpuBackend {
            n_threads: AtomicUsize::new(pool.current_num_threads()),
            pool: Mutex::new(Arc::new(pool)),
            abort_callback: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn n_threads(&self) -> usize {
        self.n_threads.load(Ordering::Relaxed)
    }

    /// Restarts the thread pool with `n_threads` threads, 0 means one per core
    pub fn set_n_threads(&self, n_threads: usize) -> Result<(), BackendError> {
        let pool = build_pool(n_threads)?;
        self.n_threads.store(pool.current_num_threads(), Ordering::Relaxed);
        *self.pool.lock().map_err(|_| poisoned())? = Arc::new(pool);
        Ok(())
    }

    pub fn set_abort_callback(&self, callback: Option<AbortCallback>) -> Result<(), BackendError> {
        *self.abort_callback.lock().map_err(|_| poisoned())? = callback;
        Ok(())
    }

    fn aborted(&self) -> Result<bool, BackendError> {
        Ok(self.abort_callback.lock().map_err(|_| poisoned())?.as_ref().is_some_and(|abort| abort()))
    }
}

fn poisoned() -> BackendError {
    BackendError::new(ErrorStatus::Compute, "cpu backend lock is poisoned")
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "CPU"
    }

    fn default_buffer_type(&self) -> BufferType {
        host_buffer_type()
    }

    fn graph_compute_async(&self, subgraph: Subgraph<'_>) -> Result<(), BackendError> {
        let pool = self.pool.lock().map_err(|_| poisoned())?.clone();
        for &id in subgraph.nodes {
            if self.aborted()? {
                return Err(BackendError::new(ErrorStatus::Aborted, format!("computation aborted before node {id}")));
            }
            let (node, srcs) = subgraph.node(id);
            pool.install(|| kernels::compute_node(node, &srcs))?;
        }
        Ok(())
    }

    fn supports_op(&self, graph: &Graph, op: TensorId) -> bool {
        let _ = (graph, op);
        true
    }

    fn supports_buft(&self, buft: &BufferType) -> bool {
        buft.is_host()
    }

    fn is_fallback(&self) -> bool {
        true
    }
}

/// Registers cpu backend under name "CPU". Parameters are the number of threads.
pub fn register(registry: &mut BackendRegistry, config: &Config) {
    let config = config.cpu.clone();
    registry.register(
        "CPU",
        Box::new(move |params: &str| {
            let mut config = config.clone();
            if !params.is_empty() {
                config.n_threads = params.parse().map_err(|e| {
                    BackendError::new(ErrorStatus::Initialization, format!("invalid cpu thread count {params:?}, {e}"))
                })?;
            }
            Ok(Arc::new(CpuBackend::with_config(&config)?) as Arc<dyn Backend>)
        }),
        host_buffer_type(),
    );
}
