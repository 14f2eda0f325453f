//! Registry of available backends.

use crate::{
    backend::Backend,
    buffer::{Buffer, BufferType},
    config::DebugMask,
    error::{BackendError, ErrorStatus, SchedError},
};
use std::sync::Arc;

/// Maximum number of registered backends
pub const MAX_REGISTERED_BACKENDS: usize = 64;

/// Creates backend from parameter string
pub type BackendInitFn = Box<dyn Fn(&str) -> Result<Arc<dyn Backend>, BackendError> + Send + Sync>;

struct Entry {
    name: String,
    init_fn: BackendInitFn,
    buft: BufferType,
}

/// Named backend constructors with their default buffer types
#[derive(Default)]
pub struct BackendRegistry {
    entries: Vec<Entry>,
    debug: DebugMask,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> BackendRegistry {
        BackendRegistry { entries: Vec::new(), debug: DebugMask::from_env() }
    }

    pub fn register(&mut self, name: &str, init_fn: BackendInitFn, buft: BufferType) {
        assert!(
            self.entries.len() < MAX_REGISTERED_BACKENDS,
            "too many registered backends, maximum is {MAX_REGISTERED_BACKENDS}"
        );
        if self.debug.registry() {
            println!("Registered backend {name} at index {}, default buffer type {}", self.entries.len(), buft.name());
        }
        self.entries.push(Entry { name: name.into(), init_fn, buft });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn name(&self, index: usize) -> &str {
        &self.entries[index].name
    }

    /// Index of backend registered under `name`
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// Initializes backend at `index` with `params`
    pub fn init_backend(&self, index: usize, params: &str) -> Result<Arc<dyn Backend>, SchedError> {
        let entry = self.entries.get(index).ok_or_else(|| {
            SchedError::BackendError(BackendError::new(
                ErrorStatus::Initialization,
                format!("no backend registered at index {index}"),
            ))
        })?;
        if self.debug.registry() {
            println!("Initializing backend {} with params {params:?}", entry.name);
        }
        Ok((entry.init_fn)(params)?)
    }

    /// Initializes backend from `"name"` or `"name:params"`
    pub fn init_backend_from_str(&self, desc: &str) -> Result<Arc<dyn Backend>, SchedError> {
        let (name, params) = desc.split_once(':').unwrap_or((desc, ""));
        let index = self
            .find_by_name(name)
            .ok_or_else(|| SchedError::parse_error(format!("backend {name:?} is not registered")))?;
        self.init_backend(index, params)
    }

    #[must_use]
    pub fn default_buffer_type(&self, index: usize) -> BufferType {
        self.entries[index].buft.clone()
    }

    /// Allocates buffer of backend's default buffer type
    pub fn alloc_buffer(&self, index: usize, size: usize) -> Result<Buffer, SchedError> {
        Ok(self.default_buffer_type(index).alloc_buffer(size)?)
    }
}
