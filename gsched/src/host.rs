//! Host memory shared by the cpu buffer type and device emulation.

use crate::{
    buffer::{BufferInterface, BufferType, BufferTypeInterface},
    error::{BackendError, ErrorStatus},
    tensor::Tensor,
};
use std::sync::{Mutex, OnceLock};

/// Alignment of host buffers
pub const HOST_ALIGNMENT: usize = 32;

/// Zero initialized bytes with aligned base address
pub struct HostMemory {
    bytes: Mutex<Vec<u8>>,
    base: usize,
    size: usize,
}

impl HostMemory {
    pub fn new(size: usize, alignment: usize) -> Result<HostMemory, BackendError> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size + alignment).map_err(|e| {
            BackendError::new(ErrorStatus::MemoryAllocation, format!("failed to allocate {size} bytes, {e}"))
        })?;
        bytes.resize(size + alignment, 0);
        let base = bytes.as_ptr().align_offset(alignment).min(alignment);
        Ok(HostMemory { bytes: Mutex::new(bytes), base, size })
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    fn check(&self, addr: usize, len: usize) -> Result<(), BackendError> {
        if addr < self.base || addr + len > self.base + self.size {
            return Err(BackendError::new(
                ErrorStatus::OutOfBounds,
                format!("{len} bytes at {addr} outside of memory [{}, {})", self.base, self.base + self.size),
            ));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<u8>>, BackendError> {
        self.bytes.lock().map_err(|_| BackendError::new(ErrorStatus::MemoryCopy, "host memory lock is poisoned"))
    }

    pub fn write(&self, addr: usize, data: &[u8]) -> Result<(), BackendError> {
        self.check(addr, data.len())?;
        self.lock()?[addr..addr + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, addr: usize, data: &mut [u8]) -> Result<(), BackendError> {
        self.check(addr, data.len())?;
        data.copy_from_slice(&self.lock()?[addr..addr + data.len()]);
        Ok(())
    }

    pub fn fill(&self, value: u8) -> Result<(), BackendError> {
        let base = self.base;
        self.lock()?[base..base + self.size].fill(value);
        Ok(())
    }
}

/// Address of byte `offset` of an allocated tensor
pub fn tensor_addr(tensor: &Tensor, offset: usize) -> Result<usize, BackendError> {
    tensor.data().map(|addr| addr + offset).ok_or_else(|| {
        BackendError::new(ErrorStatus::NotAllocated, format!("tensor {:?} has no address", tensor.name()))
    })
}

struct HostBufferType;

impl BufferTypeInterface for HostBufferType {
    fn name(&self) -> &str {
        "CPU"
    }

    fn alloc_buffer(&self, size: usize) -> Result<Box<dyn BufferInterface>, BackendError> {
        Ok(Box::new(HostBuffer(HostMemory::new(size, HOST_ALIGNMENT)?)))
    }

    fn alignment(&self) -> usize {
        HOST_ALIGNMENT
    }

    fn is_host(&self) -> bool {
        true
    }
}

struct HostBuffer(HostMemory);

impl BufferInterface for HostBuffer {
    fn name(&self) -> &str {
        "CPU"
    }

    fn base(&self) -> usize {
        self.0.base()
    }

    fn set_tensor(&self, tensor: &Tensor, data: &[u8], offset: usize) -> Result<(), BackendError> {
        self.0.write(tensor_addr(tensor, offset)?, data)
    }

    fn get_tensor(&self, tensor: &Tensor, data: &mut [u8], offset: usize) -> Result<(), BackendError> {
        self.0.read(tensor_addr(tensor, offset)?, data)
    }

    fn clear(&self, value: u8) -> Result<(), BackendError> {
        self.0.fill(value)
    }
}

static HOST_BUFFER_TYPE: OnceLock<BufferType> = OnceLock::new();

/// Buffer type of host memory, every call returns the same buffer type
#[must_use]
pub fn host_buffer_type() -> BufferType {
    HOST_BUFFER_TYPE.get_or_init(|| BufferType::new(HostBufferType)).clone()
}
