//! Buffer types, buffers and tensor data access.
//!
//! Buffer type is a class of memory (host memory, memory of one device).
//! Buffer is one allocation of a buffer type. Both are cheap to clone handles
//! and compare by identity.

use crate::{
    error::{BackendError, ErrorStatus},
    tensor::Tensor,
};
use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

/// Implemented by each class of memory
pub trait BufferTypeInterface: Send + Sync {
    /// Name of this buffer type
    fn name(&self) -> &str;
    /// Allocate buffer with at least `size` usable bytes
    fn alloc_buffer(&self, size: usize) -> Result<Box<dyn BufferInterface>, BackendError>;
    /// Alignment of tensor addresses in bytes
    fn alignment(&self) -> usize;
    /// Largest buffer that can be allocated
    fn max_size(&self) -> usize {
        usize::MAX
    }
    /// Bytes needed to store tensor, may be padded
    fn alloc_size(&self, tensor: &Tensor) -> usize {
        tensor.nbytes()
    }
    /// Can the host access this memory directly?
    fn is_host(&self) -> bool {
        false
    }
}

/// Implemented by each allocation. Addresses are offsets into the allocation.
pub trait BufferInterface: Send + Sync {
    /// Name of the buffer
    fn name(&self) -> &str;
    /// Address of the first usable byte
    fn base(&self) -> usize;
    /// Called when tensor is placed into this buffer
    fn init_tensor(&self, tensor: &Tensor) {
        let _ = tensor;
    }
    /// Write `data` into tensor starting at byte `offset`
    fn set_tensor(&self, tensor: &Tensor, data: &[u8], offset: usize) -> Result<(), BackendError>;
    /// Read tensor bytes starting at byte `offset` into `data`
    fn get_tensor(&self, tensor: &Tensor, data: &mut [u8], offset: usize) -> Result<(), BackendError>;
    /// Copy from `src` (possibly in another buffer) into `dst` in this buffer.
    /// Returns false if this buffer can not do the copy directly.
    fn cpy_tensor(&self, src: &Tensor, dst: &Tensor) -> Result<bool, BackendError> {
        let _ = (src, dst);
        Ok(false)
    }
    /// Fill whole buffer with `value`
    fn clear(&self, value: u8) -> Result<(), BackendError>;
    /// Drop any per tensor state
    fn reset(&self) {}
    /// Child buffers of a composite buffer
    fn children(&self) -> Option<&[Buffer]> {
        None
    }
}

/// Handle to a buffer type
#[derive(Clone)]
pub struct BufferType(Arc<dyn BufferTypeInterface>);

impl BufferType {
    pub fn new(iface: impl BufferTypeInterface + 'static) -> BufferType {
        BufferType(Arc::new(iface))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// Allocates buffer of exactly `size` usable bytes
    pub fn alloc_buffer(&self, size: usize) -> Result<Buffer, BackendError> {
        if size > self.max_size() {
            return Err(BackendError::new(
                ErrorStatus::MemoryAllocation,
                format!("{size} bytes is over maximum buffer size {} of {}", self.max_size(), self.name()),
            ));
        }
        let iface = self.0.alloc_buffer(size)?;
        Ok(Buffer::new(self.clone(), iface, size))
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.0.alignment()
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.0.max_size()
    }

    #[must_use]
    pub fn alloc_size(&self, tensor: &Tensor) -> usize {
        let size = self.0.alloc_size(tensor);
        assert!(size >= tensor.nbytes(), "alloc_size of {} is smaller than tensor", self.name());
        size
    }

    #[must_use]
    pub fn is_host(&self) -> bool {
        self.0.is_host()
    }
}

impl PartialEq for BufferType {
    fn eq(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.0).cast::<()>() == Arc::as_ptr(&other.0).cast::<()>()
    }
}

impl Eq for BufferType {}

impl Debug for BufferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("BufferType({})", self.name()))
    }
}

/// How tensors in buffer are used, weights pull their consumers onto their backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    /// Activations, scratch and anything else
    Any,
    /// Model parameters
    Weights,
}

struct BufferInner {
    iface: Box<dyn BufferInterface>,
    buft: BufferType,
    size: usize,
    usage: AtomicU8,
}

/// Handle to an allocation
#[derive(Clone)]
pub struct Buffer(Arc<BufferInner>);

impl Buffer {
    /// Wraps allocation made by a buffer type
    pub fn new(buft: BufferType, iface: Box<dyn BufferInterface>, size: usize) -> Buffer {
        Buffer(Arc::new(BufferInner { iface, buft, size, usage: AtomicU8::new(0) }))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.0.iface.name()
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.0.iface.base()
    }

    /// Number of usable bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.0.size
    }

    #[must_use]
    pub fn buffer_type(&self) -> &BufferType {
        &self.0.buft
    }

    #[must_use]
    pub fn is_host(&self) -> bool {
        self.0.buft.is_host()
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.0.buft.alignment()
    }

    #[must_use]
    pub fn alloc_size(&self, tensor: &Tensor) -> usize {
        self.0.buft.alloc_size(tensor)
    }

    pub fn clear(&self, value: u8) -> Result<(), BackendError> {
        self.0.iface.clear(value)
    }

    pub fn reset(&self) {
        self.0.iface.reset();
    }

    /// Sets usage of this buffer and of all its children
    pub fn set_usage(&self, usage: BufferUsage) {
        let value = match usage {
            BufferUsage::Any => 0,
            BufferUsage::Weights => 1,
        };
        self.0.usage.store(value, Ordering::Relaxed);
        if let Some(children) = self.0.iface.children() {
            for child in children {
                child.set_usage(usage);
            }
        }
    }

    #[must_use]
    pub fn usage(&self) -> BufferUsage {
        match self.0.usage.load(Ordering::Relaxed) {
            0 => BufferUsage::Any,
            _ => BufferUsage::Weights,
        }
    }

    #[must_use]
    pub fn is_weights(&self) -> bool {
        self.usage() == BufferUsage::Weights
    }

    #[must_use]
    pub fn is_composite(&self) -> bool {
        self.0.iface.children().is_some()
    }

    pub(crate) fn iface(&self) -> &dyn BufferInterface {
        self.0.iface.as_ref()
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Buffer {}

impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Buffer({}, {} B, {:?})", self.name(), self.size(), self.usage()))
    }
}

/// Group of buffers acting as one for usage and clearing
struct CompositeBuffer {
    name: String,
    buffers: Vec<Buffer>,
}

impl BufferInterface for CompositeBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    fn base(&self) -> usize {
        0
    }

    fn set_tensor(&self, tensor: &Tensor, data: &[u8], offset: usize) -> Result<(), BackendError> {
        let _ = (tensor, data, offset);
        Err(BackendError::new(ErrorStatus::MemoryCopy, "composite buffer has no storage of its own"))
    }

    fn get_tensor(&self, tensor: &Tensor, data: &mut [u8], offset: usize) -> Result<(), BackendError> {
        let _ = (tensor, data, offset);
        Err(BackendError::new(ErrorStatus::MemoryCopy, "composite buffer has no storage of its own"))
    }

    fn clear(&self, value: u8) -> Result<(), BackendError> {
        for buffer in &self.buffers {
            buffer.clear(value)?;
        }
        Ok(())
    }

    fn children(&self) -> Option<&[Buffer]> {
        Some(&self.buffers)
    }
}

/// Creates composite buffer. Size is the sum of children sizes and buffer type is the type of the first child.
#[must_use]
pub fn composite_buffer(buffers: Vec<Buffer>) -> Buffer {
    assert!(!buffers.is_empty(), "composite buffer needs at least one child");
    let buft = buffers[0].buffer_type().clone();
    let size = buffers.iter().map(Buffer::size).sum();
    let name = format!("{}+{}", buffers[0].name(), buffers.len() - 1);
    Buffer::new(buft, Box::new(CompositeBuffer { name, buffers }), size)
}

fn storage(tensor: &Tensor) -> Result<(&Buffer, usize), BackendError> {
    match (tensor.buffer(), tensor.data()) {
        (Some(buffer), Some(addr)) => Ok((buffer, addr)),
        _ => Err(BackendError::new(
            ErrorStatus::NotAllocated,
            format!("tensor {:?} is not allocated", tensor.name()),
        )),
    }
}

fn check_range(tensor: &Tensor, offset: usize, len: usize) -> Result<(), BackendError> {
    if offset + len > tensor.nbytes() {
        return Err(BackendError::new(
            ErrorStatus::OutOfBounds,
            format!("{len} bytes at offset {offset} in tensor {:?} of {} bytes", tensor.name(), tensor.nbytes()),
        ));
    }
    Ok(())
}

/// Writes bytes into tensor
pub fn tensor_set(tensor: &Tensor, data: &[u8], offset: usize) -> Result<(), BackendError> {
    let (buffer, _) = storage(tensor)?;
    check_range(tensor, offset, data.len())?;
    if data.is_empty() {
        return Ok(());
    }
    buffer.iface().set_tensor(tensor, data, offset)
}

/// Reads bytes from tensor
pub fn tensor_get(tensor: &Tensor, data: &mut [u8], offset: usize) -> Result<(), BackendError> {
    let (buffer, _) = storage(tensor)?;
    check_range(tensor, offset, data.len())?;
    if data.is_empty() {
        return Ok(());
    }
    buffer.iface().get_tensor(tensor, data, offset)
}

/// Copies contents of `src` into `dst`, the two must have the same layout
pub fn tensor_copy(src: &Tensor, dst: &Tensor) -> Result<(), BackendError> {
    assert!(src.same_layout(dst), "cannot copy {:?} into {:?} with different layout", src.name(), dst.name());
    let (src_buffer, src_addr) = storage(src)?;
    let (dst_buffer, dst_addr) = storage(dst)?;
    if src_buffer == dst_buffer && src_addr == dst_addr {
        return Ok(());
    }
    if !src_buffer.is_host() && !dst_buffer.is_host() && dst_buffer.iface().cpy_tensor(src, dst)? {
        return Ok(());
    }
    // Through host memory
    let mut data = vec![0u8; src.nbytes()];
    src_buffer.iface().get_tensor(src, &mut data, 0)?;
    dst_buffer.iface().set_tensor(dst, &data, 0)
}

/// Places tensor at address `addr` of `buffer`
pub fn tensor_alloc(buffer: &Buffer, tensor: &mut Tensor, addr: usize) {
    assert!(tensor.buffer.is_none(), "tensor {:?} is already allocated", tensor.name());
    assert!(tensor.view_src.is_none(), "view {:?} must be initialized with view_init", tensor.name());
    assert!(
        addr >= buffer.base() && addr + buffer.alloc_size(tensor) <= buffer.base() + buffer.size(),
        "tensor {:?} does not fit into buffer {} at address {addr}",
        tensor.name(),
        buffer.name()
    );
    tensor.buffer = Some(buffer.clone());
    tensor.data = Some(addr);
    buffer.iface().init_tensor(tensor);
}

/// Binds view to the memory of its view source
pub fn view_init(tensor: &mut Tensor, view_src: &Tensor) {
    assert!(tensor.buffer.is_none(), "view {:?} is already initialized", tensor.name());
    let (Some(buffer), Some(addr)) = (view_src.buffer(), view_src.data()) else {
        panic!("view source of {:?} is not allocated", tensor.name());
    };
    assert!(
        tensor.view_offs + tensor.nbytes() <= view_src.nbytes(),
        "view {:?} reaches outside of its source",
        tensor.name()
    );
    tensor.buffer = Some(buffer.clone());
    tensor.data = Some(addr + tensor.view_offs);
    buffer.iface().init_tensor(tensor);
}
