//! Tensor metadata. Tensors are owned by [Graph](crate::Graph) and referenced by [TensorId].

use crate::{buffer::Buffer, dtype::DType};
use std::fmt::Display;

/// Maximum number of dimensions
pub const MAX_DIMS: usize = 4;
/// Maximum number of sources of one op
pub const MAX_SRC: usize = 10;

/// Index of a tensor in its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(u32);

impl From<usize> for TensorId {
    fn from(value: usize) -> Self {
        TensorId(u32::try_from(value).unwrap())
    }
}

impl From<TensorId> for usize {
    fn from(value: TensorId) -> Self {
        value.0 as usize
    }
}

impl Display for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

/// Operation producing a tensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Leaf, no computation
    None,
    /// Contiguous copy with the same shape
    Dup,
    /// Makes strided source contiguous
    Cont,
    /// Elementwise addition, second source is broadcasted
    Add,
    /// Elementwise subtraction, second source is broadcasted
    Sub,
    /// Elementwise multiplication, second source is broadcasted
    Mul,
    /// Elementwise division, second source is broadcasted
    Div,
    /// Multiplication by constant
    Scale(f32),
    /// Negation
    Neg,
    /// Rectified linear unit
    Relu,
    /// Square
    Sqr,
    /// Matrix multiplication, `[k, m] x [k, n] -> [m, n]`
    MulMat,
    /// Sum of all elements
    Sum,
    /// Strided view into source
    View,
    /// View with different shape
    Reshape,
    /// View with permuted axes
    Permute,
    /// View with first two axes swapped
    Transpose,
}

impl Op {
    /// Views share memory with their source and are never computed
    #[must_use]
    pub const fn is_view(&self) -> bool {
        matches!(self, Op::View | Op::Reshape | Op::Permute | Op::Transpose)
    }

    /// Name of the op as used in configs and debug prints
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Op::None => "NONE",
            Op::Dup => "DUP",
            Op::Cont => "CONT",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            Op::Scale(_) => "SCALE",
            Op::Neg => "NEG",
            Op::Relu => "RELU",
            Op::Sqr => "SQR",
            Op::MulMat => "MUL_MAT",
            Op::Sum => "SUM",
            Op::View => "VIEW",
            Op::Reshape => "RESHAPE",
            Op::Permute => "PERMUTE",
            Op::Transpose => "TRANSPOSE",
        }
    }
}

/// Tensor flags bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TensorFlags(u8);

impl TensorFlags {
    /// Tensor is written by the user before compute
    pub const INPUT: TensorFlags = TensorFlags(1);
    /// Tensor is read by the user after compute
    pub const OUTPUT: TensorFlags = TensorFlags(2);

    /// Are all bits of `other` set?
    #[must_use]
    pub const fn contains(&self, other: TensorFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn insert(&mut self, other: TensorFlags) {
        self.0 |= other.0;
    }
}

/// Tensor metadata, dimension 0 is the fastest changing one.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub(crate) name: String,
    pub(crate) op: Op,
    pub(crate) dtype: DType,
    pub(crate) ne: [usize; MAX_DIMS],
    pub(crate) nb: [usize; MAX_DIMS],
    pub(crate) src: [Option<TensorId>; MAX_SRC],
    pub(crate) view_src: Option<TensorId>,
    pub(crate) view_offs: usize,
    pub(crate) buffer: Option<Buffer>,
    pub(crate) data: Option<usize>,
    pub(crate) flags: TensorFlags,
}

impl Tensor {
    pub(crate) fn new(dtype: DType, shape: &[usize]) -> Tensor {
        assert!(
            !shape.is_empty() && shape.len() <= MAX_DIMS,
            "tensor must have between 1 and {MAX_DIMS} dimensions, got {shape:?}"
        );
        let mut ne = [1; MAX_DIMS];
        ne[..shape.len()].copy_from_slice(shape);
        Tensor {
            name: String::new(),
            op: Op::None,
            dtype,
            ne,
            nb: contiguous_strides(dtype, &ne),
            src: [None; MAX_SRC],
            view_src: None,
            view_offs: 0,
            buffer: None,
            data: None,
            flags: TensorFlags::default(),
        }
    }

    /// Tensor with the same dtype, shape and strides, without op, sources or memory
    pub(crate) fn dup_layout(&self, name: String) -> Tensor {
        Tensor {
            name,
            op: Op::None,
            dtype: self.dtype,
            ne: self.ne,
            nb: self.nb,
            src: [None; MAX_SRC],
            view_src: None,
            view_offs: 0,
            buffer: None,
            data: None,
            flags: TensorFlags::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn op(&self) -> Op {
        self.op
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of elements in each dimension
    #[must_use]
    pub fn shape(&self) -> [usize; MAX_DIMS] {
        self.ne
    }

    /// Strides in bytes
    #[must_use]
    pub fn strides(&self) -> [usize; MAX_DIMS] {
        self.nb
    }

    #[must_use]
    pub fn src(&self, i: usize) -> Option<TensorId> {
        self.src[i]
    }

    /// Sources in slot order, skipping empty slots
    pub fn srcs(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.src.iter().flatten().copied()
    }

    #[must_use]
    pub fn view_src(&self) -> Option<TensorId> {
        self.view_src
    }

    #[must_use]
    pub fn view_offs(&self) -> usize {
        self.view_offs
    }

    #[must_use]
    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    /// Address of the first byte inside the buffer
    #[must_use]
    pub fn data(&self) -> Option<usize> {
        self.data
    }

    #[must_use]
    pub fn flags(&self) -> TensorFlags {
        self.flags
    }

    #[must_use]
    pub fn is_input(&self) -> bool {
        self.flags.contains(TensorFlags::INPUT)
    }

    #[must_use]
    pub fn is_output(&self) -> bool {
        self.flags.contains(TensorFlags::OUTPUT)
    }

    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some() && self.data.is_some()
    }

    /// Is this tensor stored in a buffer marked for weights?
    #[must_use]
    pub fn is_weights(&self) -> bool {
        self.buffer.as_ref().is_some_and(Buffer::is_weights)
    }

    #[must_use]
    pub fn nelements(&self) -> usize {
        self.ne.iter().product()
    }

    /// Bytes spanned by this tensor, including gaps between strided elements
    #[must_use]
    pub fn nbytes(&self) -> usize {
        if self.ne.iter().any(|&d| d == 0) {
            return 0;
        }
        self.dtype.byte_size() + self.ne.iter().zip(&self.nb).map(|(&ne, &nb)| (ne - 1) * nb).sum::<usize>()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.nb == contiguous_strides(self.dtype, &self.ne)
    }

    /// Same dtype, shape and strides
    #[must_use]
    pub fn same_layout(&self, other: &Tensor) -> bool {
        self.dtype == other.dtype && self.ne == other.ne && self.nb == other.nb
    }
}

pub(crate) fn contiguous_strides(dtype: DType, ne: &[usize; MAX_DIMS]) -> [usize; MAX_DIMS] {
    let mut nb = [dtype.byte_size(); MAX_DIMS];
    for i in 1..MAX_DIMS {
        nb[i] = nb[i - 1] * ne[i - 1];
    }
    nb
}
