//! Compute graph. Owns all tensors, nodes are kept in topological order.
//!
//! While a graph is being scheduled, the scheduler appends scratch tensors (copies
//! of split inputs and dependency views), rewrites node sources to point at those copies
//! and binds tensors to memory. All of that is undone by [`Graph::restore`].

use crate::{
    buffer::{self, Buffer, BufferType},
    dtype::DType,
    error::SchedError,
    tensor::{Op, Tensor, TensorFlags, TensorId, MAX_DIMS, MAX_SRC},
};

/// Compute graph
#[derive(Debug, Default)]
pub struct Graph {
    tensors: Vec<Tensor>,
    nodes: Vec<TensorId>,
    leafs: Vec<TensorId>,
    visited: Vec<bool>,
    // First scratch tensor, if the graph is being scheduled
    scratch: Option<usize>,
    // (node, slot, original source)
    rewrites: Vec<(TensorId, usize, TensorId)>,
    // Tensors bound to memory by graph allocation
    transient: Vec<TensorId>,
}

impl Graph {
    #[must_use]
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Number of tensors in the arena
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    #[must_use]
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[usize::from(id)]
    }

    pub(crate) fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[usize::from(id)]
    }

    /// Computed tensors in topological order
    #[must_use]
    pub fn nodes(&self) -> &[TensorId] {
        &self.nodes
    }

    /// Tensors without op
    #[must_use]
    pub fn leafs(&self) -> &[TensorId] {
        &self.leafs
    }

    #[must_use]
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn n_leafs(&self) -> usize {
        self.leafs.len()
    }

    fn push(&mut self, tensor: Tensor) -> TensorId {
        assert!(
            self.scratch.is_none(),
            "graph is being scheduled, call restore before adding tensors"
        );
        self.push_tensor(tensor)
    }

    pub(crate) fn push_tensor(&mut self, tensor: Tensor) -> TensorId {
        let id = TensorId::from(self.tensors.len());
        self.tensors.push(tensor);
        self.visited.push(false);
        id
    }

    /// New leaf tensor with contiguous layout
    pub fn new_tensor(&mut self, dtype: DType, shape: &[usize]) -> TensorId {
        self.push(Tensor::new(dtype, shape))
    }

    fn new_op(&mut self, op: Op, dtype: DType, ne: [usize; MAX_DIMS], srcs: &[TensorId]) -> TensorId {
        let mut tensor = Tensor::new(dtype, &ne);
        tensor.op = op;
        for (slot, &src) in srcs.iter().enumerate() {
            tensor.src[slot] = Some(src);
        }
        self.push(tensor)
    }

    fn unary(&mut self, op: Op, x: TensorId) -> TensorId {
        let t = self.tensor(x);
        let (dtype, ne) = (t.dtype, t.ne);
        self.new_op(op, dtype, ne, &[x])
    }

    fn binary(&mut self, op: Op, x: TensorId, y: TensorId) -> TensorId {
        let (tx, ty) = (self.tensor(x), self.tensor(y));
        assert!(
            tx.ne.iter().zip(&ty.ne).all(|(&a, &b)| b != 0 && a % b == 0),
            "{} can not broadcast {:?} to {:?}",
            op.name(),
            ty.ne,
            tx.ne
        );
        let (dtype, ne) = (tx.dtype, tx.ne);
        self.new_op(op, dtype, ne, &[x, y])
    }

    pub fn add(&mut self, x: TensorId, y: TensorId) -> TensorId {
        self.binary(Op::Add, x, y)
    }

    pub fn sub(&mut self, x: TensorId, y: TensorId) -> TensorId {
        self.binary(Op::Sub, x, y)
    }

    pub fn mul(&mut self, x: TensorId, y: TensorId) -> TensorId {
        self.binary(Op::Mul, x, y)
    }

    pub fn div(&mut self, x: TensorId, y: TensorId) -> TensorId {
        self.binary(Op::Div, x, y)
    }

    pub fn scale(&mut self, x: TensorId, value: f32) -> TensorId {
        self.unary(Op::Scale(value), x)
    }

    pub fn neg(&mut self, x: TensorId) -> TensorId {
        self.unary(Op::Neg, x)
    }

    pub fn relu(&mut self, x: TensorId) -> TensorId {
        self.unary(Op::Relu, x)
    }

    pub fn sqr(&mut self, x: TensorId) -> TensorId {
        self.unary(Op::Sqr, x)
    }

    pub fn dup(&mut self, x: TensorId) -> TensorId {
        self.unary(Op::Dup, x)
    }

    pub fn cont(&mut self, x: TensorId) -> TensorId {
        self.unary(Op::Cont, x)
    }

    /// Sum of all elements into tensor with one element
    pub fn sum(&mut self, x: TensorId) -> TensorId {
        let dtype = self.tensor(x).dtype;
        self.new_op(Op::Sum, dtype, [1; MAX_DIMS], &[x])
    }

    /// `x` is `[k, m, ..]`, `y` is `[k, n, ..]`, result is `[m, n, ..]` in f32
    pub fn mul_mat(&mut self, x: TensorId, y: TensorId) -> TensorId {
        let (tx, ty) = (self.tensor(x), self.tensor(y));
        assert_eq!(tx.ne[0], ty.ne[0], "mul_mat inner dimensions do not match");
        assert!(
            ty.ne[2] % tx.ne[2] == 0 && ty.ne[3] % tx.ne[3] == 0,
            "mul_mat can not broadcast {:?} to {:?}",
            tx.ne,
            ty.ne
        );
        let ne = [tx.ne[1], ty.ne[1], ty.ne[2], ty.ne[3]];
        self.new_op(Op::MulMat, DType::F32, ne, &[x, y])
    }

    fn new_view(&mut self, op: Op, x: TensorId, ne: [usize; MAX_DIMS], nb: [usize; MAX_DIMS], offset: usize) -> TensorId {
        let view = view_of(self.tensor(x), x, op, ne, nb, offset);
        self.push(view)
    }

    /// Contiguous view of `shape` starting at byte `offset` of `x`
    pub fn view(&mut self, x: TensorId, shape: &[usize], offset: usize) -> TensorId {
        let t = self.tensor(x);
        assert!(t.is_contiguous(), "view of non contiguous tensor");
        let layout = Tensor::new(t.dtype, shape);
        assert!(offset + layout.nbytes() <= t.nbytes(), "view is out of bounds of its source");
        self.new_view(Op::View, x, layout.ne, layout.nb, offset)
    }

    pub fn reshape(&mut self, x: TensorId, shape: &[usize]) -> TensorId {
        let t = self.tensor(x);
        assert!(t.is_contiguous(), "reshape of non contiguous tensor");
        let layout = Tensor::new(t.dtype, shape);
        assert_eq!(layout.nelements(), t.nelements(), "reshape changes number of elements");
        self.new_view(Op::Reshape, x, layout.ne, layout.nb, 0)
    }

    /// Axis `i` of `x` becomes axis `axes[i]` of result
    pub fn permute(&mut self, x: TensorId, axes: [usize; MAX_DIMS]) -> TensorId {
        let mut seen = [false; MAX_DIMS];
        for &a in &axes {
            assert!(a < MAX_DIMS && !seen[a], "invalid permutation {axes:?}");
            seen[a] = true;
        }
        let t = self.tensor(x);
        let (mut ne, mut nb) = ([0; MAX_DIMS], [0; MAX_DIMS]);
        for i in 0..MAX_DIMS {
            ne[axes[i]] = t.ne[i];
            nb[axes[i]] = t.nb[i];
        }
        self.new_view(Op::Permute, x, ne, nb, 0)
    }

    pub fn transpose(&mut self, x: TensorId) -> TensorId {
        let t = self.tensor(x);
        let (mut ne, mut nb) = (t.ne, t.nb);
        ne.swap(0, 1);
        nb.swap(0, 1);
        self.new_view(Op::Transpose, x, ne, nb, 0)
    }

    pub fn set_name(&mut self, x: TensorId, name: impl Into<String>) {
        self.tensor_mut(x).name = name.into();
    }

    /// Marks tensor as written by the user before compute
    pub fn set_input(&mut self, x: TensorId) {
        self.tensor_mut(x).flags.insert(TensorFlags::INPUT);
    }

    /// Marks tensor as read by the user after compute
    pub fn set_output(&mut self, x: TensorId) {
        self.tensor_mut(x).flags.insert(TensorFlags::OUTPUT);
    }

    /// Adds `x` and everything it depends on to the graph
    pub fn build_forward(&mut self, x: TensorId) {
        // Iterative post order traversal
        let mut stack = vec![(x, false)];
        while let Some((id, expanded)) = stack.pop() {
            let i = usize::from(id);
            if expanded {
                let t = &self.tensors[i];
                if t.op == Op::None && t.src.iter().all(Option::is_none) {
                    self.leafs.push(id);
                } else {
                    self.nodes.push(id);
                }
                continue;
            }
            if self.visited[i] {
                continue;
            }
            self.visited[i] = true;
            stack.push((id, true));
            for src in self.tensors[i].src.iter().rev().flatten() {
                if !self.visited[usize::from(*src)] {
                    stack.push((*src, false));
                }
            }
            if let Some(view_src) = self.tensors[i].view_src {
                if !self.visited[usize::from(view_src)] {
                    stack.push((view_src, false));
                }
            }
        }
    }

    /// Binds tensor to `addr` in `buffer`, views are bound to their source's memory
    pub fn alloc_tensor(&mut self, x: TensorId, buffer: &Buffer, addr: usize) {
        let tensor = &mut self.tensors[usize::from(x)];
        buffer::tensor_alloc(buffer, tensor, addr);
    }

    /// Binds view to the memory of its view source
    pub fn init_view(&mut self, x: TensorId) {
        let view_src = self.tensor(x).view_src.expect("tensor is not a view");
        let src = self.tensor(view_src).clone();
        buffer::view_init(self.tensor_mut(x), &src);
    }

    /// Allocates one buffer of `buft` for all given tensors and places them into it.
    /// Views among them are initialized after their sources.
    pub fn alloc_tensors(&mut self, ids: &[TensorId], buft: &BufferType) -> Result<Buffer, SchedError> {
        let align = buft.alignment();
        let mut size = 0;
        let mut offsets = Vec::with_capacity(ids.len());
        for &id in ids {
            let t = self.tensor(id);
            if t.view_src.is_some() || t.is_allocated() {
                offsets.push(None);
                continue;
            }
            offsets.push(Some(size));
            size += align_up(buft.alloc_size(t), align);
        }
        let buffer = buft.alloc_buffer(size.max(align))?;
        let base = buffer.base();
        for (&id, offset) in ids.iter().zip(offsets) {
            if let Some(offset) = offset {
                self.alloc_tensor(id, &buffer, base + offset);
            }
        }
        let mut views: Vec<TensorId> = ids.iter().copied().filter(|&id| self.tensor(id).view_src.is_some()).collect();
        views.sort();
        for id in views {
            if self.tensor(id).buffer.is_none() {
                self.init_view(id);
            }
        }
        Ok(buffer)
    }

    fn check_range(&self, x: TensorId, offset: usize, len: usize) -> Result<(), SchedError> {
        let t = self.tensor(x);
        if offset + len > t.nbytes() {
            return Err(SchedError::OutOfBounds(
                format!("{len} bytes at offset {offset} in tensor {x} of {} bytes", t.nbytes()).into(),
            ));
        }
        Ok(())
    }

    /// Writes raw bytes into tensor memory
    pub fn set_tensor(&self, x: TensorId, data: &[u8], offset: usize) -> Result<(), SchedError> {
        self.check_range(x, offset, data.len())?;
        Ok(buffer::tensor_set(self.tensor(x), data, offset)?)
    }

    /// Reads raw bytes from tensor memory
    pub fn get_tensor(&self, x: TensorId, data: &mut [u8], offset: usize) -> Result<(), SchedError> {
        self.check_range(x, offset, data.len())?;
        Ok(buffer::tensor_get(self.tensor(x), data, offset)?)
    }

    /// Writes values converted to tensor's dtype. Tensor must be contiguous.
    pub fn set_f32(&self, x: TensorId, values: &[f32]) -> Result<(), SchedError> {
        let t = self.tensor(x);
        if values.len() != t.nelements() {
            return Err(SchedError::OutOfBounds(
                format!("{} values for tensor {x} with {} elements", values.len(), t.nelements()).into(),
            ));
        }
        Ok(crate::interpreter::write_f32(t, values)?)
    }

    /// Reads all elements converted to f32
    pub fn get_f32(&self, x: TensorId) -> Result<Vec<f32>, SchedError> {
        Ok(crate::interpreter::read_f32(self.tensor(x))?)
    }

    pub(crate) fn push_node(&mut self, x: TensorId) {
        self.nodes.push(x);
    }

    pub(crate) fn push_leaf(&mut self, x: TensorId) {
        self.leafs.push(x);
    }

    /// Appends scheduling scratch tensor
    pub(crate) fn push_scratch(&mut self, tensor: Tensor) -> TensorId {
        if self.scratch.is_none() {
            self.scratch = Some(self.tensors.len());
        }
        self.push_tensor(tensor)
    }

    /// Scratch tensor with the same layout as `x`
    pub(crate) fn dup_scratch(&mut self, x: TensorId, name: String) -> TensorId {
        let tensor = self.tensor(x).dup_layout(name);
        self.push_scratch(tensor)
    }

    /// Scratch view of `x` that keeps `x` alive until the view is consumed
    pub(crate) fn dependency_scratch(&mut self, x: TensorId) -> TensorId {
        let t = self.tensor(x);
        let mut view = view_of(t, x, Op::View, t.ne, t.nb, 0);
        view.name = format!("{} (view)", t.name);
        self.push_scratch(view)
    }

    /// Points source `slot` of `node` at `src`, remembering the original
    pub(crate) fn rewrite_src(&mut self, node: TensorId, slot: usize, src: TensorId) {
        debug_assert!(slot < MAX_SRC);
        let t = self.tensor_mut(node);
        let original = t.src[slot].expect("rewritten slot must hold a source");
        t.src[slot] = Some(src);
        self.rewrites.push((node, slot, original));
    }

    /// Binds tensor as part of graph allocation
    pub(crate) fn bind_transient(&mut self, x: TensorId, buffer: &Buffer, addr: usize) {
        self.alloc_tensor(x, buffer, addr);
        self.transient.push(x);
    }

    /// Initializes view as part of graph allocation
    pub(crate) fn init_view_transient(&mut self, x: TensorId) {
        self.init_view(x);
        self.transient.push(x);
    }

    /// Removes everything added while scheduling: scratch tensors, source rewrites
    /// and bindings made by graph allocation.
    pub fn restore(&mut self) {
        for (node, slot, original) in self.rewrites.drain(..).rev() {
            self.tensors[usize::from(node)].src[slot] = Some(original);
        }
        for x in self.transient.drain(..) {
            if let Some(t) = self.tensors.get_mut(usize::from(x)) {
                t.buffer = None;
                t.data = None;
            }
        }
        if let Some(start) = self.scratch.take() {
            self.tensors.truncate(start);
            self.visited.truncate(start);
        }
    }
}

fn view_of(t: &Tensor, x: TensorId, op: Op, ne: [usize; MAX_DIMS], nb: [usize; MAX_DIMS], offset: usize) -> Tensor {
    let mut view = Tensor::new(t.dtype, &ne);
    view.op = op;
    view.nb = nb;
    view.src[0] = Some(x);
    match t.view_src {
        Some(root) => {
            view.view_src = Some(root);
            view.view_offs = t.view_offs + offset;
        }
        None => {
            view.view_src = Some(x);
            view.view_offs = offset;
        }
    }
    if let (Some(buffer), Some(addr)) = (&t.buffer, t.data) {
        view.buffer = Some(buffer.clone());
        view.data = Some(addr + offset);
    }
    view
}

pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

