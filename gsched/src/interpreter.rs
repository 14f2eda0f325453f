//! Reference kernels. Every op is evaluated in f32 and converted to the destination dtype.
//!
//! Used by the device emulation and by backends as fallback for ops
//! without a specialized kernel.

use crate::{
    buffer,
    error::{BackendError, ErrorStatus},
    tensor::{Op, Tensor, MAX_DIMS},
};

/// Reads all elements of possibly strided tensor in logical order
pub fn read_f32(t: &Tensor) -> Result<Vec<f32>, BackendError> {
    let mut bytes = vec![0u8; t.nbytes()];
    buffer::tensor_get(t, &mut bytes, 0)?;
    let [ne0, ne1, ne2, ne3] = t.shape();
    let [nb0, nb1, nb2, nb3] = t.strides();
    let dtype = t.dtype();
    let mut values = Vec::with_capacity(t.nelements());
    for i3 in 0..ne3 {
        for i2 in 0..ne2 {
            for i1 in 0..ne1 {
                let row = i3 * nb3 + i2 * nb2 + i1 * nb1;
                for i0 in 0..ne0 {
                    let off = row + i0 * nb0;
                    values.push(dtype.read_f32(&bytes[off..]));
                }
            }
        }
    }
    Ok(values)
}

/// Writes all elements of contiguous tensor
pub fn write_f32(t: &Tensor, values: &[f32]) -> Result<(), BackendError> {
    if !t.is_contiguous() {
        return Err(BackendError::new(
            ErrorStatus::Compute,
            format!("destination {:?} is not contiguous", t.name()),
        ));
    }
    debug_assert_eq!(values.len(), t.nelements());
    let size = t.dtype().byte_size();
    let mut bytes = vec![0u8; values.len() * size];
    for (value, chunk) in values.iter().zip(bytes.chunks_exact_mut(size)) {
        t.dtype().write_f32(*value, chunk);
    }
    buffer::tensor_set(t, &bytes, 0)
}

/// Index into contiguous `y` of shape `y_ne` that is broadcasted to element `i` of shape `x_ne`
#[must_use]
pub fn broadcast_index(x_ne: &[usize; MAX_DIMS], y_ne: &[usize; MAX_DIMS], i: usize) -> usize {
    let i0 = i % x_ne[0];
    let i1 = i / x_ne[0] % x_ne[1];
    let i2 = i / (x_ne[0] * x_ne[1]) % x_ne[2];
    let i3 = i / (x_ne[0] * x_ne[1] * x_ne[2]);
    (i0 % y_ne[0])
        + (i1 % y_ne[1]) * y_ne[0]
        + (i2 % y_ne[2]) * y_ne[0] * y_ne[1]
        + (i3 % y_ne[3]) * y_ne[0] * y_ne[1] * y_ne[2]
}

/// Element `i` of `x * y` where `x` is `[k, m, ..]` and `y` is `[k, n, ..]`, both contiguous
#[must_use]
pub fn mul_mat_element(
    x: &[f32],
    x_ne: &[usize; MAX_DIMS],
    y: &[f32],
    y_ne: &[usize; MAX_DIMS],
    i: usize,
) -> f32 {
    let (k, m, n) = (x_ne[0], x_ne[1], y_ne[1]);
    let im = i % m;
    let i_n = i / m % n;
    let i2 = i / (m * n) % y_ne[2];
    let i3 = i / (m * n * y_ne[2]);
    let x2 = i2 / (y_ne[2] / x_ne[2]);
    let x3 = i3 / (y_ne[3] / x_ne[3]);
    let x_row = ((x3 * x_ne[2] + x2) * m + im) * k;
    let y_row = ((i3 * y_ne[2] + i2) * n + i_n) * k;
    x[x_row..x_row + k].iter().zip(&y[y_row..y_row + k]).map(|(a, b)| a * b).sum()
}

/// Applies elementwise op to one pair of values
#[must_use]
pub fn binary_op(op: Op, a: f32, b: f32) -> f32 {
    match op {
        Op::Add => a + b,
        Op::Sub => a - b,
        Op::Mul => a * b,
        Op::Div => a / b,
        _ => unreachable!("{} is not binary", op.name()),
    }
}

/// Applies unary op to one value
#[must_use]
pub fn unary_op(op: Op, a: f32) -> f32 {
    match op {
        Op::Scale(s) => a * s,
        Op::Neg => -a,
        Op::Relu => a.max(0.0),
        Op::Sqr => a * a,
        Op::Dup | Op::Cont => a,
        _ => unreachable!("{} is not unary", op.name()),
    }
}

fn src<'a>(srcs: &[&'a Tensor], i: usize, node: &Tensor) -> Result<&'a Tensor, BackendError> {
    srcs.get(i).copied().ok_or_else(|| {
        BackendError::new(ErrorStatus::Compute, format!("{} {:?} is missing source {i}", node.op().name(), node.name()))
    })
}

/// Evaluates `node` from its sources, writing result into node's memory
pub fn compute_node(node: &Tensor, srcs: &[&Tensor]) -> Result<(), BackendError> {
    let op = node.op();
    match op {
        Op::None | Op::View | Op::Reshape | Op::Permute | Op::Transpose => Ok(()),
        Op::Dup | Op::Cont | Op::Scale(_) | Op::Neg | Op::Relu | Op::Sqr => {
            let x = read_f32(src(srcs, 0, node)?)?;
            let values: Vec<f32> = x.into_iter().map(|a| unary_op(op, a)).collect();
            write_f32(node, &values)
        }
        Op::Add | Op::Sub | Op::Mul | Op::Div => {
            let (tx, ty) = (src(srcs, 0, node)?, src(srcs, 1, node)?);
            let (x, y) = (read_f32(tx)?, read_f32(ty)?);
            let (x_ne, y_ne) = (tx.shape(), ty.shape());
            let values: Vec<f32> =
                (0..x.len()).map(|i| binary_op(op, x[i], y[broadcast_index(&x_ne, &y_ne, i)])).collect();
            write_f32(node, &values)
        }
        Op::MulMat => {
            let (tx, ty) = (src(srcs, 0, node)?, src(srcs, 1, node)?);
            let (x, y) = (read_f32(tx)?, read_f32(ty)?);
            let (x_ne, y_ne) = (tx.shape(), ty.shape());
            let values: Vec<f32> =
                (0..node.nelements()).map(|i| mul_mat_element(&x, &x_ne, &y, &y_ne, i)).collect();
            write_f32(node, &values)
        }
        Op::Sum => {
            let x = read_f32(src(srcs, 0, node)?)?;
            write_f32(node, &[x.iter().sum()])
        }
    }
}
