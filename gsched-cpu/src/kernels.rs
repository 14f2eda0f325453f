use gsched::{
    interpreter::{self, binary_op, broadcast_index, mul_mat_element, read_f32, unary_op, write_f32},
    BackendError, Op, Tensor,
};
use rayon::prelude::*;

fn unary(x: &[f32], op: Op) -> Vec<f32> {
    x.par_iter().map(|&a| unary_op(op, a)).collect()
}

fn binary(x: &Tensor, y: &Tensor, op: Op) -> Result<Vec<f32>, BackendError> {
    let (xd, yd) = (read_f32(x)?, read_f32(y)?);
    if x.shape() == y.shape() {
        return Ok(xd.par_iter().zip(yd.par_iter()).map(|(&a, &b)| binary_op(op, a, b)).collect());
    }
    let (x_ne, y_ne) = (x.shape(), y.shape());
    Ok((0..xd.len()).into_par_iter().map(|i| binary_op(op, xd[i], yd[broadcast_index(&x_ne, &y_ne, i)])).collect())
}

fn mul_mat(x: &Tensor, y: &Tensor, n: usize) -> Result<Vec<f32>, BackendError> {
    let (xd, yd) = (read_f32(x)?, read_f32(y)?);
    let (x_ne, y_ne) = (x.shape(), y.shape());
    let m = x_ne[1];
    let mut out = vec![0.0; n];
    // One row of the result per task
    out.par_chunks_mut(m).enumerate().for_each(|(row, chunk)| {
        for (im, value) in chunk.iter_mut().enumerate() {
            *value = mul_mat_element(&xd, &x_ne, &yd, &y_ne, row * m + im);
        }
    });
    Ok(out)
}

pub(crate) fn compute_node(node: &Tensor, srcs: &[&Tensor]) -> Result<(), BackendError> {
    match (node.op(), srcs) {
        (op @ (Op::Scale(_) | Op::Neg | Op::Relu | Op::Sqr), [x, ..]) => write_f32(node, &unary(&read_f32(x)?, op)),
        (op @ (Op::Add | Op::Sub | Op::Mul | Op::Div), [x, y, ..]) => write_f32(node, &binary(x, y, op)?),
        (Op::MulMat, [x, y, ..]) => write_f32(node, &mul_mat(x, y, node.nelements())?),
        _ => interpreter::compute_node(node, srcs),
    }
}
