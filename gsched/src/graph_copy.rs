//! Copying allocated graphs to another backend and comparing backends node by node.

use crate::{
    backend::{Backend, Subgraph},
    buffer::{self, Buffer},
    error::SchedError,
    graph::Graph,
    tensor::{Tensor, TensorId},
};
use std::collections::BTreeMap;

/// Graph duplicated into memory of one backend
pub struct GraphCopy {
    /// The duplicated graph, nodes in the same order as the original
    pub graph: Graph,
    /// Memory of all non view tensors
    pub buffer: Buffer,
    map: BTreeMap<TensorId, TensorId>,
}

impl GraphCopy {
    /// Tensor in the copy corresponding to `id` in the original
    #[must_use]
    pub fn get(&self, id: TensorId) -> Option<TensorId> {
        self.map.get(&id).copied()
    }
}

fn dup_tensor(
    src: &Graph,
    dst: &mut Graph,
    map: &mut BTreeMap<TensorId, TensorId>,
    id: TensorId,
) -> Result<TensorId, SchedError> {
    if let Some(&copy) = map.get(&id) {
        return Ok(copy);
    }
    let t = src.tensor(id);
    if !t.is_allocated() {
        return Err(SchedError::NotAllocated(format!("tensor {id} ({:?}) has no memory", t.name()).into()));
    }
    let mut copy: Tensor = t.dup_layout(t.name().into());
    copy.op = t.op();
    copy.flags = t.flags();
    copy.view_offs = t.view_offs();
    if let Some(view_src) = t.view_src() {
        copy.view_src = Some(dup_tensor(src, dst, map, view_src)?);
    }
    for (slot, s) in t.src.iter().enumerate() {
        if let Some(s) = s {
            copy.src[slot] = Some(dup_tensor(src, dst, map, *s)?);
        }
    }
    let copy_id = dst.push_tensor(copy);
    map.insert(id, copy_id);
    Ok(copy_id)
}

/// Duplicates allocated `graph` into one buffer of `backend`'s default buffer type, including data.
pub fn graph_copy(backend: &dyn Backend, graph: &Graph) -> Result<GraphCopy, SchedError> {
    let mut copy = Graph::new();
    let mut map = BTreeMap::new();
    for &node in graph.nodes() {
        let id = dup_tensor(graph, &mut copy, &mut map, node)?;
        copy.push_node(id);
    }
    for &leaf in graph.leafs() {
        let id = dup_tensor(graph, &mut copy, &mut map, leaf)?;
        copy.push_leaf(id);
    }

    // Views are bound in alloc_tensors after their sources
    let ids: Vec<TensorId> = map.values().copied().collect();
    let buffer = copy.alloc_tensors(&ids, &backend.default_buffer_type())?;

    for (&original, &dup) in &map {
        if graph.tensor(original).view_src().is_none() {
            buffer::tensor_copy(graph.tensor(original), copy.tensor(dup))?;
        }
    }
    Ok(GraphCopy { graph: copy, buffer, map })
}

/// Computes `graph` one node at a time on `backend1` and on a copy of it on `backend2`.
/// After each computed non view node, `callback` gets the node index and both results.
/// Stops early if callback returns false.
pub fn compare_graph_backend(
    backend1: &dyn Backend,
    backend2: &dyn Backend,
    graph: &Graph,
    mut callback: impl FnMut(usize, &Tensor, &Tensor) -> bool,
) -> Result<(), SchedError> {
    let copy = graph_copy(backend2, graph)?;
    let (nodes1, nodes2) = (graph.nodes(), copy.graph.nodes());
    assert_eq!(nodes1.len(), nodes2.len());
    for i in 0..nodes1.len() {
        let (t1, t2) = (graph.tensor(nodes1[i]), copy.graph.tensor(nodes2[i]));
        assert!(t1.op() == t2.op() && t1.same_layout(t2));
        backend1.graph_compute(Subgraph { graph, nodes: &nodes1[i..=i] })?;
        backend2.graph_compute(Subgraph { graph: &copy.graph, nodes: &nodes2[i..=i] })?;
        if t1.op().is_view() {
            continue;
        }
        if !callback(i, t1, t2) {
            break;
        }
    }
    Ok(())
}
