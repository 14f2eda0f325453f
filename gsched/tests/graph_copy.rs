use gsched::{
    backend::dummy::{DummyBackend, DummyConfig},
    compare_graph_backend, graph_copy,
    interpreter::read_f32,
    Backend, DType, ErrorStatus, Graph, SchedError,
};
use gsched_cpu::CpuBackend;

fn graph_on(backend: &dyn Backend) -> Result<(Graph, gsched::Buffer), SchedError> {
    let mut graph = Graph::new();
    let x = graph.new_tensor(DType::F32, &[3, 2]);
    let w = graph.new_tensor(DType::F32, &[3, 3]);
    graph.set_name(x, "x");
    graph.set_input(x);
    let t = graph.transpose(x);
    let c = graph.cont(t);
    let r = graph.reshape(c, &[3, 2]);
    let mm = graph.mul_mat(w, r);
    let s = graph.scale(mm, 0.5);
    let out = graph.sub(s, x);
    graph.build_forward(out);
    let mut ids = graph.leafs().to_vec();
    ids.extend_from_slice(graph.nodes());
    let buffer = graph.alloc_tensors(&ids, &backend.default_buffer_type())?;
    graph.set_f32(x, &[1.0, -2.0, 3.0, 0.5, 4.0, -1.0])?;
    graph.set_f32(w, &[1.0, 0.0, 2.0, -1.0, 1.0, 0.0, 0.0, 3.0, 1.0])?;
    Ok((graph, buffer))
}

#[test]
fn copy_keeps_structure_and_data() -> Result<(), SchedError> {
    let dummy = DummyBackend::new(&DummyConfig::default());
    let cpu = CpuBackend::new()?;
    let (graph, _buffer) = graph_on(&dummy)?;
    let copy = graph_copy(&cpu, &graph)?;

    assert_eq!(copy.graph.n_nodes(), graph.n_nodes());
    assert_eq!(copy.graph.n_leafs(), graph.n_leafs());
    assert!(copy.buffer.is_host());
    for (&a, &b) in graph.nodes().iter().zip(copy.graph.nodes()) {
        assert_eq!(copy.get(a), Some(b));
        let (ta, tb) = (graph.tensor(a), copy.graph.tensor(b));
        assert_eq!(ta.op(), tb.op());
        assert!(ta.same_layout(tb));
        assert_eq!(ta.view_src().map(|v| copy.get(v)), tb.view_src().map(Some));
    }
    let x = *graph.leafs().iter().find(|&&l| graph.tensor(l).is_input()).unwrap();
    let x_copy = copy.get(x).unwrap();
    assert_eq!(copy.graph.tensor(x_copy).name(), "x");
    assert!(copy.graph.tensor(x_copy).is_input());
    assert_eq!(copy.graph.get_f32(x_copy)?, graph.get_f32(x)?);
    Ok(())
}

#[test]
fn backends_agree_node_by_node() -> Result<(), SchedError> {
    let dummy = DummyBackend::new(&DummyConfig::default());
    let cpu = CpuBackend::new()?;
    let (graph, _buffer) = graph_on(&dummy)?;
    let mut compared = Vec::new();
    compare_graph_backend(&dummy, &cpu, &graph, |i, t1, t2| {
        let (a, b) = (read_f32(t1).unwrap(), read_f32(t2).unwrap());
        assert_eq!(a, b, "node {i} ({}) differs", t1.op().name());
        compared.push(i);
        true
    })?;
    // Views are skipped
    let views = graph.nodes().iter().filter(|&&n| graph.tensor(n).op().is_view()).count();
    assert_eq!(compared.len(), graph.n_nodes() - views);
    Ok(())
}

#[test]
fn comparison_stops_when_asked() -> Result<(), SchedError> {
    let dummy = DummyBackend::new(&DummyConfig::default());
    let cpu = CpuBackend::new()?;
    let (graph, _buffer) = graph_on(&cpu)?;
    let mut calls = 0;
    compare_graph_backend(&cpu, &dummy, &graph, |_, _, _| {
        calls += 1;
        false
    })?;
    assert_eq!(calls, 1);
    Ok(())
}

#[test]
fn unallocated_graph_cannot_be_copied() {
    let cpu = CpuBackend::new().unwrap();
    let mut graph = Graph::new();
    let x = graph.new_tensor(DType::F32, &[2]);
    let y = graph.relu(x);
    graph.build_forward(y);
    assert!(matches!(graph_copy(&cpu, &graph), Err(SchedError::NotAllocated(_))));
}

#[test]
fn unsupported_op_is_reported() -> Result<(), SchedError> {
    let dummy = DummyBackend::new(&DummyConfig { supported_ops: vec!["ADD".into()], ..Default::default() });
    let (graph, _buffer) = graph_on(&dummy)?;
    let mm = graph.nodes().iter().copied().find(|&n| graph.tensor(n).op().name() == "MUL_MAT").unwrap();
    match dummy.graph_compute(gsched::Subgraph { graph: &graph, nodes: &[mm] }) {
        Err(e) => assert_eq!(e.status, ErrorStatus::UnsupportedOp),
        Ok(()) => panic!("dummy computed unsupported op"),
    }
    Ok(())
}
