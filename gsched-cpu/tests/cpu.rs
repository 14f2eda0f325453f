use gsched::{
    compare_graph_backend, host::host_buffer_type, interpreter::read_f32, Backend, BackendRegistry, Config, DType,
    ErrorStatus, Graph, SchedError, Scheduler, Subgraph,
};
use gsched_cpu::CpuBackend;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Reference backend computing every node with the plain interpreter
struct Interpreter;

impl Backend for Interpreter {
    fn name(&self) -> &str {
        "Interpreter"
    }

    fn default_buffer_type(&self) -> gsched::BufferType {
        host_buffer_type()
    }

    fn graph_compute_async(&self, subgraph: Subgraph<'_>) -> Result<(), gsched::BackendError> {
        for &id in subgraph.nodes {
            let (node, srcs) = subgraph.node(id);
            gsched::interpreter::compute_node(node, &srcs)?;
        }
        Ok(())
    }

    fn supports_op(&self, _: &Graph, _: gsched::TensorId) -> bool {
        true
    }

    fn supports_buft(&self, buft: &gsched::BufferType) -> bool {
        buft.is_host()
    }
}

fn broadcast_graph() -> Result<(Graph, gsched::Buffer), SchedError> {
    let mut rng = SmallRng::seed_from_u64(7);
    let mut graph = Graph::new();
    let x = graph.new_tensor(DType::F32, &[8, 6, 2]);
    let y = graph.new_tensor(DType::F32, &[8, 1, 2]);
    let w = graph.new_tensor(DType::F32, &[8, 5]);
    let bias = graph.new_tensor(DType::F16, &[5]);
    let a = graph.mul(x, y);
    let b = graph.div(a, y);
    let c = graph.mul_mat(w, b);
    let d = graph.add(c, bias);
    let e = graph.relu(d);
    let f = graph.scale(e, -0.25);
    let g = graph.sqr(f);
    let h = graph.permute(g, [2, 0, 1, 3]);
    let i = graph.cont(h);
    let s = graph.sum(i);
    graph.build_forward(s);
    let mut ids = graph.leafs().to_vec();
    ids.extend_from_slice(graph.nodes());
    let buffer = graph.alloc_tensors(&ids, &host_buffer_type())?;
    for leaf in [x, y, w, bias] {
        let n = graph.tensor(leaf).nelements();
        let values: Vec<f32> = (0..n).map(|_| rng.gen_range(0.5..2.0)).collect();
        graph.set_f32(leaf, &values)?;
    }
    Ok((graph, buffer))
}

#[test]
fn kernels_match_interpreter() -> Result<(), SchedError> {
    let cpu = CpuBackend::new()?;
    let (graph, _buffer) = broadcast_graph()?;
    let mut n = 0;
    compare_graph_backend(&cpu, &Interpreter, &graph, |i, t1, t2| {
        let (a, b) = (read_f32(t1).unwrap(), read_f32(t2).unwrap());
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() <= 1e-5 * x.abs().max(1.0), "node {i} ({}): {a:?} != {b:?}", t1.op().name());
        }
        n += 1;
        true
    })?;
    assert_eq!(n, graph.n_nodes() - 1);
    Ok(())
}

#[test]
fn thread_count_can_change() -> Result<(), SchedError> {
    let cpu = CpuBackend::with_config(&gsched::CpuConfig { n_threads: 2 })?;
    assert_eq!(cpu.n_threads(), 2);
    let (graph, _buffer) = broadcast_graph()?;
    cpu.graph_compute(Subgraph::new(&graph))?;
    let two = graph.get_f32(*graph.nodes().last().unwrap())?;
    cpu.set_n_threads(1)?;
    assert_eq!(cpu.n_threads(), 1);
    cpu.graph_compute(Subgraph::new(&graph))?;
    assert_eq!(graph.get_f32(*graph.nodes().last().unwrap())?, two);
    Ok(())
}

#[test]
fn abort_callback_stops_computation() -> Result<(), SchedError> {
    let cpu = Arc::new(CpuBackend::new()?);
    let checks = Arc::new(AtomicUsize::new(0));
    let counter = checks.clone();
    cpu.set_abort_callback(Some(Box::new(move || counter.fetch_add(1, Ordering::Relaxed) >= 2)))?;

    let mut graph = Graph::new();
    let x = graph.new_tensor(DType::F32, &[4]);
    let a = graph.neg(x);
    let b = graph.neg(a);
    let c = graph.neg(b);
    let d = graph.neg(c);
    graph.build_forward(d);
    let mut sched = Scheduler::new(vec![cpu.clone()], None, 16, 1);
    sched.alloc_graph(&mut graph)?;
    graph.set_f32(x, &[1.0, 2.0, 3.0, 4.0])?;
    match sched.graph_compute(&mut graph) {
        Err(SchedError::BackendError(e)) => assert_eq!(e.status, ErrorStatus::Aborted),
        other => panic!("expected abort, got {other:?}"),
    }
    assert_eq!(checks.load(Ordering::Relaxed), 3);
    assert_eq!(graph.get_f32(b)?, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(graph.get_f32(c)?, vec![0.0; 4]);

    cpu.set_abort_callback(None)?;
    sched.graph_compute(&mut graph)?;
    assert_eq!(graph.get_f32(d)?, vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn registered_with_thread_count() -> Result<(), SchedError> {
    let mut registry = BackendRegistry::new();
    gsched_cpu::register(&mut registry, &Config::default());
    let index = registry.find_by_name("CPU").unwrap();
    let cpu = registry.init_backend_from_str("CPU:3")?;
    assert!(cpu.is_fallback());
    assert!(cpu.supports_buft(&registry.default_buffer_type(index)));
    assert!(matches!(registry.init_backend(index, "three"), Err(SchedError::BackendError(_))));
    Ok(())
}
