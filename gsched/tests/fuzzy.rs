use gsched::{
    backend::dummy::{DummyBackend, DummyConfig},
    Backend, Buffer, BufferUsage, DType, Graph, SchedError, Scheduler, TensorId,
};
use gsched_cpu::CpuBackend;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::sync::Arc;

const OPS: [&str; 7] = ["ADD", "SUB", "MUL", "RELU", "NEG", "SCALE", "MUL_MAT"];

struct Random {
    graph: Graph,
    inputs: Vec<TensorId>,
    out: TensorId,
    _weights: Buffer,
}

/// Random graph of `[4, 4]` tensors with inputs on the host and weights in `backend` memory
fn random_graph(seed: u64, backend: &dyn Backend) -> Result<Random, SchedError> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut graph = Graph::new();
    let inputs: Vec<TensorId> = (0..2)
        .map(|_| {
            let x = graph.new_tensor(DType::F32, &[4, 4]);
            graph.set_input(x);
            x
        })
        .collect();
    let w = graph.new_tensor(DType::F32, &[4, 4]);
    let mut pool = inputs.clone();
    pool.push(w);
    for _ in 0..rng.gen_range(3..16) {
        let x = pool[rng.gen_range(0..pool.len())];
        let y = pool[rng.gen_range(0..pool.len())];
        let z = match rng.gen_range(0..8) {
            0 => graph.add(x, y),
            1 => graph.sub(x, y),
            2 => graph.mul(x, y),
            3 => graph.relu(x),
            4 => graph.neg(x),
            5 => graph.scale(x, 0.5),
            6 => graph.mul_mat(x, y),
            _ => {
                let t = graph.transpose(x);
                graph.cont(t)
            }
        };
        pool.push(z);
    }
    let last = pool[pool.len() - 1];
    let a = graph.add(last, inputs[0]);
    let out = graph.add(a, inputs[1]);
    graph.set_output(out);
    graph.build_forward(out);

    let weights = graph.alloc_tensors(&[w], &backend.default_buffer_type())?;
    weights.set_usage(BufferUsage::Weights);
    let values: Vec<f32> = (0..16).map(|i| (i % 5) as f32 * 0.25 - 0.5).collect();
    graph.set_f32(w, &values)?;
    Ok(Random { graph, inputs, out, _weights: weights })
}

fn set_inputs(r: &Random, seed: u64) -> Result<(), SchedError> {
    let mut rng = SmallRng::seed_from_u64(seed ^ 0xff);
    for &x in &r.inputs {
        let values: Vec<f32> = (0..16).map(|_| rng.gen_range(-2.0..2.0)).collect();
        r.graph.set_f32(x, &values)?;
    }
    Ok(())
}

fn check_splits(sched: &Scheduler, graph: &Graph) {
    let splits = sched.splits();
    assert!(!splits.is_empty());
    assert_eq!(splits[0].start, 0);
    assert_eq!(splits[splits.len() - 1].end, graph.n_nodes());
    for pair in splits.windows(2) {
        assert_eq!(pair[0].end, pair[1].start);
    }
    for split in splits {
        assert!(split.start < split.end);
        for &node in &graph.nodes()[split.nodes()] {
            let b = sched.tensor_backend_id(node).unwrap();
            assert!(sched.backend(b).supports_op(graph, node));
            if !graph.tensor(node).op().is_view() {
                assert_eq!(b, split.backend_id);
            }
        }
        for &input in &split.inputs {
            assert_ne!(sched.tensor_backend_id(input), Some(split.backend_id));
        }
    }
    for &leaf in graph.leafs() {
        assert!(sched.tensor_backend_id(leaf).is_some());
    }
}

#[test]
fn random_graphs_match_cpu() -> Result<(), SchedError> {
    let cpu = Arc::new(CpuBackend::new()?);
    for seed in 0..40 {
        let mut rng = SmallRng::seed_from_u64(seed);
        let supported: Vec<String> = OPS.iter().filter(|_| rng.gen_bool(0.5)).map(|op| op.to_string()).collect();
        let acc = Arc::new(DummyBackend::new(&DummyConfig {
            name: "ACC".into(),
            supported_ops: if supported.is_empty() { vec!["MUL_MAT".into()] } else { supported },
            events: rng.gen_bool(0.5),
            ..Default::default()
        }));
        let n_copies = rng.gen_range(1..=3);

        let mut expected = random_graph(seed, cpu.as_ref())?;
        let mut reference = Scheduler::new(vec![cpu.clone()], None, 64, 1);
        reference.alloc_graph(&mut expected.graph)?;
        assert_eq!(reference.n_splits(), 1);
        set_inputs(&expected, seed)?;
        reference.graph_compute(&mut expected.graph)?;
        let expected = expected.graph.get_f32(expected.out)?;

        let mut r = random_graph(seed, acc.as_ref())?;
        let mut sched = Scheduler::new(vec![acc.clone(), cpu.clone()], None, 64, n_copies);
        sched.alloc_graph(&mut r.graph)?;
        check_splits(&sched, &r.graph);
        let splits = sched.splits().to_vec();
        set_inputs(&r, seed)?;
        sched.graph_compute(&mut r.graph)?;
        let result = r.graph.get_f32(r.out)?;

        for (a, b) in expected.iter().zip(&result) {
            let close = (a - b).abs() <= 1e-4 * a.abs().max(1.0);
            assert!(close || a == b || (a.is_nan() && b.is_nan()), "seed {seed}: {expected:?} != {result:?}");
        }

        // Same graph schedules the same way
        sched.reset();
        sched.alloc_graph(&mut r.graph)?;
        assert_eq!(sched.splits(), splits.as_slice());
    }
    Ok(())
}
