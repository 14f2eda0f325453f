//! Graph allocation and computation of splits.

use super::Scheduler;
use crate::{
    allocator::AllocPlan,
    backend::Subgraph,
    buffer::{self, BufferType},
    error::SchedError,
    graph::Graph,
};

/// Did any tensor move to a backend with different memory since the last scheduling?
fn backend_ids_changed(bufts: &[BufferType], current: &[usize], prev: &[usize]) -> bool {
    current.iter().enumerate().any(|(i, &b)| match prev.get(i) {
        Some(&p) => p != b && bufts[p] != bufts[b],
        None => true,
    })
}

impl Scheduler {
    pub(super) fn alloc_splits(&mut self, graph: &mut Graph) -> Result<(), SchedError> {
        let changed = backend_ids_changed(&self.bufts, self.ids.nodes(), self.ids.prev_nodes())
            || backend_ids_changed(&self.bufts, self.ids.leafs(), self.ids.prev_leafs());
        let plan = AllocPlan {
            nodes: &self.flat_nodes,
            node_backend_ids: self.ids.nodes(),
            leafs: &self.flat_leafs,
            leaf_backend_ids: self.ids.leafs(),
        };
        if changed || !self.galloc.alloc_graph(graph, &plan) {
            // Backends may still be using the buffers
            for backend in &self.backends {
                backend.synchronize()?;
            }
            if self.debug.alloc() {
                println!("Failed to allocate graph, reserving (backend ids changed = {changed})");
            }
            self.galloc.reserve(graph, &plan);
            if !self.galloc.alloc_graph(graph, &plan) {
                if self.debug.alloc() {
                    println!("Failed to allocate graph");
                }
                return Err(SchedError::AllocationFailed);
            }
        }
        Ok(())
    }

    pub(super) fn compute_splits(&mut self, graph: &Graph) -> Result<(), SchedError> {
        let Scheduler { backends, table, splits, events, eval_callback, cur_copy, n_copies, debug, .. } = self;
        let cur_copy_slot = *cur_copy;

        for (split_id, split) in splits.iter().enumerate() {
            let split_backend = &backends[split.backend_id];
            let event = events[split.backend_id][cur_copy_slot].as_deref();
            if debug.compute() {
                println!(
                    "Computing split #{split_id} on {} with {} inputs, nodes {:?}",
                    split_backend.name(),
                    split.inputs.len(),
                    split.nodes()
                );
            }

            for &input in &split.inputs {
                let Some(input_backend_id) = table.backend_id(input) else {
                    panic!("split input {input} has no backend");
                };
                let input_backend = &backends[input_backend_id];
                let input_cpy = table
                    .copy(input, split.backend_id, cur_copy_slot)
                    .unwrap_or_else(|| panic!("split input {input} has no copy"));
                let (src, dst) = (graph.tensor(input), graph.tensor(input_cpy));

                if src.is_input() {
                    // User wrote this tensor, only the previous use of the copy slot must finish
                    match event {
                        Some(e) => e.synchronize()?,
                        None => split_backend.synchronize()?,
                    }
                    buffer::tensor_copy(src, dst)?;
                } else {
                    match event {
                        Some(e) => {
                            if debug.events() {
                                println!("{} waits for its event of copy {cur_copy_slot}", split_backend.name());
                            }
                            split_backend.event_wait(e)?;
                        }
                        None => split_backend.synchronize()?,
                    }
                    if !split_backend.cpy_tensor_async(input_backend.as_ref(), src, dst)? {
                        input_backend.synchronize()?;
                        match event {
                            Some(e) => e.synchronize()?,
                            None => split_backend.synchronize()?,
                        }
                        buffer::tensor_copy(src, dst)?;
                    }
                }
            }

            let nodes = &graph.nodes()[split.nodes()];
            match eval_callback {
                None => split_backend.graph_compute_async(Subgraph { graph, nodes })?,
                Some(callback) => {
                    // Compute up to and including each node the callback wants to observe
                    let mut j0 = 0;
                    while j0 < nodes.len() {
                        let mut j1 = j0;
                        let mut need = callback(graph, nodes[j0], true);
                        while !need && j1 + 1 < nodes.len() {
                            j1 += 1;
                            need = callback(graph, nodes[j1], true);
                        }
                        split_backend.graph_compute_async(Subgraph { graph, nodes: &nodes[j0..=j1] })?;
                        split_backend.synchronize()?;
                        if need && !callback(graph, nodes[j1], false) {
                            break;
                        }
                        j0 = j1 + 1;
                    }
                }
            }

            if !split.inputs.is_empty() {
                if let Some(e) = event {
                    if debug.events() {
                        println!("{} records its event of copy {cur_copy_slot}", split_backend.name());
                    }
                    e.record()?;
                }
            }
        }

        *cur_copy = (cur_copy_slot + 1) % *n_copies;
        Ok(())
    }
}

#[test]
fn moved_within_same_memory_is_not_a_change() {
    use crate::{buffer::BufferTypeInterface, error::BackendError};
    struct Mem;
    impl BufferTypeInterface for Mem {
        fn name(&self) -> &str {
            "mem"
        }
        fn alloc_buffer(&self, _: usize) -> Result<Box<dyn crate::buffer::BufferInterface>, BackendError> {
            unreachable!()
        }
        fn alignment(&self) -> usize {
            1
        }
    }
    let a = BufferType::new(Mem);
    let b = BufferType::new(Mem);
    let bufts = [a.clone(), a, b];
    assert!(!backend_ids_changed(&bufts, &[0, 1], &[1, 0]));
    assert!(backend_ids_changed(&bufts, &[0, 2], &[0, 1]));
    assert!(backend_ids_changed(&bufts, &[0, 1, 1], &[0, 1]));
    assert!(!backend_ids_changed(&bufts, &[], &[]));
}
