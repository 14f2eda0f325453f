use gsched::{
    backend::dummy::{DummyBackend, DummyConfig},
    composite_buffer,
    host::{host_buffer_type, HOST_ALIGNMENT},
    tensor_copy, Backend, BufferUsage, DType, ErrorStatus, Graph, SchedError,
};

#[test]
fn host_buffer_type_is_shared() {
    let (a, b) = (host_buffer_type(), host_buffer_type());
    assert_eq!(a, b);
    assert!(a.is_host());
    assert_eq!(a.alignment(), HOST_ALIGNMENT);
    let dummy = DummyBackend::new(&DummyConfig::default());
    assert_ne!(dummy.default_buffer_type(), a);
    assert!(!dummy.default_buffer_type().is_host());
}

#[test]
fn tensors_are_placed_aligned() -> Result<(), SchedError> {
    let mut graph = Graph::new();
    let x = graph.new_tensor(DType::F32, &[3]);
    let y = graph.new_tensor(DType::F16, &[5]);
    let buffer = graph.alloc_tensors(&[x, y], &host_buffer_type())?;
    assert_eq!(buffer.size(), 2 * HOST_ALIGNMENT);
    let (ax, ay) = (graph.tensor(x).data().unwrap(), graph.tensor(y).data().unwrap());
    assert_eq!(ax % HOST_ALIGNMENT, buffer.base() % HOST_ALIGNMENT);
    assert_eq!(ay - ax, HOST_ALIGNMENT);
    assert_eq!(graph.tensor(y).buffer(), Some(&buffer));
    Ok(())
}

#[test]
fn tensors_fill_buffer_from_its_base() -> Result<(), SchedError> {
    // Odd sized allocations in between shift where host buffers start
    let mut noise = Vec::new();
    for i in 0..200 {
        noise.push(vec![0u8; 1 + i % 61]);
        let mut graph = Graph::new();
        let x = graph.new_tensor(DType::F32, &[8]);
        let y = graph.new_tensor(DType::F32, &[3]);
        let buffer = graph.alloc_tensors(&[x, y], &host_buffer_type())?;
        assert_eq!(graph.tensor(x).data(), Some(buffer.base()));
        assert_eq!(graph.tensor(y).data(), Some(buffer.base() + HOST_ALIGNMENT));
        graph.set_f32(y, &[1.0, 2.0, 3.0])?;
        assert_eq!(graph.get_f32(y)?, vec![1.0, 2.0, 3.0]);
    }
    Ok(())
}

#[test]
fn f16_values_round_trip_through_memory() -> Result<(), SchedError> {
    let mut graph = Graph::new();
    let x = graph.new_tensor(DType::F16, &[4]);
    let _buffer = graph.alloc_tensors(&[x], &host_buffer_type())?;
    graph.set_f32(x, &[0.5, -2.0, 1024.0, 0.0])?;
    assert_eq!(graph.get_f32(x)?, vec![0.5, -2.0, 1024.0, 0.0]);
    let mut raw = [0u8; 2];
    graph.get_tensor(x, &mut raw, 2)?;
    assert_eq!(raw, half::f16::from_f32(-2.0).to_le_bytes());
    Ok(())
}

#[test]
fn out_of_bounds_access_is_rejected() -> Result<(), SchedError> {
    let mut graph = Graph::new();
    let x = graph.new_tensor(DType::I32, &[2]);
    let unallocated = graph.new_tensor(DType::I32, &[2]);
    let _buffer = graph.alloc_tensors(&[x], &host_buffer_type())?;
    graph.set_tensor(x, &7i32.to_le_bytes(), 4)?;
    assert!(matches!(graph.set_tensor(x, &[0; 4], 5), Err(SchedError::OutOfBounds(_))));
    assert!(matches!(graph.set_f32(x, &[1.0]), Err(SchedError::OutOfBounds(_))));
    let mut data = [0u8; 9];
    assert!(matches!(graph.get_tensor(x, &mut data, 0), Err(SchedError::OutOfBounds(_))));
    match graph.get_f32(unallocated) {
        Err(SchedError::BackendError(e)) => assert_eq!(e.status, ErrorStatus::NotAllocated),
        other => panic!("expected not allocated error, got {other:?}"),
    }
    assert_eq!(graph.get_f32(x)?, vec![0.0, 7.0]);
    Ok(())
}

#[test]
fn views_read_strided_memory() -> Result<(), SchedError> {
    let mut graph = Graph::new();
    let x = graph.new_tensor(DType::F32, &[3, 2]);
    let t = graph.transpose(x);
    let v = graph.view(x, &[2], 4 * 3);
    let r = graph.reshape(x, &[6]);
    let p = graph.permute(x, [1, 0, 2, 3]);
    let _buffer = graph.alloc_tensors(&[x, t, v, r, p], &host_buffer_type())?;
    graph.set_f32(x, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;

    assert_eq!(graph.tensor(t).shape(), [2, 3, 1, 1]);
    assert!(!graph.tensor(t).is_contiguous());
    assert_eq!(graph.get_f32(t)?, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    assert_eq!(graph.get_f32(p)?, graph.get_f32(t)?);
    assert_eq!(graph.get_f32(v)?, vec![4.0, 5.0]);
    assert_eq!(graph.get_f32(r)?, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(graph.tensor(v).view_src(), Some(x));
    Ok(())
}

#[test]
fn copies_between_host_and_device() -> Result<(), SchedError> {
    let dummy = DummyBackend::new(&DummyConfig::default());
    let mut graph = Graph::new();
    let x = graph.new_tensor(DType::F32, &[4]);
    let y = graph.new_tensor(DType::F32, &[4]);
    let z = graph.new_tensor(DType::F32, &[4]);
    let _host = graph.alloc_tensors(&[x], &host_buffer_type())?;
    let _device = graph.alloc_tensors(&[y, z], &dummy.default_buffer_type())?;
    graph.set_f32(x, &[1.0, 2.0, 3.0, 4.0])?;

    tensor_copy(graph.tensor(x), graph.tensor(y))?;
    tensor_copy(graph.tensor(y), graph.tensor(z))?;
    assert_eq!(graph.get_f32(z)?, vec![1.0, 2.0, 3.0, 4.0]);
    // Copy onto itself
    tensor_copy(graph.tensor(z), graph.tensor(z))?;
    assert_eq!(graph.get_f32(z)?, vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn asynchronous_writes_run_on_synchronize() -> Result<(), SchedError> {
    let dummy = DummyBackend::new(&DummyConfig::default());
    let mut graph = Graph::new();
    let x = graph.new_tensor(DType::F32, &[2]);
    let _buffer = graph.alloc_tensors(&[x], &dummy.default_buffer_type())?;
    let data: Vec<u8> = [3.0f32, 4.0].iter().flat_map(|v| v.to_le_bytes()).collect();
    dummy.set_tensor_async(graph.tensor(x), &data, 0)?;
    assert_eq!(dummy.pending(), 1);
    assert_eq!(graph.get_f32(x)?, vec![0.0, 0.0]);
    dummy.synchronize()?;
    assert_eq!(dummy.pending(), 0);
    assert_eq!(graph.get_f32(x)?, vec![3.0, 4.0]);

    let mut out = vec![0u8; 8];
    dummy.get_tensor_async(graph.tensor(x), &mut out, 0)?;
    assert_eq!(out, data);
    Ok(())
}

#[test]
fn composite_buffer_spreads_usage_and_clear() -> Result<(), SchedError> {
    let dummy = DummyBackend::new(&DummyConfig::default());
    let mut graph = Graph::new();
    let x = graph.new_tensor(DType::F32, &[2]);
    let y = graph.new_tensor(DType::F32, &[2]);
    let a = graph.alloc_tensors(&[x], &host_buffer_type())?;
    let b = graph.alloc_tensors(&[y], &dummy.default_buffer_type())?;
    let composite = composite_buffer(vec![a.clone(), b.clone()]);
    assert!(composite.is_composite());
    assert!(!a.is_composite());
    assert_eq!(composite.size(), a.size() + b.size());
    assert_eq!(composite.buffer_type(), a.buffer_type());

    composite.set_usage(BufferUsage::Weights);
    assert!(a.is_weights() && b.is_weights() && composite.is_weights());
    assert!(graph.tensor(x).is_weights());

    composite.clear(0)?;
    graph.set_f32(x, &[1.0, 1.0])?;
    composite.clear(0)?;
    assert_eq!(graph.get_f32(x)?, vec![0.0, 0.0]);

    composite.set_usage(BufferUsage::Any);
    assert_eq!(b.usage(), BufferUsage::Any);
    Ok(())
}

#[test]
fn oversized_allocation_fails() {
    let dummy = DummyBackend::new(&DummyConfig { memory: 100, ..Default::default() });
    let buft = dummy.default_buffer_type();
    assert_eq!(buft.max_size(), 100);
    assert!(buft.alloc_buffer(64).is_ok());
    let err = buft.alloc_buffer(101).unwrap_err();
    assert_eq!(err.status, ErrorStatus::MemoryAllocation);
}
