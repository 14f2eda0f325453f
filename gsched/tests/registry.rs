use gsched::{
    backend::dummy::{self, DummyConfig},
    host::host_buffer_type,
    BackendRegistry, Config, ErrorStatus, SchedError, Scheduler, DEFAULT_GRAPH_SIZE, MAX_COPIES,
};
use std::sync::Arc;

#[test]
fn config_from_json() -> Result<(), SchedError> {
    let config = Config::from_json(
        r#"{
            "n_copies": 2,
            "debug": 5,
            "cpu": { "n_threads": 3 },
            "dummy": { "enabled": true, "name": "NPU", "supported_ops": ["mul_mat"], "events": true }
        }"#,
    )?;
    assert_eq!(config.copies(), 2);
    assert_eq!(config.graph_size(), DEFAULT_GRAPH_SIZE);
    assert!(config.debug_mask().sched());
    assert!(!config.debug_mask().alloc());
    assert!(config.debug_mask().compute());
    assert_eq!(config.cpu.n_threads, 3);
    assert!(config.dummy.enabled && config.dummy.events);
    assert_eq!(config.dummy.supported_ops, vec!["mul_mat".to_string()]);
    assert_eq!(config.dummy.memory, 0);
    Ok(())
}

#[test]
fn empty_config_uses_defaults() -> Result<(), SchedError> {
    let config = Config::from_json("{}")?;
    assert_eq!(config.copies(), 1);
    assert_eq!(config.graph_size(), DEFAULT_GRAPH_SIZE);
    assert!(!config.dummy.enabled);
    assert!(matches!(Config::from_json("{\"n_copies\": \"many\"}"), Err(SchedError::ParseError(_))));
    let config = Config::from_json(r#"{ "n_copies": 9 }"#)?;
    assert_eq!(config.copies(), MAX_COPIES);
    let cpu: Arc<dyn gsched::Backend> = Arc::new(gsched_cpu::CpuBackend::new()?);
    let sched = Scheduler::from_config(vec![cpu], &config);
    assert_eq!(sched.n_copies(), MAX_COPIES);
    Ok(())
}

#[test]
fn dummy_registration() -> Result<(), SchedError> {
    let mut registry = BackendRegistry::new();
    let err = dummy::register(&mut registry, &DummyConfig::default()).unwrap_err();
    assert_eq!(err.status, ErrorStatus::Initialization);
    assert!(registry.is_empty());

    dummy::register(&mut registry, &DummyConfig { enabled: true, name: "NPU".into(), ..Default::default() })?;
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.name(0), "NPU");
    assert_eq!(registry.find_by_name("NPU"), Some(0));
    assert_eq!(registry.find_by_name("GPU"), None);

    let first = registry.init_backend(0, "")?;
    let again = registry.init_backend_from_str("NPU")?;
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(first.default_buffer_type(), registry.default_buffer_type(0));

    let other = registry.init_backend_from_str("NPU:npu1")?;
    assert_eq!(other.name(), "npu1");
    assert_ne!(other.default_buffer_type(), registry.default_buffer_type(0));

    assert!(matches!(registry.init_backend_from_str("GPU:0"), Err(SchedError::ParseError(_))));
    assert!(matches!(registry.init_backend(7, ""), Err(SchedError::BackendError(_))));

    let buffer = registry.alloc_buffer(0, 256)?;
    assert_eq!(buffer.size(), 256);
    assert_eq!(buffer.buffer_type(), &registry.default_buffer_type(0));
    Ok(())
}

#[test]
fn registered_backends_build_scheduler() -> Result<(), SchedError> {
    let config = Config::from_json(r#"{ "n_copies": 2, "dummy": { "enabled": true, "events": true } }"#)?;
    let mut registry = BackendRegistry::new();
    dummy::register(&mut registry, &config.dummy)?;
    gsched_cpu::register(&mut registry, &config);
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.default_buffer_type(1), host_buffer_type());

    let backends = (0..registry.len()).map(|i| registry.init_backend(i, "")).collect::<Result<Vec<_>, _>>()?;
    let sched = Scheduler::from_config(backends, &config);
    assert_eq!(sched.n_backends(), 2);
    assert_eq!(sched.n_copies(), 2);
    assert_eq!(sched.backend(0).name(), "Dummy");
    assert_eq!(sched.backend_id(sched.backend(1)), Some(1));
    Ok(())
}
