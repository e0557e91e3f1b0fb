use spmd_collectives::distributed::{
    CollectiveBackend, Handle, HostValue, NcclModule, ResourceTracker, SimulatedBackend,
    IDENTITY_PROVIDER, NULL_HANDLE,
};
use spmd_collectives::utils::config::{BackendKind, RuntimeConfig};
use spmd_collectives::utils::metrics::CollectiveMetrics;
use spmd_collectives::CommError;
use std::sync::Arc;
use std::thread;

fn int(v: impl TryInto<i64>) -> HostValue {
    HostValue::Int(v.try_into().ok().unwrap())
}

fn addr<T>(buf: &mut [T]) -> HostValue {
    HostValue::Int(buf.as_mut_ptr() as i64)
}

fn handle_of(value: &HostValue) -> Handle {
    match value {
        HostValue::Int(h) => *h as Handle,
        other => panic!("expected a handle, got {:?}", other),
    }
}

/// One module per participant, sharing a process-wide simulated backend.
fn participant(backend: &Arc<SimulatedBackend>, world: i32, rank: i32, id: &[u8]) -> NcclModule {
    let backend: Arc<dyn CollectiveBackend> = backend.clone();
    let module = NcclModule::new(Some(backend), Arc::new(ResourceTracker::new()), None);
    module.register_device_dependent_methods(world, rank, id).unwrap();
    module.register_collective_ops();
    module
}

/// Run `body(rank, module, comm)` for every rank of a freshly joined group.
fn run_world<T, F>(world: i32, body: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(i32, &NcclModule, HostValue) -> T + Send + Sync + 'static,
{
    let backend = Arc::new(SimulatedBackend::new());
    let id = participant(&backend, world, 0, &[]).get_communicator_unique_id().unwrap();
    let body = Arc::new(body);

    let workers: Vec<_> = (0..world)
        .map(|rank| {
            let backend = backend.clone();
            let id = id.clone();
            let body = body.clone();
            thread::spawn(move || {
                let module = participant(&backend, world, rank, &id);
                let comm = module
                    .call("__nccl_comm_init_rank", &[int(rank), int(world), int(rank)])
                    .unwrap();
                body(rank, &module, comm)
            })
        })
        .collect();
    workers.into_iter().map(|w| w.join().unwrap()).collect()
}

#[test]
fn test_join_and_query_by_name() {
    let results = run_world(4, |_, module, comm| {
        let rank = module.call("__nccl_comm_rank", &[comm.clone()]).unwrap();
        let size = module.call("__nccl_comm_num_ranks", &[comm]).unwrap();
        let global = module.call("__spmd_global_rank", &[]).unwrap();
        (rank, size, global)
    });
    for (r, (rank, size, global)) in results.into_iter().enumerate() {
        assert_eq!(rank, int(r));
        assert_eq!(size, int(4));
        assert_eq!(global, int(r));
    }
}

#[test]
fn test_all_reduce_every_operator_by_name() {
    let results = run_world(4, |rank, module, comm| {
        let mut out = Vec::new();
        for op in ["sum", "prod", "min", "max", "avg"] {
            let mut send = [(rank + 1) as i64];
            let mut recv = [0i64];
            let args = [addr(&mut send), addr(&mut recv), int(1), comm.clone(), int(0)];
            module
                .call(&format!("__nccl_all_reduce_{}_i64", op), &args)
                .unwrap();
            out.push(recv[0]);
        }
        out
    });
    // Contributions 1, 2, 3, 4.
    for out in results {
        assert_eq!(out, vec![10, 24, 1, 4, 2]);
    }
}

#[test]
fn test_reduce_scatter_f64_by_name() {
    let results = run_world(2, |rank, module, comm| {
        let mut send = [1.0f64 + rank as f64, 10.0, 100.0, 1000.0 * (rank + 1) as f64];
        let mut recv = [0.0f64; 2];
        let args = [addr(&mut send), addr(&mut recv), int(2), comm, int(0)];
        module.call("__nccl_reduce_scatter_sum_f64", &args).unwrap();
        recv
    });
    assert_eq!(results[0], [3.0, 20.0]);
    assert_eq!(results[1], [200.0, 3000.0]);
}

#[test]
fn test_data_movement_by_name() {
    let results = run_world(4, |rank, module, comm| {
        // all_gather of 8 bytes per rank.
        let mut send = [rank as u8; 8];
        let mut gathered = [0u8; 32];
        module
            .call(
                "__nccl_all_gather",
                &[addr(&mut send), addr(&mut gathered), int(8), comm.clone(), int(0)],
            )
            .unwrap();

        // all_to_all of 4 shards of 2 bytes; byte = 10 * sender + shard.
        let mut a2a_send: Vec<u8> = (0..8).map(|i| (rank * 10 + i / 2) as u8).collect();
        let mut a2a_recv = vec![0u8; 8];
        module
            .call(
                "__nccl_all_to_all",
                &[addr(&mut a2a_send), addr(&mut a2a_recv), int(8), comm.clone(), int(0)],
            )
            .unwrap();

        // Shift right by one; rank 0 receives nothing and must see zeros.
        let mut p_send = [rank as u8 + 100; 4];
        let mut p_recv = [0xeeu8; 4];
        let send_id = if rank < 3 { rank + 1 } else { -1 };
        let recv_id = if rank > 0 { rank - 1 } else { -1 };
        module
            .call(
                "__nccl_permute",
                &[
                    addr(&mut p_send),
                    addr(&mut p_recv),
                    int(send_id),
                    int(recv_id),
                    int(4),
                    comm,
                    int(0),
                ],
            )
            .unwrap();

        (gathered, a2a_recv, p_recv)
    });

    let expected_gather: Vec<u8> = (0..4u8).flat_map(|r| [r; 8]).collect();
    for (r, (gathered, a2a_recv, p_recv)) in results.into_iter().enumerate() {
        assert_eq!(gathered.to_vec(), expected_gather);
        for k in 0..4 {
            assert_eq!(&a2a_recv[k * 2..k * 2 + 2], &[(k * 10 + r) as u8; 2]);
        }
        let expected_permute = if r == 0 { [0u8; 4] } else { [r as u8 + 99; 4] };
        assert_eq!(p_recv, expected_permute);
    }
}

#[test]
fn test_split_by_name() {
    let results = run_world(4, |rank, module, comm| {
        // Rank 3 opts out; the rest form {0, 2} and {1}.
        let color = match rank {
            3 => -1,
            r => r % 2,
        };
        let child = module
            .call("__nccl_comm_split", &[comm, int(color), int(rank)])
            .unwrap();
        if handle_of(&child) == NULL_HANDLE {
            return None;
        }
        let rank = module.call("__nccl_comm_rank", &[child.clone()]).unwrap();
        let size = module.call("__nccl_comm_num_ranks", &[child]).unwrap();
        Some((rank, size))
    });
    assert_eq!(results[0], Some((int(0), int(2))));
    assert_eq!(results[1], Some((int(0), int(1))));
    assert_eq!(results[2], Some((int(1), int(2))));
    assert_eq!(results[3], None);
}

#[test]
fn test_split_unsupported_by_name() {
    let backend = Arc::new(SimulatedBackend::new().with_version(21704));
    let shared: Arc<dyn CollectiveBackend> = backend.clone();
    let tracker = Arc::new(ResourceTracker::new());
    let module = NcclModule::new(Some(shared), tracker.clone(), None);
    let id = module.get_communicator_unique_id().unwrap();
    module.register_device_dependent_methods(1, 0, &id).unwrap();
    module.register_collective_ops();

    let comm = module
        .call("__nccl_comm_init_rank", &[int(0), int(1), int(0)])
        .unwrap();
    let err = module
        .call("__nccl_comm_split", &[comm, int(0), int(0)])
        .unwrap_err();
    assert!(matches!(err, CommError::UnsupportedOperation(_)));
    assert_eq!(tracker.len(), 1);
}

#[test]
fn test_teardown_destroys_every_communicator() {
    let backend = Arc::new(SimulatedBackend::new());
    let shared: Arc<dyn CollectiveBackend> = backend.clone();
    let tracker = Arc::new(ResourceTracker::new());
    let module = NcclModule::new(Some(shared), tracker.clone(), None);
    let id = module.get_communicator_unique_id().unwrap();
    module.register_device_dependent_methods(1, 0, &id).unwrap();
    module.register_collective_ops();

    let handles: Vec<Handle> = (0..3)
        .map(|_| {
            let comm = module
                .call("__nccl_comm_init_rank", &[int(0), int(1), int(0)])
                .unwrap();
            handle_of(&comm)
        })
        .collect();
    assert_eq!(backend.live_comms(), 3);

    module.release(handles[0]).unwrap();
    assert!(matches!(module.release(handles[0]), Err(CommError::NotFound(_))));
    assert_eq!(backend.live_comms(), 2);

    assert_eq!(tracker.teardown_all(), 2);
    assert_eq!(backend.live_comms(), 0);
}

#[test]
fn test_host_supplied_identity_provider() {
    let backend = Arc::new(SimulatedBackend::new());
    let shared: Arc<dyn CollectiveBackend> = backend.clone();
    let module = NcclModule::new(Some(shared), Arc::new(ResourceTracker::new()), None);
    module.register_collective_ops();

    // The host may install its own broadcast-backed provider instead of a fixed identity.
    let id = backend.get_unique_id().unwrap();
    module.register(
        IDENTITY_PROVIDER,
        Arc::new(move |_: &[HostValue]| -> spmd_collectives::Result<HostValue> {
            Ok(HostValue::Bytes(id.internal.to_vec()))
        }),
    );
    let comm = module
        .call("__nccl_comm_init_rank", &[int(0), int(1), int(0)])
        .unwrap();
    assert_eq!(module.call("__nccl_comm_num_ranks", &[comm]).unwrap(), int(1));
}

#[test]
fn test_metrics_follow_module_activity() {
    let backend: Arc<dyn CollectiveBackend> = Arc::new(SimulatedBackend::new());
    let metrics = Arc::new(CollectiveMetrics::new().unwrap());
    let module = NcclModule::new(Some(backend), Arc::new(ResourceTracker::new()), Some(metrics.clone()));
    let id = module.get_communicator_unique_id().unwrap();
    module.register_device_dependent_methods(1, 0, &id).unwrap();
    module.register_collective_ops();

    let comm = module
        .call("__nccl_comm_init_rank", &[int(0), int(1), int(0)])
        .unwrap();
    let mut buf = [1.5f32; 4];
    let args = [addr(&mut buf), addr(&mut buf), int(4), comm.clone(), int(0)];
    module.call("__nccl_all_reduce_sum_f32", &args).unwrap();
    module.release(handle_of(&comm)).unwrap();

    let text = metrics.gather().unwrap();
    assert!(text.contains("spmd_collective_calls_total{op=\"all_reduce\"} 1"));
    assert!(text.contains("spmd_collective_calls_total{op=\"comm_init_rank\"} 1"));
    assert!(text.contains("spmd_live_communicators 0"));
    assert!(text.contains("spmd_tracker_releases_total 1"));
}

#[test]
fn test_config_drives_module_construction() {
    let mut config = RuntimeConfig::default();
    config.apply_overrides(vec![
        ("SPMD_TOPOLOGY__WORLD_SIZE".to_string(), "2".to_string()),
        ("SPMD_TOPOLOGY__RANK".to_string(), "1".to_string()),
    ]);
    config.validate().unwrap();

    let module = NcclModule::new(config.build_backend().unwrap(), Arc::new(ResourceTracker::new()), None);
    module
        .register_device_dependent_methods(config.topology.world_size, config.topology.rank, &config.unique_id_bytes().unwrap())
        .unwrap();
    assert_eq!(module.call("__spmd_global_num_ranks", &[]).unwrap(), int(2));
    assert_eq!(module.call("__spmd_global_rank", &[]).unwrap(), int(1));

    config.backend.kind = BackendKind::Disabled;
    let disabled = NcclModule::new(config.build_backend().unwrap(), Arc::new(ResourceTracker::new()), None);
    assert_eq!(disabled.register_collective_ops(), 0);
    assert!(disabled.call("__nccl_comm_init_rank", &[int(0), int(1), int(0)]).is_err());
}

#[cfg(feature = "metrics-server")]
#[tokio::test]
async fn test_metrics_server_serves_exposition() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let metrics = Arc::new(CollectiveMetrics::new().unwrap());
    metrics.record_call("all_gather", true);
    let port = 19187;
    tokio::spawn(spmd_collectives::utils::metrics::serve_metrics(metrics, port));

    let mut stream = loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => break stream,
            Err(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
        }
    };
    stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("spmd_collective_calls_total"));
}
