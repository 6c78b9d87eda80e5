//! End-to-end integration tests for weft-mesh.
//!
//! Tests the full path: QUIC transport → chunk stream → worker assembly →
//! orchestrated cross-device invocation.

use weft_graph::{Computation, DeviceId, OpGraph, Returns};
use weft_mesh::protocol::chunk_graph;
use weft_mesh::transport::{rpc_transport, RpcStream, WorkerServiceClient, ALPN};
use weft_mesh::worker::Worker;
use weft_mesh::{CallResult, EndpointTransport, GraphChunk, Orchestrator};

use iroh::endpoint::RelayMode;
use iroh::Endpoint;

/// Chunk stream for s = x + y.
fn sum_chunks() -> Vec<GraphChunk> {
    let mut g = OpGraph::new();
    let x = g.parameter("x", &[2]);
    let y = g.parameter("y", &[2]);
    let s = g.add("s", x, y);
    let order = g.all_op_references(&[s]);
    chunk_graph(&g, &order)
}

async fn quic_pair() -> (Endpoint, Endpoint) {
    // Relay disabled for localhost.
    let worker = Endpoint::empty_builder(RelayMode::Disabled)
        .alpns(vec![ALPN.to_vec()])
        .bind()
        .await
        .unwrap();
    let coord = Endpoint::empty_builder(RelayMode::Disabled)
        .alpns(vec![ALPN.to_vec()])
        .bind()
        .await
        .unwrap();
    (worker, coord)
}

#[tokio::test]
async fn quic_create_and_execute() {
    let (ep_worker, ep_coord) = quic_pair().await;
    let worker_addr = ep_worker.addr();

    // Worker serves tarpc over QUIC
    let worker = Worker::reference();
    let transport = EndpointTransport::from_endpoint(ep_worker);
    let worker_clone = worker.clone();
    tokio::spawn(async move {
        worker_clone.serve(&transport).await.ok();
    });

    // Give the worker a moment to start accepting
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // Coordinator connects to worker via QUIC
    let conn = ep_coord.connect(worker_addr, ALPN).await.unwrap();
    let (send, recv) = conn.open_bi().await.unwrap();
    let client = WorkerServiceClient::new(
        tarpc::client::Config::default(),
        rpc_transport(RpcStream::new(send, recv)),
    )
    .spawn();

    // Create and execute
    client
        .create_computation(
            tarpc::context::current(),
            1,
            sum_chunks(),
            vec!["s".into()],
            vec!["x".into(), "y".into()],
        )
        .await
        .unwrap()
        .unwrap();

    client
        .feed_inputs(
            tarpc::context::current(),
            1,
            vec![vec![3.0, 4.0], vec![1.0, 2.0]],
        )
        .await
        .unwrap()
        .unwrap();

    let results = client
        .collect_results(tarpc::context::current(), 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(results, vec![("s".to_string(), vec![4.0, 6.0])]);

    // Verify ping works over QUIC too
    let seq = client.ping(tarpc::context::current(), 99).await.unwrap();
    assert_eq!(seq, 99);
}

#[tokio::test]
async fn quic_two_workers_same_chunk_stream() {
    let ep_w1 = Endpoint::empty_builder(RelayMode::Disabled)
        .alpns(vec![ALPN.to_vec()])
        .bind()
        .await
        .unwrap();
    let ep_w2 = Endpoint::empty_builder(RelayMode::Disabled)
        .alpns(vec![ALPN.to_vec()])
        .bind()
        .await
        .unwrap();
    let ep_coord = Endpoint::empty_builder(RelayMode::Disabled)
        .alpns(vec![ALPN.to_vec()])
        .bind()
        .await
        .unwrap();

    let w1_addr = ep_w1.addr();
    let w2_addr = ep_w2.addr();

    let w1 = Worker::reference();
    let w2 = Worker::reference();
    let t1 = EndpointTransport::from_endpoint(ep_w1);
    let t2 = EndpointTransport::from_endpoint(ep_w2);

    let w1c = w1.clone();
    tokio::spawn(async move { w1c.serve(&t1).await.ok(); });
    let w2c = w2.clone();
    tokio::spawn(async move { w2c.serve(&t2).await.ok(); });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut clients = Vec::new();
    for addr in [w1_addr, w2_addr] {
        let conn = ep_coord.connect(addr, ALPN).await.unwrap();
        let (send, recv) = conn.open_bi().await.unwrap();
        let client = WorkerServiceClient::new(
            tarpc::client::Config::default(),
            rpc_transport(RpcStream::new(send, recv)),
        )
        .spawn();
        clients.push(client);
    }

    // Both workers receive the identical chunk stream and rebuild the
    // same topology; only the return subsets differ.
    let chunks = sum_chunks();
    for client in &clients {
        client
            .create_computation(
                tarpc::context::current(),
                1,
                chunks.clone(),
                vec!["s".into()],
                vec!["x".into(), "y".into()],
            )
            .await
            .unwrap()
            .unwrap();
        client
            .feed_inputs(
                tarpc::context::current(),
                1,
                vec![vec![3.0, 4.0], vec![1.0, 2.0]],
            )
            .await
            .unwrap()
            .unwrap();
    }

    let r1 = clients[0]
        .collect_results(tarpc::context::current(), 1)
        .await
        .unwrap()
        .unwrap();
    let r2 = clients[1]
        .collect_results(tarpc::context::current(), 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(r1, r2);
    assert_eq!(r1[0].1, vec![4.0, 6.0]);
}

#[tokio::test]
async fn orchestrated_three_device_pipeline() {
    // a = x + y on cpu0, b = a * 2 on cpu1, c = -b on cpu2. The chain
    // forces two relay waves.
    let mut g = OpGraph::new();
    let x = g.parameter("x", &[2]);
    let y = g.parameter("y", &[2]);
    let a = g.add("a", x, y);
    let two = g.constant("two", 2.0, &[2]);
    let b = g.mul("b", a, two);
    g.on_device(b, "cpu", DeviceId::Single(1));
    let c = g.neg("c", b);
    g.on_device(c, "cpu", DeviceId::Single(2));

    let mut orch = Orchestrator::new("cpu");
    let comp = Computation::new(vec![x, y], Returns::Sequence(vec![a, c]));
    let dist = orch.build(&mut g, &comp).await.unwrap();
    assert_eq!(dist.num_workers(), 3);

    let result = dist
        .call(&[vec![3.0, 4.0], vec![1.0, 2.0]])
        .await
        .unwrap();
    assert_eq!(
        result,
        CallResult::Sequence(vec![vec![4.0, 6.0], vec![-8.0, -12.0]])
    );

    // Second invocation over the same distributed computation.
    let result = dist.call(&[vec![1.0, 0.0], vec![0.0, 1.0]]).await.unwrap();
    assert_eq!(
        result,
        CallResult::Sequence(vec![vec![1.0, 1.0], vec![-2.0, -2.0]])
    );
    orch.close().await;
}

#[tokio::test]
async fn orchestrated_split_with_broadcast_parameter() {
    // y is computed on both workers from the shared parameter x; the
    // gather wrapper concatenates the partials under y's identity.
    let mut g = OpGraph::new();
    let x = g.parameter("x", &[2]);
    let y = g.neg("y", x);
    g.on_device(y, "cpu", DeviceId::Split(vec![0, 1]));
    let z = g.add("z", x, x);

    let mut orch = Orchestrator::new("cpu");
    let comp = Computation::new(vec![x], Returns::Set(vec![y, z]));
    let dist = orch.build(&mut g, &comp).await.unwrap();
    assert_eq!(dist.num_workers(), 2);

    let result = dist.call(&[vec![1.0, 2.0]]).await.unwrap();
    let CallResult::Set(table) = result else {
        panic!("expected set result");
    };
    assert_eq!(table["y"], vec![-1.0, -2.0, -1.0, -2.0]);
    assert_eq!(table["z"], vec![2.0, 4.0]);
    orch.close().await;
}

#[tokio::test]
async fn two_computations_share_one_fleet() {
    // Two computations built over the same graph arena reuse the fleet
    // and the bridges inserted by the first build.
    let mut g = OpGraph::new();
    let x = g.parameter("x", &[2]);
    let a = g.neg("a", x);
    let b = g.neg("b", a);
    g.on_device(b, "cpu", DeviceId::Single(1));

    let mut orch = Orchestrator::new("cpu");
    let first = orch
        .build(&mut g, &Computation::new(vec![x], Returns::Single(b)))
        .await
        .unwrap();
    let second = orch
        .build(&mut g, &Computation::new(vec![x], Returns::Single(a)))
        .await
        .unwrap();

    assert_eq!(
        first.call(&[vec![5.0, -3.0]]).await.unwrap(),
        CallResult::Single(vec![5.0, -3.0])
    );
    assert_eq!(
        second.call(&[vec![5.0, -3.0]]).await.unwrap(),
        CallResult::Single(vec![-5.0, 3.0])
    );
    orch.close().await;
}
