//! Worker: rebuilds graph topology from the chunk stream and runs its
//! assigned sub-computation through the local transformer.
//!
//! Each worker serves the `WorkerService` RPC interface, either over an
//! in-process tarpc channel or over incoming QUIC connections. The worker
//! receives the same chunk stream as every other worker and reconstructs
//! full topology from it; its own return/parameter name subsets tell it
//! which outputs to materialize.

use std::collections::HashMap;
use std::sync::Arc;

use tarpc::context;
use tarpc::server::{BaseChannel, Channel};
use tokio::sync::RwLock;
use tracing::info;

use weft_graph::OpId;

use crate::executor::{LocalComputation, LocalTransformer, RefTransformer};
use crate::protocol::{assemble, GraphChunk};
use crate::transport::{EndpointTransport, WorkerService, WorkerServiceClient};

/// Shared worker state.
struct WorkerState {
    /// Live sub-computations, keyed by computation id.
    computations: HashMap<u64, Box<dyn LocalComputation>>,
    /// Whether a shutdown has been requested.
    shutting_down: bool,
    /// The execution engine this worker compiles subgraphs with.
    transformer: Arc<dyn LocalTransformer>,
}

/// A worker that builds and runs remote sub-computations.
#[derive(Clone)]
pub struct Worker {
    state: Arc<RwLock<WorkerState>>,
}

impl Worker {
    /// Create a worker backed by the given execution engine.
    pub fn new(transformer: Arc<dyn LocalTransformer>) -> Self {
        Self {
            state: Arc::new(RwLock::new(WorkerState {
                computations: HashMap::new(),
                shutting_down: false,
                transformer,
            })),
        }
    }

    /// Create a worker backed by the reference interpreter.
    pub fn reference() -> Self {
        Self::new(Arc::new(RefTransformer))
    }

    /// Spawn this worker serving a tarpc channel transport.
    ///
    /// Returns a client that can call this worker's RPC methods in-process.
    pub fn spawn_channel(&self) -> WorkerServiceClient {
        let (client_transport, server_transport) = tarpc::transport::channel::unbounded();

        let server = BaseChannel::with_defaults(server_transport);
        let handler = WorkerHandler {
            state: self.state.clone(),
        };

        tokio::spawn(async move {
            use futures_util::StreamExt;
            server
                .execute(handler.serve())
                .for_each(|response| async move {
                    tokio::spawn(response);
                })
                .await;
        });

        WorkerServiceClient::new(tarpc::client::Config::default(), client_transport).spawn()
    }

    /// Serve a single incoming QUIC connection via tarpc.
    pub async fn serve_connection(
        &self,
        conn: iroh::endpoint::Connection,
    ) -> Result<(), crate::error::DistError> {
        let (send, recv) = conn
            .accept_bi()
            .await
            .map_err(|e| crate::error::DistError::Transport(e.to_string()))?;
        let stream = crate::transport::RpcStream::new(send, recv);
        let transport = crate::transport::rpc_transport(stream);
        let server = BaseChannel::with_defaults(transport);
        let handler = WorkerHandler {
            state: self.state.clone(),
        };
        tokio::spawn(async move {
            use futures_util::StreamExt;
            server
                .execute(handler.serve())
                .for_each(|response| async move {
                    tokio::spawn(response);
                })
                .await;
        });
        Ok(())
    }

    /// Accept loop: serve tarpc over incoming QUIC connections.
    pub async fn serve(
        &self,
        transport: &EndpointTransport,
    ) -> Result<(), crate::error::DistError> {
        while let Some(incoming) = transport.accept().await {
            let conn = incoming
                .await
                .map_err(|e| crate::error::DistError::Transport(e.to_string()))?;
            self.serve_connection(conn).await?;
        }
        Ok(())
    }

    /// Whether shutdown has been requested.
    pub async fn is_shutting_down(&self) -> bool {
        self.state.read().await.shutting_down
    }

    /// Number of live sub-computations.
    pub async fn num_computations(&self) -> usize {
        self.state.read().await.computations.len()
    }
}

/// tarpc service implementation for workers.
#[derive(Clone)]
struct WorkerHandler {
    state: Arc<RwLock<WorkerState>>,
}

impl WorkerService for WorkerHandler {
    async fn create_computation(
        self,
        _ctx: context::Context,
        comp_id: u64,
        chunks: Vec<GraphChunk>,
        returns: Vec<String>,
        params: Vec<String>,
    ) -> Result<(), String> {
        let graph = assemble(&chunks).map_err(|e| e.to_string())?;

        let resolve = |names: &[String]| -> Result<Vec<OpId>, String> {
            names
                .iter()
                .map(|n| {
                    graph
                        .by_name(n)
                        .ok_or_else(|| format!("op {n} not present in the chunk stream"))
                })
                .collect()
        };
        let return_ids = resolve(&returns)?;
        let param_ids = resolve(&params)?;

        let mut state = self.state.write().await;
        let computation = state.transformer.compile(&graph, &return_ids, &param_ids)?;
        state.computations.insert(comp_id, computation);

        info!(
            "created computation {comp_id}: {} ops, {} returns, {} params",
            graph.len(),
            returns.len(),
            params.len()
        );
        Ok(())
    }

    async fn feed_inputs(
        self,
        _ctx: context::Context,
        comp_id: u64,
        values: Vec<Vec<f32>>,
    ) -> Result<(), String> {
        let mut state = self.state.write().await;
        let computation = state
            .computations
            .get_mut(&comp_id)
            .ok_or_else(|| format!("no computation {comp_id}"))?;
        computation.feed_inputs(values)
    }

    async fn feed_received(
        self,
        _ctx: context::Context,
        comp_id: u64,
        values: Vec<(String, Vec<f32>)>,
    ) -> Result<(), String> {
        let mut state = self.state.write().await;
        let computation = state
            .computations
            .get_mut(&comp_id)
            .ok_or_else(|| format!("no computation {comp_id}"))?;
        for (send_name, value) in values {
            computation.feed_received(&send_name, value)?;
        }
        Ok(())
    }

    async fn collect_results(
        self,
        _ctx: context::Context,
        comp_id: u64,
    ) -> Result<Vec<(String, Vec<f32>)>, String> {
        let mut state = self.state.write().await;
        let computation = state
            .computations
            .get_mut(&comp_id)
            .ok_or_else(|| format!("no computation {comp_id}"))?;
        computation.collect_results()
    }

    async fn ping(self, _ctx: context::Context, seq: u64) -> u64 {
        seq
    }

    async fn shutdown(self, _ctx: context::Context) -> Result<(), String> {
        info!("shutdown requested");
        let mut state = self.state.write().await;
        state.shutting_down = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::chunk_graph;
    use weft_graph::OpGraph;

    fn sum_graph() -> Vec<GraphChunk> {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);
        let y = g.parameter("y", &[2]);
        let s = g.add("s", x, y);
        let order = g.all_op_references(&[s]);
        chunk_graph(&g, &order)
    }

    #[tokio::test]
    async fn create_feed_and_collect() {
        let worker = Worker::reference();
        let client = worker.spawn_channel();

        let chunks = sum_graph();
        client
            .create_computation(
                context::current(),
                1,
                chunks,
                vec!["s".into()],
                vec!["x".into(), "y".into()],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worker.num_computations().await, 1);

        client
            .feed_inputs(context::current(), 1, vec![vec![1.0, 2.0], vec![3.0, 4.0]])
            .await
            .unwrap()
            .unwrap();

        let results = client
            .collect_results(context::current(), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(results, vec![("s".to_string(), vec![4.0, 6.0])]);
    }

    #[tokio::test]
    async fn unknown_return_name_is_rejected() {
        let worker = Worker::reference();
        let client = worker.spawn_channel();

        let result = client
            .create_computation(
                context::current(),
                1,
                sum_graph(),
                vec!["nonexistent".into()],
                vec![],
            )
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let worker = Worker::reference();
        let client = worker.spawn_channel();

        let mut chunks = sum_graph();
        chunks[0].version = 999;
        let result = client
            .create_computation(context::current(), 1, chunks, vec![], vec![])
            .await
            .unwrap();
        assert!(result.unwrap_err().contains("version mismatch"));
    }

    #[tokio::test]
    async fn unknown_computation_id() {
        let worker = Worker::reference();
        let client = worker.spawn_channel();

        let result = client
            .collect_results(context::current(), 7)
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn ping_and_shutdown() {
        let worker = Worker::reference();
        let client = worker.spawn_channel();

        assert_eq!(client.ping(context::current(), 42).await.unwrap(), 42);
        assert!(!worker.is_shutting_down().await);
        client.shutdown(context::current()).await.unwrap().unwrap();
        assert!(worker.is_shutting_down().await);
    }
}
