//! Worker proxy: coordinator-side handle to a remote sub-computation.
//!
//! `create_remote` fires the build RPC on a spawned task and returns
//! immediately, so every worker starts building simultaneously;
//! `materialize` joins that task and yields a runnable handle. Total
//! creation latency is bounded by the slowest worker, not the sum.

use std::sync::Arc;

use tarpc::context;
use tokio::task::JoinHandle;
use tracing::debug;

use weft_graph::{OpId, OpMeta};

use crate::error::DistError;
use crate::protocol::GraphChunk;
use crate::transport::WorkerServiceClient;

struct PendingBuild {
    comp_id: u64,
    task: JoinHandle<Result<(), DistError>>,
}

/// Coordinator-side handle to one worker.
pub struct WorkerProxy {
    owner: String,
    device_index: u32,
    client: WorkerServiceClient,
    pending: Option<PendingBuild>,
}

impl WorkerProxy {
    pub fn new(owner: &str, device_index: u32, client: WorkerServiceClient) -> Self {
        Self {
            owner: owner.to_string(),
            device_index,
            client,
            pending: None,
        }
    }

    /// The owner name this proxy serves, e.g. "cpu0".
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    /// Whether a node belongs to this worker. A node matches more than
    /// one proxy only through split outputs or broadcast parameters.
    pub fn owns(&self, meta: &OpMeta) -> bool {
        meta.owners.iter().any(|o| o == &self.owner)
    }

    /// Issue remote creation without waiting for completion.
    ///
    /// The chunk stream is shared verbatim across workers; only the
    /// return/parameter subsets differ per proxy.
    pub fn create_remote(
        &mut self,
        comp_id: u64,
        chunks: Arc<Vec<GraphChunk>>,
        returns: Vec<String>,
        params: Vec<String>,
    ) {
        debug!(
            "create_remote on {}: {} chunks, {} returns, {} params",
            self.owner,
            chunks.len(),
            returns.len(),
            params.len()
        );
        let client = self.client.clone();
        let task = tokio::spawn(async move {
            match client
                .create_computation(context::current(), comp_id, (*chunks).clone(), returns, params)
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(DistError::Build(e)),
                Err(e) => Err(DistError::Rpc(e.to_string())),
            }
        });
        self.pending = Some(PendingBuild { comp_id, task });
    }

    /// Block until this worker's build finishes and return the runnable
    /// handle. Fails fast: a rejected subgraph aborts the whole build.
    pub async fn materialize(&mut self) -> Result<RemoteComputation, DistError> {
        let pending = self.pending.take().ok_or_else(|| {
            DistError::Build(format!(
                "materialize on {} with no creation in flight",
                self.owner
            ))
        })?;
        pending
            .task
            .await
            .map_err(|e| DistError::Build(format!("creation task failed: {e}")))??;
        Ok(RemoteComputation {
            client: self.client.clone(),
            comp_id: pending.comp_id,
            param_idx: Vec::new(),
            result_map: Vec::new(),
        })
    }

    /// Ask the worker to shut down.
    pub async fn shutdown(&self) -> Result<(), DistError> {
        match self.client.shutdown(context::current()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DistError::Rpc(e)),
            Err(e) => Err(DistError::Rpc(e.to_string())),
        }
    }
}

/// A materialized remote sub-computation.
#[derive(Debug)]
pub struct RemoteComputation {
    client: WorkerServiceClient,
    comp_id: u64,
    /// Global parameter positions this worker is fed, in local feed order.
    pub param_idx: Vec<usize>,
    /// (caller-visible return id, worker-local result slot).
    pub result_map: Vec<(OpId, usize)>,
}

impl RemoteComputation {
    /// Feed parameter values in local order.
    pub async fn feed_inputs(&self, values: Vec<Vec<f32>>) -> Result<(), DistError> {
        match self
            .client
            .feed_inputs(context::current(), self.comp_id, values)
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DistError::Invoke(e)),
            Err(e) => Err(DistError::Rpc(e.to_string())),
        }
    }

    /// Deliver relayed send values.
    pub async fn feed_received(
        &self,
        values: Vec<(String, Vec<f32>)>,
    ) -> Result<(), DistError> {
        match self
            .client
            .feed_received(context::current(), self.comp_id, values)
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DistError::Invoke(e)),
            Err(e) => Err(DistError::Rpc(e.to_string())),
        }
    }

    /// Execute and fetch this worker's results.
    pub async fn collect_results(&self) -> Result<Vec<(String, Vec<f32>)>, DistError> {
        match self
            .client
            .collect_results(context::current(), self.comp_id)
            .await
        {
            Ok(Ok(results)) => Ok(results),
            Ok(Err(e)) => Err(DistError::Invoke(e)),
            Err(e) => Err(DistError::Rpc(e.to_string())),
        }
    }
}
