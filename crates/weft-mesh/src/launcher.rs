//! Worker launcher: start one worker per participating device.
//!
//! Launch is a one-time blocking setup step per distributed computation;
//! repeated builds reuse the already-launched fleet. Two fleet modes:
//! in-process workers over tarpc channel transports, and workers bound to
//! their own QUIC endpoints.

use tracing::info;

use crate::error::DistError;
use crate::executor::backend_for;
use crate::transport::{rpc_transport, EndpointTransport, RpcStream, WorkerServiceClient};
use crate::worker::Worker;

/// Resolvable address of a launched worker.
#[derive(Clone, Debug)]
pub enum WorkerAddr {
    /// Worker lives in this process, reachable over a channel transport.
    InProcess { device_index: u32 },
    /// Worker serves on its own QUIC endpoint.
    Quic(iroh::EndpointAddr),
}

enum FleetMode {
    InProcess,
    Quic,
}

struct LaunchedWorker {
    addr: WorkerAddr,
    client: WorkerServiceClient,
    serve_task: Option<tokio::task::JoinHandle<()>>,
}

/// Starts and owns the worker fleet.
pub struct WorkerLauncher {
    device: String,
    mode: FleetMode,
    workers: Vec<LaunchedWorker>,
    procs_per_node: usize,
    coordinator_endpoint: Option<EndpointTransport>,
    closed: bool,
}

impl WorkerLauncher {
    /// In-process fleet: every worker is a task in this process served
    /// over a tarpc channel transport.
    pub fn in_process(device: &str) -> Self {
        Self::with_mode(device, FleetMode::InProcess)
    }

    /// QUIC fleet: every worker binds its own endpoint.
    pub fn quic(device: &str) -> Self {
        Self::with_mode(device, FleetMode::Quic)
    }

    fn with_mode(device: &str, mode: FleetMode) -> Self {
        Self {
            device: device.to_string(),
            mode,
            workers: Vec::new(),
            procs_per_node: 1,
            coordinator_endpoint: None,
            closed: false,
        }
    }

    /// Number of launched workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Start `num_workers` workers, `procs_per_node` of them per node
    /// (1 for cpu fleets, `num_workers` when every worker needs an
    /// exclusive accelerator).
    ///
    /// Idempotent while the fleet is large enough: a second launch that
    /// fits inside the running fleet is a no-op.
    pub async fn launch(
        &mut self,
        num_workers: usize,
        procs_per_node: usize,
    ) -> Result<(), DistError> {
        if self.closed {
            return Err(DistError::Closed);
        }
        if num_workers == 0 {
            return Err(DistError::Launch("no workers requested".into()));
        }
        if !self.workers.is_empty() {
            if self.workers.len() >= num_workers {
                return Ok(());
            }
            return Err(DistError::Launch(format!(
                "fleet already launched with {} workers, cannot grow to {num_workers}",
                self.workers.len()
            )));
        }
        if procs_per_node != 1 && procs_per_node != num_workers {
            return Err(DistError::Launch(format!(
                "procs_per_node must be 1 or the worker count, got {procs_per_node}"
            )));
        }

        // Backend problems are configuration errors and must surface
        // before any worker starts.
        let transformer = backend_for(&self.device)?;

        for rank in 0..num_workers {
            let worker = Worker::new(transformer.clone());
            let launched = match self.mode {
                FleetMode::InProcess => LaunchedWorker {
                    addr: WorkerAddr::InProcess {
                        device_index: rank as u32,
                    },
                    client: worker.spawn_channel(),
                    serve_task: None,
                },
                FleetMode::Quic => {
                    let transport = EndpointTransport::new()
                        .await
                        .map_err(|e| DistError::Launch(e.to_string()))?;
                    let addr = transport.addr();
                    let serve_worker = worker.clone();
                    let serve_task = tokio::spawn(async move {
                        serve_worker.serve(&transport).await.ok();
                    });

                    if self.coordinator_endpoint.is_none() {
                        self.coordinator_endpoint = Some(
                            EndpointTransport::new()
                                .await
                                .map_err(|e| DistError::Launch(e.to_string()))?,
                        );
                    }
                    let endpoint = self.coordinator_endpoint.as_ref().unwrap();
                    let conn = endpoint
                        .connect(addr.clone())
                        .await
                        .map_err(|e| DistError::Launch(e.to_string()))?;
                    let (send, recv) = conn
                        .open_bi()
                        .await
                        .map_err(|e| DistError::Launch(e.to_string()))?;
                    let client = WorkerServiceClient::new(
                        tarpc::client::Config::default(),
                        rpc_transport(RpcStream::new(send, recv)),
                    )
                    .spawn();

                    LaunchedWorker {
                        addr: WorkerAddr::Quic(addr),
                        client,
                        serve_task: Some(serve_task),
                    }
                }
            };
            self.workers.push(launched);
        }
        self.procs_per_node = procs_per_node;
        info!(
            "launched {num_workers} {} workers ({procs_per_node} per node)",
            self.device
        );
        Ok(())
    }

    /// The address of the worker at `device_index`, for a fleet of
    /// `num_workers`.
    pub fn address_of(
        &self,
        device_index: u32,
        num_workers: usize,
    ) -> Result<&WorkerAddr, DistError> {
        if self.workers.len() < num_workers {
            return Err(DistError::Launch(format!(
                "fleet has {} workers, {num_workers} requested",
                self.workers.len()
            )));
        }
        self.workers
            .get(device_index as usize)
            .map(|w| &w.addr)
            .ok_or_else(|| DistError::WorkerNotFound(format!("device index {device_index}")))
    }

    /// Client for the worker at `device_index`.
    pub fn client_for(&self, device_index: u32) -> Option<WorkerServiceClient> {
        self.workers
            .get(device_index as usize)
            .map(|w| w.client.clone())
    }

    /// Tear the fleet down. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        for worker in &self.workers {
            if let Some(task) = &worker.serve_task {
                task.abort();
            }
        }
        self.workers.clear();
        if let Some(endpoint) = self.coordinator_endpoint.take() {
            endpoint.close().await;
        }
        self.closed = true;
    }
}
