//! Distributed computation orchestrator.
//!
//! Ties the layer together: wraps split returns in gather nodes, drives
//! the assignment and communication passes, launches the worker fleet,
//! chunks the whole graph once, fans remote creation out to every worker
//! before blocking on any, and per invocation feeds, relays, collects and
//! merges back into the caller-declared returns shape.
//!
//! An orchestrator instance is tied to one graph arena: the send set it
//! accumulates across builds refers to node ids in that arena.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::try_join_all;
use tracing::{info, warn};

use weft_graph::{Computation, DeviceId, OpGraph, OpId, OpKind, Returns};

use crate::assign::DeviceAssignPass;
use crate::comm::CommunicationPass;
use crate::error::DistError;
use crate::executor::backend_for;
use crate::launcher::WorkerLauncher;
use crate::protocol::chunk_graph;
use crate::proxy::{RemoteComputation, WorkerProxy};

/// Split an owner name like "cpu1" into its device name and index.
fn split_owner(owner: &str) -> Result<(&str, u32), DistError> {
    let device = owner.trim_end_matches(|c: char| c.is_ascii_digit());
    if device.len() == owner.len() {
        return Err(DistError::Config(format!(
            "owner {owner:?} carries no device index"
        )));
    }
    let index = owner[device.len()..]
        .parse::<u32>()
        .map_err(|e| DistError::Config(format!("owner {owner:?}: {e}")))?;
    Ok((device, index))
}

/// Orchestrates one logical computation across a fleet of device workers.
pub struct Orchestrator {
    default_device: String,
    default_device_id: u32,
    known_devices: Option<Vec<String>>,
    /// Pid of the process that launched the fleet. A forked or copied
    /// handle in another process must not tear shared workers down.
    owner_pid: u32,
    closed: bool,
    /// Worker registry: owner name → proxy, in deterministic order.
    registry: BTreeMap<String, WorkerProxy>,
    comm: CommunicationPass,
    launcher: WorkerLauncher,
    next_comp_id: u64,
}

impl Orchestrator {
    /// Orchestrator over an in-process fleet of `default_device` workers.
    pub fn new(default_device: &str) -> Self {
        Self::with_launcher(default_device, WorkerLauncher::in_process(default_device))
    }

    /// Orchestrator over a custom launcher (e.g. a QUIC fleet).
    pub fn with_launcher(default_device: &str, launcher: WorkerLauncher) -> Self {
        Self {
            default_device: default_device.to_string(),
            default_device_id: 0,
            known_devices: None,
            owner_pid: std::process::id(),
            closed: false,
            registry: BTreeMap::new(),
            comm: CommunicationPass::new(),
            launcher,
            next_comp_id: 1,
        }
    }

    /// Restrict device resolution to an explicit list; nodes resolving
    /// outside it become configuration errors instead of silent defaults.
    pub fn with_known_devices(mut self, devices: &[&str]) -> Self {
        self.known_devices = Some(devices.iter().map(|d| d.to_string()).collect());
        self
    }

    /// Whether this orchestrator has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Build a distributed computation: run the passes, launch workers,
    /// create remote sub-computations in parallel, and materialize them.
    pub async fn build(
        &mut self,
        graph: &mut OpGraph,
        computation: &Computation,
    ) -> Result<DistributedComputation, DistError> {
        if self.closed {
            return Err(DistError::Closed);
        }

        // Wrap split-annotated requested returns in gather nodes so the
        // communication pass sees a single-device gather point. Reuses an
        // existing wrapper on rebuild.
        let requested = computation.returns.ids();
        let mut new_returns = Vec::with_capacity(requested.len());
        for &r in &requested {
            if matches!(graph.node(r).meta.device_id, DeviceId::Split(_)) {
                let wrapper = match graph.node(r).meta.replaced_by {
                    Some(w) => w,
                    None => graph.gather(r),
                };
                new_returns.push(wrapper);
            } else {
                new_returns.push(r);
            }
        }

        // Pass roots: returns ∪ parameters ∪ the accumulated send set.
        let mut roots = new_returns.clone();
        roots.extend(computation.parameters.iter().copied());
        roots.extend(self.comm.send_nodes().iter().copied());

        let mut assign = DeviceAssignPass::new(&self.default_device, self.default_device_id);
        if let Some(known) = &self.known_devices {
            let refs: Vec<&str> = known.iter().map(|s| s.as_str()).collect();
            assign = assign.with_known_devices(&refs);
        }
        assign.run(graph, &roots)?;
        self.comm.run(graph, &roots)?;

        // Whole-graph closure, computed once per build and shared by all
        // workers: returns ∪ send set ∪ parameters.
        let mut all_returns: Vec<OpId> = self.comm.send_nodes().to_vec();
        for &r in &new_returns {
            if !all_returns.contains(&r) {
                all_returns.push(r);
            }
        }
        let mut whole_roots = all_returns.clone();
        whole_roots.extend(computation.parameters.iter().copied());
        let whole = graph.all_op_references(&whole_roots);

        // Participating owners, with backend and index checks up front so
        // configuration errors surface before any launch.
        let mut owners: Vec<String> = Vec::new();
        for &id in &whole {
            for o in &graph.node(id).meta.owners {
                if !owners.contains(o) {
                    owners.push(o.clone());
                }
            }
        }
        if owners.is_empty() {
            return Err(DistError::NoWorkers);
        }
        let mut index_device: HashMap<u32, String> = HashMap::new();
        let mut max_index = 0;
        for owner in &owners {
            let (device, index) = split_owner(owner)?;
            backend_for(device)?;
            if let Some(existing) = index_device.get(&index) {
                if existing != device {
                    return Err(DistError::Config(format!(
                        "device index {index} claimed by both {existing:?} and {device:?}"
                    )));
                }
            }
            index_device.insert(index, device.to_string());
            max_index = max_index.max(index);
        }

        let num_workers = max_index as usize + 1;
        let ppn = if self.default_device.contains("cpu") {
            1
        } else {
            num_workers
        };
        self.launcher.launch(num_workers, ppn).await?;

        // Register a proxy per owner; rebuilds reuse registered clients.
        for owner in &owners {
            if !self.registry.contains_key(owner) {
                let (_, index) = split_owner(owner)?;
                let client = self
                    .launcher
                    .client_for(index)
                    .ok_or_else(|| DistError::WorkerNotFound(owner.clone()))?;
                self.registry
                    .insert(owner.clone(), WorkerProxy::new(owner, index, client));
            }
        }

        // Serialize once; every worker receives the same chunk stream.
        let chunks = Arc::new(chunk_graph(graph, &whole));
        let comp_id = self.next_comp_id;
        self.next_comp_id += 1;
        info!(
            "building computation {comp_id}: {} ops, {} chunks, {} workers",
            whole.len(),
            chunks.len(),
            owners.len()
        );

        // Fan creation out to every worker before blocking on any.
        for (owner, proxy) in self.registry.iter_mut() {
            if !owners.contains(owner) {
                continue;
            }
            let params_w: Vec<String> = computation
                .parameters
                .iter()
                .filter(|&&p| proxy.owns(&graph.node(p).meta))
                .map(|&p| graph.node(p).name.clone())
                .collect();
            let returns_w: Vec<String> = all_returns
                .iter()
                .filter(|&&r| proxy.owns(&graph.node(r).meta))
                .map(|&r| graph.node(r).name.clone())
                .collect();
            proxy.create_remote(comp_id, chunks.clone(), returns_w, params_w);
        }

        // Materialize in the same order; fail fast on any worker.
        let mut children = Vec::new();
        for (owner, proxy) in self.registry.iter_mut() {
            if !owners.contains(owner) {
                continue;
            }
            let mut remote = proxy.materialize().await?;

            remote.param_idx = computation
                .parameters
                .iter()
                .enumerate()
                .filter(|(_, &p)| proxy.owns(&graph.node(p).meta))
                .map(|(i, _)| i)
                .collect();

            // Map worker-local result slots back to caller-visible return
            // identities, unwrapping gather wrappers.
            let worker_returns: Vec<OpId> = all_returns
                .iter()
                .copied()
                .filter(|&r| proxy.owns(&graph.node(r).meta))
                .collect();
            let mut result_map = Vec::new();
            for (slot, &r) in worker_returns.iter().enumerate() {
                let meta = &graph.node(r).meta;
                if requested.contains(&r) && meta.replaced_by.is_none() {
                    result_map.push((r, slot));
                } else if let Some(original) = meta.replaces {
                    if requested.contains(&original) {
                        result_map.push((original, slot));
                    }
                }
            }
            remote.result_map = result_map;

            // Relay bookkeeping: which foreign send values this worker
            // waits for, and which send values it produces.
            let mut recv_deps = Vec::new();
            for &id in &whole {
                let node = graph.node(id);
                if node.kind == OpKind::Recv && proxy.owns(&node.meta) {
                    let send = node.args[0];
                    if proxy.owns(&graph.node(send).meta) {
                        continue; // local member, evaluated in place
                    }
                    let send_name = graph.node(send).name.clone();
                    if !recv_deps.contains(&send_name) {
                        recv_deps.push(send_name);
                    }
                }
            }
            let sends: Vec<String> = worker_returns
                .iter()
                .filter(|&&r| graph.node(r).kind == OpKind::Send)
                .map(|&r| graph.node(r).name.clone())
                .collect();

            children.push(ChildComputation {
                owner: owner.clone(),
                remote,
                recv_deps,
                sends,
            });
        }
        info!("computation {comp_id} ready on {} workers", children.len());

        let names = requested
            .iter()
            .map(|&r| (r, graph.node(r).name.clone()))
            .collect();

        Ok(DistributedComputation {
            children,
            returns: computation.returns.clone(),
            names,
            num_params: computation.parameters.len(),
        })
    }

    /// Shut every worker down exactly once, then release the launcher.
    ///
    /// Idempotent, and a no-op from a process that did not perform the
    /// launch (a forked copy must not close shared workers).
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        if std::process::id() != self.owner_pid {
            return;
        }
        for (owner, proxy) in &self.registry {
            match proxy.shutdown().await {
                Ok(()) => info!("{owner} shut down"),
                Err(e) => warn!("failed to shut down {owner}: {e}"),
            }
        }
        self.launcher.close().await;
        self.closed = true;
    }
}

/// One worker's slice of a distributed computation.
#[derive(Debug)]
struct ChildComputation {
    owner: String,
    remote: RemoteComputation,
    /// Names of foreign send values this worker needs before executing.
    recv_deps: Vec<String>,
    /// Names of send values this worker produces.
    sends: Vec<String>,
}

/// The merged result of one invocation, in the declared returns shape.
#[derive(Clone, Debug, PartialEq)]
pub enum CallResult {
    Single(Vec<f32>),
    Sequence(Vec<Vec<f32>>),
    /// Keyed by the return node's name.
    Set(HashMap<String, Vec<f32>>),
}

/// A ready distributed computation: invoke it with one value per declared
/// parameter.
#[derive(Debug)]
pub struct DistributedComputation {
    children: Vec<ChildComputation>,
    returns: Returns,
    names: HashMap<OpId, String>,
    num_params: usize,
}

impl DistributedComputation {
    /// One invocation cycle: feed every worker its parameter slice, relay
    /// send values between workers in dependency waves, collect every
    /// worker's results and merge them into the declared returns shape.
    pub async fn call(&self, args: &[Vec<f32>]) -> Result<CallResult, DistError> {
        if args.len() != self.num_params {
            return Err(DistError::Invoke(format!(
                "expected {} arguments, got {}",
                self.num_params,
                args.len()
            )));
        }

        // Feed all workers in parallel; a slow worker must not block the
        // feeding of others.
        try_join_all(self.children.iter().map(|child| {
            let values: Vec<Vec<f32>> = child
                .remote
                .param_idx
                .iter()
                .map(|&i| args[i].clone())
                .collect();
            child.remote.feed_inputs(values)
        }))
        .await?;

        // Execute in dependency waves: a worker runs once every foreign
        // send value it receives has been relayed to it.
        let mut pending: Vec<usize> = (0..self.children.len()).collect();
        let mut relay: HashMap<String, Vec<f32>> = HashMap::new();
        let mut merged: HashMap<OpId, Vec<f32>> = HashMap::new();

        while !pending.is_empty() {
            let ready: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|&i| {
                    self.children[i]
                        .recv_deps
                        .iter()
                        .all(|d| relay.contains_key(d))
                })
                .collect();
            if ready.is_empty() {
                let stuck: Vec<&str> = pending
                    .iter()
                    .map(|&i| self.children[i].owner.as_str())
                    .collect();
                return Err(DistError::Invoke(format!(
                    "cross-worker dependencies cannot be satisfied for {stuck:?}"
                )));
            }

            let mut wave = Vec::with_capacity(ready.len());
            for &i in &ready {
                let child = &self.children[i];
                let deps: Vec<(String, Vec<f32>)> = child
                    .recv_deps
                    .iter()
                    .map(|d| (d.clone(), relay[d].clone()))
                    .collect();
                wave.push(async move {
                    if !deps.is_empty() {
                        child.remote.feed_received(deps).await?;
                    }
                    let out = child.remote.collect_results().await?;
                    Ok::<(usize, Vec<(String, Vec<f32>)>), DistError>((i, out))
                });
            }
            for (i, out) in try_join_all(wave).await? {
                let child = &self.children[i];
                for &(id, slot) in &child.remote.result_map {
                    let value = out.get(slot).ok_or_else(|| {
                        DistError::Invoke(format!(
                            "{} returned no value in slot {slot}",
                            child.owner
                        ))
                    })?;
                    merged.insert(id, value.1.clone());
                }
                for (name, value) in &out {
                    if child.sends.contains(name) {
                        relay.insert(name.clone(), value.clone());
                    }
                }
            }
            pending.retain(|i| !ready.contains(i));
        }

        // Reshape into the declared returns shape.
        let missing = |id: OpId| {
            DistError::Invoke(format!(
                "no worker produced a value for {}",
                self.names.get(&id).cloned().unwrap_or_else(|| id.to_string())
            ))
        };
        match &self.returns {
            Returns::Single(id) => merged
                .remove(id)
                .map(CallResult::Single)
                .ok_or_else(|| missing(*id)),
            Returns::Sequence(ids) => ids
                .iter()
                .map(|id| merged.get(id).cloned().ok_or_else(|| missing(*id)))
                .collect::<Result<Vec<_>, _>>()
                .map(CallResult::Sequence),
            Returns::Set(ids) => ids
                .iter()
                .map(|id| {
                    let value = merged.get(id).cloned().ok_or_else(|| missing(*id))?;
                    Ok((self.names[id].clone(), value))
                })
                .collect::<Result<HashMap<_, _>, DistError>>()
                .map(CallResult::Set),
        }
    }

    /// Number of workers participating in this computation.
    pub fn num_workers(&self) -> usize {
        self.children.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_device_computation() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);
        let y = g.parameter("y", &[2]);
        let s = g.add("s", x, y);

        let mut orch = Orchestrator::new("cpu");
        let comp = Computation::new(vec![x, y], Returns::Single(s));
        let dist = orch.build(&mut g, &comp).await.unwrap();
        assert_eq!(dist.num_workers(), 1);

        let result = dist
            .call(&[vec![1.0, 2.0], vec![3.0, 4.0]])
            .await
            .unwrap();
        assert_eq!(result, CallResult::Single(vec![4.0, 6.0]));
        orch.close().await;
    }

    #[tokio::test]
    async fn cross_device_pipeline() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);
        let a = g.neg("a", x);
        let b = g.neg("b", a);
        g.on_device(b, "cpu", DeviceId::Single(1));

        let mut orch = Orchestrator::new("cpu");
        let comp = Computation::new(vec![x], Returns::Single(b));
        let dist = orch.build(&mut g, &comp).await.unwrap();
        assert_eq!(dist.num_workers(), 2);

        // neg(neg(x)) comes back unchanged, via a send on cpu0 and a recv
        // on cpu1.
        let result = dist.call(&[vec![1.5, -2.5]]).await.unwrap();
        assert_eq!(result, CallResult::Single(vec![1.5, -2.5]));
        orch.close().await;
    }

    #[tokio::test]
    async fn split_return_gathers_partials_under_one_identity() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);
        let y = g.neg("y", x);
        g.on_device(y, "cpu", DeviceId::Split(vec![0, 1]));

        let mut orch = Orchestrator::new("cpu");
        let comp = Computation::new(vec![x], Returns::Single(y));
        let dist = orch.build(&mut g, &comp).await.unwrap();
        assert_eq!(dist.num_workers(), 2);

        // Both workers emit a partial, the gather concatenates, and the
        // merged result appears under the original return's identity.
        let result = dist.call(&[vec![1.0, 2.0]]).await.unwrap();
        assert_eq!(
            result,
            CallResult::Single(vec![-1.0, -2.0, -1.0, -2.0])
        );
        orch.close().await;
    }

    #[tokio::test]
    async fn broadcast_parameter_shares_its_global_index() {
        let mut g = OpGraph::new();
        let p = g.parameter("p", &[1]);
        let q = g.parameter("q", &[1]);
        let a = g.add("a", p, q);
        let b = g.neg("b", p);
        g.on_device(b, "cpu", DeviceId::Single(1));

        let mut orch = Orchestrator::new("cpu");
        let comp = Computation::new(vec![p, q], Returns::Sequence(vec![a, b]));
        let dist = orch.build(&mut g, &comp).await.unwrap();

        // p is read on both devices: each worker's index map carries the
        // same global position 0 for it.
        let idx: Vec<&[usize]> = dist
            .children
            .iter()
            .map(|c| c.remote.param_idx.as_slice())
            .collect();
        assert_eq!(idx, vec![&[0usize, 1][..], &[0usize][..]]);

        let result = dist.call(&[vec![2.0], vec![3.0]]).await.unwrap();
        assert_eq!(result, CallResult::Sequence(vec![vec![5.0], vec![-2.0]]));
        orch.close().await;
    }

    #[tokio::test]
    async fn set_returns_merge_keyed_by_identity() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[1]);
        let a = g.neg("a", x);
        let b = g.add("b", x, x);
        g.on_device(b, "cpu", DeviceId::Single(1));

        let mut orch = Orchestrator::new("cpu");
        let comp = Computation::new(vec![x], Returns::Set(vec![a, b]));
        let dist = orch.build(&mut g, &comp).await.unwrap();

        let result = dist.call(&[vec![4.0]]).await.unwrap();
        let CallResult::Set(table) = result else {
            panic!("expected set result");
        };
        assert_eq!(table.len(), 2);
        assert_eq!(table["a"], vec![-4.0]);
        assert_eq!(table["b"], vec![8.0]);
        orch.close().await;
    }

    #[tokio::test]
    async fn unknown_device_fails_before_launch() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[1]);
        let y = g.neg("y", x);
        g.on_device(y, "tpu", DeviceId::Single(0));

        let mut orch = Orchestrator::new("cpu");
        let comp = Computation::new(vec![x], Returns::Single(y));
        let err = orch.build(&mut g, &comp).await.unwrap_err();
        assert!(matches!(err, DistError::Config(_)));
        assert_eq!(orch.launcher.worker_count(), 0);
    }

    #[tokio::test]
    async fn wrong_argument_count_is_an_invocation_error() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[1]);
        let y = g.neg("y", x);

        let mut orch = Orchestrator::new("cpu");
        let comp = Computation::new(vec![x], Returns::Single(y));
        let dist = orch.build(&mut g, &comp).await.unwrap();
        assert!(matches!(dist.call(&[]).await, Err(DistError::Invoke(_))));
        orch.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_rebuilds() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[1]);
        let y = g.neg("y", x);

        let mut orch = Orchestrator::new("cpu");
        let comp = Computation::new(vec![x], Returns::Single(y));
        orch.build(&mut g, &comp).await.unwrap();

        orch.close().await;
        assert!(orch.is_closed());
        orch.close().await;
        assert!(orch.is_closed());
        assert!(matches!(
            orch.build(&mut g, &comp).await,
            Err(DistError::Closed)
        ));
    }

    #[tokio::test]
    async fn rebuild_reuses_launched_workers() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[1]);
        let y = g.neg("y", x);

        let mut orch = Orchestrator::new("cpu");
        let comp = Computation::new(vec![x], Returns::Single(y));
        let first = orch.build(&mut g, &comp).await.unwrap();
        let second = orch.build(&mut g, &comp).await.unwrap();
        assert_eq!(orch.launcher.worker_count(), 1);

        assert_eq!(
            first.call(&[vec![3.0]]).await.unwrap(),
            second.call(&[vec![3.0]]).await.unwrap()
        );
        orch.close().await;
    }
}
