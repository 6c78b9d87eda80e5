//! Communication insertion pass: bridge cross-device edges with
//! send/receive pairs.

use std::collections::HashMap;

use weft_graph::{DeviceId, OpGraph, OpId, OpKind};

use crate::error::DistError;

/// A send/receive pair bridging one (producer, consumer-device) edge.
#[derive(Clone, Copy, Debug)]
struct Bridge {
    send: OpId,
    recv: OpId,
}

/// Rewrites every edge whose producer and consumer resolve to different
/// owners: the producer gains a send node on its own device, the consumer
/// references a receive node instead of the producer.
///
/// The pass owns the process-wide ordered send set — a single cross-device
/// value may be consumed by many remote nodes, and each of its sends must
/// be attributed to exactly one worker. The `(producer, consumer-device)`
/// bridge cache makes the pass idempotent: an edge already bridged reuses
/// the recorded pair instead of inserting a duplicate.
///
/// Two special producers:
/// - Parameters broadcast: a parameter read from a foreign device is not
///   bridged, the consumer's owner is appended to its owner list so both
///   workers feed it at the same global index.
/// - Split producers may only be consumed by their gather wrapper
///   (pre-annotation precondition); the gather's split argument expands to
///   one send/receive pair per split member.
pub struct CommunicationPass {
    send_nodes: Vec<OpId>,
    bridged: HashMap<(OpId, String), Bridge>,
}

impl CommunicationPass {
    pub fn new() -> Self {
        Self {
            send_nodes: Vec::new(),
            bridged: HashMap::new(),
        }
    }

    /// The ordered set of send nodes inserted so far, across all runs.
    pub fn send_nodes(&self) -> &[OpId] {
        &self.send_nodes
    }

    /// Run the pass over the closure of `roots`. Device assignment must
    /// have resolved owners for every reachable node first.
    pub fn run(&mut self, graph: &mut OpGraph, roots: &[OpId]) -> Result<(), DistError> {
        let closure = graph.all_op_references(roots);

        for &id in &closure {
            if graph.node(id).meta.owners.is_empty() {
                return Err(DistError::Partition(format!(
                    "op {} has no resolvable device; run device assignment first",
                    graph.node(id).name
                )));
            }
        }

        for &consumer in &closure {
            let ckind = graph.node(consumer).kind;
            // Send/recv edges are the bridges themselves.
            if matches!(ckind, OpKind::Send | OpKind::Recv) {
                continue;
            }
            let args = graph.node(consumer).args.clone();
            if args.is_empty() {
                continue;
            }
            let cowners = graph.node(consumer).meta.owners.clone();

            if cowners.len() > 1 {
                self.check_split_consumer(graph, consumer, &args, &cowners)?;
                continue;
            }
            let cowner = cowners[0].clone();

            let mut new_args: Vec<OpId> = Vec::with_capacity(args.len());
            let mut changed = false;
            for &producer in &args {
                let pkind = graph.node(producer).kind;
                let powners = graph.node(producer).meta.owners.clone();

                if pkind == OpKind::Parameter {
                    // Broadcast: the parameter appears in this worker's
                    // feed order too, at the same global position.
                    if !powners.contains(&cowner) {
                        graph.node_mut(producer).meta.owners.push(cowner.clone());
                    }
                    new_args.push(producer);
                    continue;
                }

                if powners.len() > 1 {
                    if ckind != OpKind::Gather {
                        return Err(DistError::Partition(format!(
                            "split op {} consumed by {}, which is not its gather point; \
                             split outputs must be pre-annotated requested returns",
                            graph.node(producer).name,
                            graph.node(consumer).name
                        )));
                    }
                    let member_ids = match graph.node(producer).meta.device_id.clone() {
                        DeviceId::Split(ids) => ids,
                        other => {
                            return Err(DistError::Partition(format!(
                                "op {} has {} owners but device_id {other:?}",
                                graph.node(producer).name,
                                powners.len()
                            )))
                        }
                    };
                    for (m_owner, m_id) in powners.iter().zip(member_ids) {
                        let key = (producer, format!("{m_owner}->{cowner}"));
                        let bridge = match self.bridged.get(&key) {
                            Some(b) => *b,
                            None => {
                                let b = self.insert_bridge(
                                    graph, producer, m_id, m_owner, consumer, &cowner,
                                );
                                self.bridged.insert(key, b);
                                b
                            }
                        };
                        new_args.push(bridge.recv);
                    }
                    changed = true;
                    continue;
                }

                let powner = powners[0].clone();
                if powner != cowner {
                    let key = (producer, cowner.clone());
                    let bridge = match self.bridged.get(&key) {
                        Some(b) => *b,
                        None => {
                            let m_id = match graph.node(producer).meta.device_id {
                                DeviceId::Single(i) => i,
                                _ => 0,
                            };
                            let b = self.insert_bridge(
                                graph, producer, m_id, &powner, consumer, &cowner,
                            );
                            self.bridged.insert(key, b);
                            b
                        }
                    };
                    new_args.push(bridge.recv);
                    changed = true;
                } else {
                    new_args.push(producer);
                }
            }
            if changed {
                graph.node_mut(consumer).args = new_args;
            }
        }
        Ok(())
    }

    /// Split-owned consumers never cross devices themselves: every argument
    /// must share the split ownership, except broadcast parameters.
    fn check_split_consumer(
        &self,
        graph: &mut OpGraph,
        consumer: OpId,
        args: &[OpId],
        cowners: &[String],
    ) -> Result<(), DistError> {
        for &producer in args {
            if graph.node(producer).kind == OpKind::Parameter {
                for o in cowners {
                    if !graph.node(producer).meta.owners.contains(o) {
                        graph.node_mut(producer).meta.owners.push(o.clone());
                    }
                }
            } else if graph.node(producer).meta.owners != cowners {
                return Err(DistError::Partition(format!(
                    "split op {} reads {} with mismatched ownership",
                    graph.node(consumer).name,
                    graph.node(producer).name
                )));
            }
        }
        Ok(())
    }

    fn insert_bridge(
        &mut self,
        graph: &mut OpGraph,
        producer: OpId,
        producer_id: u32,
        producer_owner: &str,
        consumer: OpId,
        consumer_owner: &str,
    ) -> Bridge {
        let send = graph.send(producer);
        let producer_device = graph.node(producer).meta.device.clone();
        {
            let meta = &mut graph.node_mut(send).meta;
            meta.device = producer_device;
            meta.device_id = DeviceId::Single(producer_id);
            meta.owners = vec![producer_owner.to_string()];
        }

        let recv = graph.recv(send);
        let consumer_device = graph.node(consumer).meta.device.clone();
        let consumer_id = match graph.node(consumer).meta.device_id {
            DeviceId::Single(i) => i,
            _ => 0,
        };
        {
            let meta = &mut graph.node_mut(recv).meta;
            meta.device = consumer_device;
            meta.device_id = DeviceId::Single(consumer_id);
            meta.owners = vec![consumer_owner.to_string()];
        }

        self.send_nodes.push(send);
        Bridge { send, recv }
    }
}

impl Default for CommunicationPass {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assign::DeviceAssignPass;
    use weft_graph::DeviceId;

    fn assign(graph: &mut OpGraph, roots: &[OpId]) {
        DeviceAssignPass::new("cpu", 0).run(graph, roots).unwrap();
    }

    /// No non-bridge edge may connect nodes without a shared owner.
    fn assert_no_cross_device_edges(graph: &OpGraph, roots: &[OpId]) {
        for id in graph.all_op_references(roots) {
            let node = graph.node(id);
            if node.kind == OpKind::Recv {
                continue;
            }
            for &arg in &node.args {
                let shared = graph
                    .node(arg)
                    .meta
                    .owners
                    .iter()
                    .any(|o| node.meta.owners.contains(o));
                assert!(
                    shared,
                    "edge {} -> {} crosses devices after insertion",
                    graph.node(arg).name,
                    node.name
                );
            }
        }
    }

    #[test]
    fn single_cross_device_edge() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);
        let a = g.neg("a", x);
        g.on_device(a, "cpu", DeviceId::Single(0));
        g.on_device(x, "cpu", DeviceId::Single(0));
        let b = g.neg("b", a);
        g.on_device(b, "cpu", DeviceId::Single(1));
        assign(&mut g, &[b]);

        let mut pass = CommunicationPass::new();
        pass.run(&mut g, &[b]).unwrap();

        assert_eq!(pass.send_nodes().len(), 1);
        let send = pass.send_nodes()[0];
        assert_eq!(g.node(send).kind, OpKind::Send);
        assert_eq!(g.node(send).args, vec![a]);
        assert_eq!(g.node(send).meta.owners, vec!["cpu0"]);

        let recv = g.node(b).args[0];
        assert_eq!(g.node(recv).kind, OpKind::Recv);
        assert_eq!(g.node(recv).args, vec![send]);
        assert_eq!(g.node(recv).meta.owners, vec!["cpu1"]);

        assert_no_cross_device_edges(&g, &[b]);
    }

    #[test]
    fn insertion_is_idempotent() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);
        let a = g.neg("a", x);
        let b = g.neg("b", a);
        g.on_device(b, "cpu", DeviceId::Single(1));
        assign(&mut g, &[b]);

        let mut pass = CommunicationPass::new();
        pass.run(&mut g, &[b]).unwrap();
        let sends_after_first = pass.send_nodes().to_vec();
        let graph_len = g.len();

        pass.run(&mut g, &[b]).unwrap();
        assert_eq!(pass.send_nodes(), sends_after_first.as_slice());
        assert_eq!(g.len(), graph_len);
    }

    #[test]
    fn one_send_shared_by_many_remote_consumers() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);
        let a = g.neg("a", x);
        let b = g.neg("b", a);
        let c = g.neg("c", a);
        g.on_device(b, "cpu", DeviceId::Single(1));
        g.on_device(c, "cpu", DeviceId::Single(1));
        assign(&mut g, &[b, c]);

        let mut pass = CommunicationPass::new();
        pass.run(&mut g, &[b, c]).unwrap();

        assert_eq!(pass.send_nodes().len(), 1);
        // Both consumers reference the same receive node.
        assert_eq!(g.node(b).args, g.node(c).args);
        assert_no_cross_device_edges(&g, &[b, c]);
    }

    #[test]
    fn parameters_broadcast_instead_of_bridging() {
        let mut g = OpGraph::new();
        let p = g.parameter("p", &[2]);
        let a = g.neg("a", p);
        let b = g.neg("b", p);
        g.on_device(b, "cpu", DeviceId::Single(1));
        assign(&mut g, &[a, b]);

        let mut pass = CommunicationPass::new();
        pass.run(&mut g, &[a, b]).unwrap();

        assert!(pass.send_nodes().is_empty());
        assert_eq!(g.node(p).meta.owners, vec!["cpu0", "cpu1"]);
        assert_no_cross_device_edges(&g, &[a, b]);
    }

    #[test]
    fn split_producer_expands_under_gather() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);
        let y = g.neg("y", x);
        g.on_device(y, "cpu", DeviceId::Split(vec![0, 1]));
        g.on_device(x, "cpu", DeviceId::Split(vec![0, 1]));
        let w = g.gather(y);
        assign(&mut g, &[w]);

        let mut pass = CommunicationPass::new();
        pass.run(&mut g, &[w]).unwrap();

        assert_eq!(pass.send_nodes().len(), 2);
        let gather_args = g.node(w).args.clone();
        assert_eq!(gather_args.len(), 2);
        for (i, &recv) in gather_args.iter().enumerate() {
            assert_eq!(g.node(recv).kind, OpKind::Recv);
            let send = g.node(recv).args[0];
            assert_eq!(g.node(send).args, vec![y]);
            assert_eq!(g.node(send).meta.owners, vec![format!("cpu{i}")]);
        }
    }

    #[test]
    fn split_producer_without_gather_is_rejected() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);
        let y = g.neg("y", x);
        g.on_device(y, "cpu", DeviceId::Split(vec![0, 1]));
        g.on_device(x, "cpu", DeviceId::Split(vec![0, 1]));
        let z = g.neg("z", y);
        assign(&mut g, &[z]);

        let mut pass = CommunicationPass::new();
        let err = pass.run(&mut g, &[z]).unwrap_err();
        assert!(matches!(err, DistError::Partition(_)));
    }

    #[test]
    fn unassigned_graph_is_a_partition_error() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);

        let mut pass = CommunicationPass::new();
        let err = pass.run(&mut g, &[x]).unwrap_err();
        assert!(matches!(err, DistError::Partition(_)));
    }
}
