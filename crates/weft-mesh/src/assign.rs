//! Device assignment pass: tag every reachable node with a concrete owner.

use weft_graph::{DeviceId, OpGraph, OpId};

use crate::error::DistError;

/// Walks the closure of the requested roots and resolves each node's
/// device ownership.
///
/// An explicit per-node device hint always wins; otherwise the node
/// inherits the pass default. Split `device_id` declarations are left
/// un-normalized — the communication pass interprets them as split
/// ownership. When an explicit device list is configured, a node that
/// resolves outside that list is a configuration error rather than a
/// silent default.
pub struct DeviceAssignPass {
    default_device: String,
    default_device_id: u32,
    known_devices: Option<Vec<String>>,
}

impl DeviceAssignPass {
    pub fn new(default_device: &str, default_device_id: u32) -> Self {
        Self {
            default_device: default_device.to_string(),
            default_device_id,
            known_devices: None,
        }
    }

    /// Restrict resolution to an explicit device list.
    pub fn with_known_devices(mut self, devices: &[&str]) -> Self {
        self.known_devices = Some(devices.iter().map(|d| d.to_string()).collect());
        self
    }

    /// Run the pass over the closure of `roots`.
    ///
    /// Returns the distinct owner names seen, in discovery order, so the
    /// caller can register one worker per owner.
    pub fn run(&self, graph: &mut OpGraph, roots: &[OpId]) -> Result<Vec<String>, DistError> {
        let closure = graph.all_op_references(roots);
        let mut owners_seen: Vec<String> = Vec::new();

        for id in closure {
            let node = graph.node_mut(id);

            let device = match &node.meta.device {
                Some(d) => d.clone(),
                None => self.default_device.clone(),
            };
            if let Some(known) = &self.known_devices {
                if !known.iter().any(|k| k == &device) {
                    return Err(DistError::Config(format!(
                        "op {} resolves to device {device:?}, not in the configured device list",
                        node.name
                    )));
                }
            }
            node.meta.device = Some(device.clone());

            if node.meta.device_id == DeviceId::Unset {
                node.meta.device_id = DeviceId::Single(self.default_device_id);
            }

            // Owners are only filled once: the communication pass may have
            // appended broadcast owners that a re-run must not wipe.
            if node.meta.owners.is_empty() {
                node.meta.owners = match &node.meta.device_id {
                    DeviceId::Single(i) => vec![format!("{device}{i}")],
                    DeviceId::Split(ids) => {
                        ids.iter().map(|i| format!("{device}{i}")).collect()
                    }
                    DeviceId::Unset => unreachable!("device_id resolved above"),
                };
            }

            for owner in &node.meta.owners {
                if !owners_seen.contains(owner) {
                    owners_seen.push(owner.clone());
                }
            }
        }

        Ok(owners_seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_graph::DeviceId;

    #[test]
    fn default_fills_unhinted_nodes() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);
        let y = g.neg("y", x);

        let pass = DeviceAssignPass::new("cpu", 0);
        let owners = pass.run(&mut g, &[y]).unwrap();

        assert_eq!(owners, vec!["cpu0"]);
        assert_eq!(g.node(x).meta.owners, vec!["cpu0"]);
        assert_eq!(g.node(y).meta.device.as_deref(), Some("cpu"));
    }

    #[test]
    fn explicit_hint_wins() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);
        let y = g.neg("y", x);
        g.on_device(y, "cpu", DeviceId::Single(1));

        let pass = DeviceAssignPass::new("cpu", 0);
        let owners = pass.run(&mut g, &[y]).unwrap();

        assert_eq!(owners, vec!["cpu1", "cpu0"]);
        assert_eq!(g.node(y).meta.owners, vec!["cpu1"]);
    }

    #[test]
    fn split_ownership_is_left_unnormalized() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);
        g.on_device(x, "cpu", DeviceId::Split(vec![0, 1]));

        let pass = DeviceAssignPass::new("cpu", 0);
        let owners = pass.run(&mut g, &[x]).unwrap();

        assert_eq!(g.node(x).meta.device_id, DeviceId::Split(vec![0, 1]));
        assert_eq!(g.node(x).meta.owners, vec!["cpu0", "cpu1"]);
        assert_eq!(owners, vec!["cpu0", "cpu1"]);
    }

    #[test]
    fn unknown_device_is_a_config_error() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);
        g.on_device(x, "tpu", DeviceId::Single(0));

        let pass = DeviceAssignPass::new("cpu", 0).with_known_devices(&["cpu", "gpu"]);
        let err = pass.run(&mut g, &[x]).unwrap_err();
        assert!(matches!(err, DistError::Config(_)));
    }

    #[test]
    fn default_outside_device_list_is_a_config_error() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);

        let pass = DeviceAssignPass::new("cpu", 0).with_known_devices(&["gpu"]);
        let err = pass.run(&mut g, &[x]).unwrap_err();
        assert!(matches!(err, DistError::Config(_)));
    }

    #[test]
    fn rerun_preserves_broadcast_owners() {
        let mut g = OpGraph::new();
        let x = g.parameter("x", &[2]);

        let pass = DeviceAssignPass::new("cpu", 0);
        pass.run(&mut g, &[x]).unwrap();
        g.node_mut(x).meta.owners.push("cpu1".to_string());
        pass.run(&mut g, &[x]).unwrap();

        assert_eq!(g.node(x).meta.owners, vec!["cpu0", "cpu1"]);
    }
}
