//! Local execution collaborator.
//!
//! The numeric engine is out of scope for the distribution layer: a worker
//! hands its fully-assigned subgraph to a `LocalTransformer` and gets back
//! a callable computation. `RefTransformer` is the bundled reference
//! interpreter — a naive elementwise evaluator that stands in for a real
//! kernel engine so the orchestration path runs end to end.

use std::collections::HashMap;
use std::sync::Arc;

use weft_graph::{OpGraph, OpId, OpKind};

use crate::error::DistError;

/// A runnable sub-computation on one worker.
///
/// Implementations live behind an async lock shared by the worker's RPC
/// tasks, hence the `Send + Sync` bound.
pub trait LocalComputation: Send + Sync {
    /// Bind parameter values, in the worker's local feed order.
    fn feed_inputs(&mut self, values: Vec<Vec<f32>>) -> Result<(), String>;

    /// Deliver the value of a remote send node, keyed by its name.
    fn feed_received(&mut self, send_name: &str, value: Vec<f32>) -> Result<(), String>;

    /// Execute and return one value per return, in creation order.
    fn collect_results(&mut self) -> Result<Vec<(String, Vec<f32>)>, String>;
}

/// Compiles an assigned subgraph into a callable computation.
pub trait LocalTransformer: Send + Sync {
    fn compile(
        &self,
        graph: &OpGraph,
        returns: &[OpId],
        params: &[OpId],
    ) -> Result<Box<dyn LocalComputation>, String>;
}

/// Resolve the execution backend for a device name.
///
/// Fatal before any launch: a name containing `gpu` needs an accelerator
/// backend this build does not carry, and anything else unrecognized is an
/// unknown device.
pub fn backend_for(device: &str) -> Result<Arc<dyn LocalTransformer>, DistError> {
    if device.contains("cpu") {
        Ok(Arc::new(RefTransformer))
    } else if device.contains("gpu") {
        Err(DistError::Config(format!(
            "unable to initialize GPU backend for {device:?}, but a GPU device was requested"
        )))
    } else {
        Err(DistError::Config(format!("unknown device: {device:?}")))
    }
}

/// Reference interpreter backend.
pub struct RefTransformer;

impl LocalTransformer for RefTransformer {
    fn compile(
        &self,
        graph: &OpGraph,
        returns: &[OpId],
        params: &[OpId],
    ) -> Result<Box<dyn LocalComputation>, String> {
        Ok(Box::new(RefComputation {
            graph: graph.clone(),
            returns: returns.to_vec(),
            params: params.to_vec(),
            inputs: None,
            received: HashMap::new(),
        }))
    }
}

struct RefComputation {
    graph: OpGraph,
    returns: Vec<OpId>,
    params: Vec<OpId>,
    inputs: Option<Vec<Vec<f32>>>,
    received: HashMap<String, Vec<f32>>,
}

impl RefComputation {
    fn eval(&self, id: OpId, memo: &mut HashMap<OpId, Vec<f32>>) -> Result<Vec<f32>, String> {
        if let Some(v) = memo.get(&id) {
            return Ok(v.clone());
        }
        let node = self.graph.node(id);
        let out = match node.kind {
            OpKind::Parameter => {
                let pos = self
                    .params
                    .iter()
                    .position(|&p| p == id)
                    .ok_or_else(|| format!("parameter {} not owned by this worker", node.name))?;
                let inputs = self.inputs.as_ref().ok_or("inputs not fed")?;
                inputs
                    .get(pos)
                    .cloned()
                    .ok_or_else(|| format!("missing input for {}", node.name))?
            }
            OpKind::Constant(bits) => {
                let len = node.shape.iter().product::<u32>().max(1) as usize;
                vec![f64::from_bits(bits) as f32; len]
            }
            OpKind::Add => {
                let a = self.eval(node.args[0], memo)?;
                let b = self.eval(node.args[1], memo)?;
                zip_elementwise(&node.name, a, b, |x, y| x + y)?
            }
            OpKind::Mul => {
                let a = self.eval(node.args[0], memo)?;
                let b = self.eval(node.args[1], memo)?;
                zip_elementwise(&node.name, a, b, |x, y| x * y)?
            }
            OpKind::Neg => {
                let mut a = self.eval(node.args[0], memo)?;
                for v in &mut a {
                    *v = -*v;
                }
                a
            }
            OpKind::Send => self.eval(node.args[0], memo)?,
            OpKind::Recv => {
                let send = node.args[0];
                let send_name = &self.graph.node(send).name;
                match self.received.get(send_name) {
                    Some(v) => v.clone(),
                    // The send may live on this same worker (a gather
                    // pulling its local member); evaluate it in place.
                    None => self.eval(send, memo).map_err(|_| {
                        format!("value for {send_name} has not been received yet")
                    })?,
                }
            }
            OpKind::Gather => {
                let mut out = Vec::new();
                for &arg in &node.args {
                    out.extend(self.eval(arg, memo)?);
                }
                out
            }
        };
        memo.insert(id, out.clone());
        Ok(out)
    }
}

fn zip_elementwise(
    name: &str,
    a: Vec<f32>,
    b: Vec<f32>,
    f: impl Fn(f32, f32) -> f32,
) -> Result<Vec<f32>, String> {
    if a.len() != b.len() {
        return Err(format!(
            "shape mismatch at {name}: {} vs {} elements",
            a.len(),
            b.len()
        ));
    }
    Ok(a.into_iter().zip(b).map(|(x, y)| f(x, y)).collect())
}

impl LocalComputation for RefComputation {
    fn feed_inputs(&mut self, values: Vec<Vec<f32>>) -> Result<(), String> {
        if values.len() != self.params.len() {
            return Err(format!(
                "expected {} inputs, got {}",
                self.params.len(),
                values.len()
            ));
        }
        self.inputs = Some(values);
        Ok(())
    }

    fn feed_received(&mut self, send_name: &str, value: Vec<f32>) -> Result<(), String> {
        self.received.insert(send_name.to_string(), value);
        Ok(())
    }

    fn collect_results(&mut self) -> Result<Vec<(String, Vec<f32>)>, String> {
        let mut memo = HashMap::new();
        let mut out = Vec::with_capacity(self.returns.len());
        for &ret in &self.returns {
            let value = self.eval(ret, &mut memo)?;
            out.push((self.graph.node(ret).name.clone(), value));
        }
        Ok(out)
    }
}
