//! A graph bound to kernels, runtimes and workspace blobs.
use std::sync::Arc;

use itertools::Itertools;

use crate::errors::{DreamError, DreamResult};
use crate::model::{GraphDef, OperatorNode};
use crate::ops::{Kernel, OpKind, OpRegister};
use crate::runtime::{Runtime, Runtimes};
use crate::workspace::{BlobRole, Workspace};
use dream_data::internal::*;

/// Which write rules a net follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetKind {
    /// Runs once and declares every blob it writes as a constant.
    Init,
    /// Runs every iteration. Only bookkeeping nodes may rewrite init blobs,
    /// only `WeightedSum` may rewrite the parameter.
    Predict,
}

#[derive(Debug)]
struct NetNode {
    node: OperatorNode,
    kernel: Box<dyn Kernel>,
    runtime: Arc<dyn Runtime>,
    accumulate: TVec<usize>,
}

#[derive(Debug)]
pub struct Net {
    pub name: String,
    pub kind: NetKind,
    nodes: Vec<NetNode>,
}

impl Net {
    /// Build kernels for every node, check them against the facts declared
    /// in the workspace and declare their outputs.
    pub fn instantiate(
        graph: &GraphDef,
        kind: NetKind,
        workspace: &mut Workspace,
        registry: &OpRegister,
        runtimes: &Runtimes,
    ) -> DreamResult<Net> {
        let name = if graph.name.is_empty() { format!("{:?}", kind) } else { graph.name.clone() };
        let mut nodes = vec![];
        for node in &graph.nodes {
            let net_node =
                Self::instantiate_node(node, kind, workspace, registry, runtimes).with_context(
                    || DreamError::GraphInstantiation { net: name.clone(), node: node.label() },
                )?;
            nodes.push(net_node);
        }
        debug!("Instantiated net {} with {} nodes", name, nodes.len());
        Ok(Net { name, kind, nodes })
    }

    fn instantiate_node(
        node: &OperatorNode,
        kind: NetKind,
        workspace: &mut Workspace,
        registry: &OpRegister,
        runtimes: &Runtimes,
    ) -> DreamResult<NetNode> {
        let runtime = runtimes.for_device(&node.device)?;
        let kernel = registry.build(node)?;
        let input_facts = node
            .inputs
            .iter()
            .map(|input| {
                workspace
                    .fact(input)
                    .cloned()
                    .ok_or_else(|| format_err!("Blob {} is read before being written", input))
            })
            .collect::<DreamResult<TVec<BlobFact>>>()?;
        let input_facts: TVec<&BlobFact> = input_facts.iter().collect();
        let output_facts = kernel.output_facts(&input_facts)?;
        ensure!(
            output_facts.len() == node.outputs.len(),
            "{} computes {} outputs, node declares {}",
            kernel.name(),
            output_facts.len(),
            node.outputs.len()
        );
        let accumulate: TVec<usize> = node
            .get_arg_opt_ints("accumulate")?
            .unwrap_or(&[])
            .iter()
            .map(|&slot| {
                usize::try_from(slot)
                    .ok()
                    .filter(|s| *s < node.outputs.len())
                    .ok_or_else(|| format_err!("Invalid accumulate slot {}", slot))
            })
            .collect::<DreamResult<_>>()?;
        for (slot, (output, fact)) in node.outputs.iter().zip(output_facts).enumerate() {
            if accumulate.contains(&slot) {
                ensure!(
                    workspace.fact(output) == Some(&fact),
                    "Accumulating {} into {}, declared {:?}",
                    fact,
                    output,
                    workspace.fact(output)
                );
                continue;
            }
            Self::check_write(node, kind, workspace, output)?;
            let role = match kind {
                NetKind::Init => BlobRole::Constant,
                NetKind::Predict if node.op.is_bookkeeping() => BlobRole::State,
                NetKind::Predict => BlobRole::Scratch,
            };
            workspace.declare(output, fact, role)?;
        }
        Ok(NetNode { node: node.clone(), kernel, runtime, accumulate })
    }

    fn check_write(
        node: &OperatorNode,
        kind: NetKind,
        workspace: &Workspace,
        output: &str,
    ) -> DreamResult<()> {
        if kind == NetKind::Init {
            return Ok(());
        }
        if workspace.is_parameter(output) {
            ensure!(
                node.op == OpKind::WeightedSum,
                "Only the update node may write the parameter {}",
                output
            );
            return Ok(());
        }
        match workspace.role(output) {
            Some(BlobRole::Constant) | Some(BlobRole::State) => ensure!(
                node.op.is_bookkeeping(),
                "Blob {} belongs to the init net and can not be written by {}",
                output,
                node.op
            ),
            Some(BlobRole::Scratch) | None => (),
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Run every node once, in order.
    ///
    /// Outputs are checked against their declared facts and must be finite.
    pub fn run(&self, workspace: &mut Workspace) -> DreamResult<()> {
        for node in &self.nodes {
            Self::run_node(node, workspace)
                .with_context(|| format!("Running {} in net {}", node.node.label(), self.name))?;
        }
        Ok(())
    }

    fn run_node(node: &NetNode, workspace: &mut Workspace) -> DreamResult<()> {
        let inputs = node
            .node
            .inputs
            .iter()
            .map(|input| workspace.get_arc(input))
            .collect::<DreamResult<TVec<Arc<Tensor>>>>()?;
        let refs: TVec<&Tensor> = inputs.iter().map(|t| &**t).collect();
        let outputs = node.runtime.eval(&*node.kernel, &refs)?;
        ensure!(
            outputs.len() == node.node.outputs.len(),
            "{} returned {} outputs, expected {}",
            node.kernel.name(),
            outputs.len(),
            node.node.outputs.len()
        );
        trace!(
            "{} on {}: {} -> {}",
            node.node.label(),
            node.runtime.name(),
            refs.iter().map(|t| t.fact()).join(", "),
            outputs.iter().map(|t| t.fact()).join(", ")
        );
        for (slot, (name, value)) in node.node.outputs.iter().zip(outputs).enumerate() {
            ensure!(value.is_finite(), "Non finite value in {} output {}", node.node.label(), name);
            let value = if node.accumulate.contains(&slot) {
                accumulate(workspace.get(name)?, value)?
            } else {
                value
            };
            workspace.set(name, value)?;
        }
        Ok(())
    }
}

fn accumulate(acc: &Tensor, value: Tensor) -> DreamResult<Tensor> {
    ensure!(acc.fact() == value.fact(), "Can not add {} to {}", value.fact(), acc.fact());
    let mut value = value;
    for (v, a) in value.as_slice_mut::<f32>()?.iter_mut().zip(acc.as_slice::<f32>()?) {
        *v += a;
    }
    Ok(value)
}
