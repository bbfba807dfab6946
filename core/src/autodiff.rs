//! Reverse-mode gradient pass over a predict graph.
//!
//! Each forward node gets exactly one gradient node, appended in reverse
//! order. The gradient node kind comes from `OpKind::gradient`, and the
//! wiring conventions below must agree with the gradient kernels in `ops`:
//!
//! * the upstream gradient dY is always the last input,
//! * outputs follow the order of the differentiated forward inputs,
//! * the gradient of blob `x` is named `x_grad`.
use std::collections::HashSet;

use crate::errors::DreamResult;
use crate::model::{GraphDef, OperatorNode};
use crate::ops::OpKind;
use dream_data::internal::*;

pub fn grad_name(blob: &str) -> String {
    format!("{}_grad", blob)
}

/// Forward blobs read by the gradient kernel, before dY.
fn gradient_inputs(node: &OperatorNode) -> Vec<String> {
    use OpKind::*;
    let input = |ix: usize| node.inputs.get(ix).cloned();
    let output = |ix: usize| node.outputs.get(ix).cloned();
    match node.op {
        Conv | FC | LabelCrossEntropy => [input(0), input(1)].into_iter().flatten().collect(),
        Relu | Softmax => output(0).into_iter().collect(),
        MaxPool | AveragePool | LRN => [input(0), output(0)].into_iter().flatten().collect(),
        Concat => node.inputs.clone(),
        Reshape | Slice | ReduceBackMean | AveragedLoss => input(0).into_iter().collect(),
        _ => vec![],
    }
}

/// Forward inputs the gradient node differentiates, in output order.
fn differentiated(node: &OperatorNode) -> &[String] {
    match node.op {
        OpKind::Conv | OpKind::FC | OpKind::Concat => &node.inputs,
        _ => &node.inputs[..node.inputs.len().min(1)],
    }
}

/// Append the gradient of `objective` with respect to every blob of the
/// graph. Returns the number of gradient nodes added.
///
/// The node producing the objective is seeded with an upstream gradient of
/// ones. A blob read by several nodes gets the sum of their contributions.
pub fn add_gradient_ops(graph: &mut GraphDef, objective: &str) -> DreamResult<usize> {
    ensure!(graph.produces(objective), "Objective {} is not produced by the graph", objective);
    let forward = graph.nodes.clone();
    let mut written: HashSet<String> = HashSet::new();
    let mut seeded = false;
    for node in forward.iter().rev() {
        let Some(y) = node.outputs.first() else {
            bail!("Node {} has no output", node.label())
        };
        let seed = !seeded && y == objective;
        ensure!(
            seed || written.contains(&grad_name(y)),
            "Node {} does not contribute to the objective {}",
            node.label(),
            objective
        );
        let Some(kind) = node.op.gradient() else {
            bail!("Node {} is not differentiable", node.label())
        };
        let mut grad = OperatorNode::new(kind).device(node.device);
        if !node.name.is_empty() {
            grad = grad.name(grad_name(&node.name));
        }
        for (k, v) in &node.args {
            grad = grad.arg(k.clone(), v.clone());
        }
        for input in gradient_inputs(node) {
            grad = grad.input(input);
        }
        if seed {
            let slot = grad.inputs.len() as i64;
            grad = grad.arg("seed", slot).input(objective);
            seeded = true;
        } else {
            grad = grad.input(grad_name(y));
        }
        let mut accumulate = vec![];
        for (slot, x) in differentiated(node).iter().enumerate() {
            let dx = grad_name(x);
            // in place forward nodes rewrite their own gradient
            if written.contains(&dx) && !node.outputs.contains(x) {
                accumulate.push(slot as i64);
            }
            grad = grad.output(dx.clone());
            written.insert(dx);
        }
        if !accumulate.is_empty() {
            grad = grad.arg("accumulate", accumulate);
        }
        debug!("Gradient of {}: {}", node.label(), grad);
        graph.push(grad);
    }
    Ok(forward.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> GraphDef {
        GraphDef::default()
            .node(
                OperatorNode::new(OpKind::Conv)
                    .name("conv1")
                    .input("data")
                    .input("w")
                    .input("b")
                    .output("conv1")
                    .arg("kernel", 1i64),
            )
            .node(OperatorNode::new(OpKind::Relu).input("conv1").output("conv1"))
            .node(OperatorNode::new(OpKind::ReduceBackMean).input("conv1").output("score"))
            .with_external_inputs(["data"])
            .with_external_outputs(["score"])
    }

    #[test]
    fn one_gradient_per_node_in_reverse() {
        let mut graph = chain();
        assert_eq!(add_gradient_ops(&mut graph, "score").unwrap(), 3);
        let kinds: Vec<_> = graph.nodes[3..].iter().map(|n| n.op.clone()).collect();
        assert_eq!(
            kinds,
            vec![OpKind::ReduceBackMeanGradient, OpKind::ReluGradient, OpKind::ConvGradient]
        );
        let mean = &graph.nodes[3];
        assert_eq!(mean.inputs, vec!["conv1", "score"]);
        assert_eq!(mean.get_arg_int("seed").unwrap(), 1);
        let relu = &graph.nodes[4];
        assert_eq!(relu.inputs, vec!["conv1", "conv1_grad"]);
        assert_eq!(relu.outputs, vec!["conv1_grad"]);
        assert!(!relu.has_arg("accumulate"));
        let conv = &graph.nodes[5];
        assert_eq!(conv.name, "conv1_grad");
        assert_eq!(conv.inputs, vec!["data", "w", "conv1_grad"]);
        assert_eq!(conv.outputs, vec!["data_grad", "w_grad", "b_grad"]);
        assert_eq!(conv.get_arg_int("kernel").unwrap(), 1);
    }

    #[test]
    fn fan_out_accumulates() {
        let mut graph = GraphDef::default()
            .node(OperatorNode::new(OpKind::Relu).input("data").output("a"))
            .node(OperatorNode::new(OpKind::Concat).input("a").input("a").output("c"))
            .node(OperatorNode::new(OpKind::AveragedLoss).input("c").output("score"));
        add_gradient_ops(&mut graph, "score").unwrap();
        let concat = &graph.nodes[4];
        assert_eq!(concat.inputs, vec!["a", "a", "c_grad"]);
        assert_eq!(concat.outputs, vec!["a_grad", "a_grad"]);
        assert_eq!(concat.get_arg_ints("accumulate").unwrap(), &[1]);
    }

    #[test]
    fn dead_branch_is_an_error() {
        let mut graph = GraphDef::default()
            .node(OperatorNode::new(OpKind::Relu).input("data").output("unused"))
            .node(OperatorNode::new(OpKind::AveragedLoss).input("data").output("score"));
        assert!(add_gradient_ops(&mut graph, "score").is_err());
    }

    #[test]
    fn bookkeeping_is_not_differentiable() {
        let mut graph = GraphDef::default()
            .node(OperatorNode::new(OpKind::Iter).input("iter").output("score"));
        assert!(add_gradient_ops(&mut graph, "score").is_err());
        let mut graph = chain();
        assert!(add_gradient_ops(&mut graph, "nope").is_err());
    }
}
