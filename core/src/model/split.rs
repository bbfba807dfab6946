use std::collections::HashSet;

use crate::errors::{DreamError, DreamResult};
use crate::model::{place_on_host, GraphDef, ModelPair, OperatorNode};

/// The two halves of a model split at a layer.
///
/// The prefix computes the layer from the model input, the suffix computes
/// the model output from the layer.
#[derive(Clone, Debug, PartialEq)]
pub struct Split {
    pub prefix: ModelPair,
    pub suffix: ModelPair,
}

/// Fail with `LayerNotFound` unless some node of `predict` produces `layer`.
pub fn check_layer_available(predict: &GraphDef, layer: &str) -> DreamResult<()> {
    if predict.produces(layer) {
        Ok(())
    } else {
        Err(DreamError::LayerNotFound { layer: layer.to_string(), available: predict.layers() }
            .into())
    }
}

/// Split a model at the first node producing `layer`.
///
/// Nodes right after the producer rewriting `layer` in place stay with the
/// prefix, so the boundary blob holds its final value. With `force_cpu`, all
/// device tags of the four graphs are reset to the host.
pub fn split(full: &ModelPair, layer: &str, force_cpu: bool) -> DreamResult<Split> {
    let predict = &full.predict;
    let Some(first) = predict.first_producer(layer) else {
        return Err(DreamError::LayerNotFound {
            layer: layer.to_string(),
            available: predict.layers(),
        }
        .into());
    };
    let mut split = if predict.external_outputs.first().map(|s| &**s) == Some(layer) {
        Split {
            prefix: full.clone(),
            suffix: ModelPair::new(
                GraphDef::named(&full.init.name),
                GraphDef::named(&predict.name)
                    .with_external_inputs([layer])
                    .with_external_outputs(predict.external_outputs.iter().cloned()),
            ),
        }
    } else {
        let mut end = first + 1;
        while end < predict.nodes.len() && rewrites_in_place(&predict.nodes[end], layer) {
            end += 1;
        }
        debug!(
            "Splitting {:?} at {:?}: {} + {} nodes",
            predict.name,
            layer,
            end,
            predict.nodes.len() - end
        );
        let (head, tail) = predict.nodes.split_at(end);

        let mut prefix = GraphDef::named(&predict.name);
        prefix.nodes = head.to_vec();
        prefix.external_inputs = consumed_externals(predict, head);
        if let Some(primary) = predict.external_inputs.first() {
            if !prefix.external_inputs.contains(primary) {
                prefix.external_inputs.insert(0, primary.clone());
            }
        }
        prefix.external_outputs = vec![layer.to_string()];

        let mut suffix = GraphDef::named(&predict.name);
        suffix.nodes = tail.to_vec();
        suffix.external_inputs = std::iter::once(layer.to_string())
            .chain(consumed_externals(predict, tail))
            .collect();
        suffix.external_outputs = predict.external_outputs.clone();

        let produced_by_head: HashSet<&str> =
            head.iter().flat_map(|n| n.outputs.iter().map(|s| &**s)).collect();
        let dangling: Vec<&str> = suffix
            .consumed()
            .into_iter()
            .filter(|b| *b != layer && produced_by_head.contains(b))
            .collect();
        if !dangling.is_empty() {
            debug!("Suffix of {:?} also reads prefix blobs {:?}", predict.name, dangling);
        }

        Split {
            prefix: ModelPair::new(filter_init(&full.init, &prefix), prefix),
            suffix: ModelPair::new(filter_init(&full.init, &suffix), suffix),
        }
    };
    if force_cpu {
        for pair in [&mut split.prefix, &mut split.suffix] {
            for graph in pair.graphs_mut() {
                place_on_host(graph);
            }
        }
    }
    Ok(split)
}

fn rewrites_in_place(node: &OperatorNode, layer: &str) -> bool {
    node.outputs.iter().any(|o| o == layer) && node.inputs.iter().any(|i| i == layer)
}

fn consumed_externals(full: &GraphDef, nodes: &[OperatorNode]) -> Vec<String> {
    full.external_inputs
        .iter()
        .filter(|input| nodes.iter().any(|n| n.inputs.contains(*input)))
        .cloned()
        .collect()
}

fn filter_init(init: &GraphDef, predict: &GraphDef) -> GraphDef {
    let consumed = predict.consumed();
    let mut filtered = GraphDef::named(&init.name);
    filtered.nodes = init
        .nodes
        .iter()
        .filter(|n| n.outputs.iter().any(|o| consumed.contains(&**o)))
        .cloned()
        .collect();
    filtered.external_inputs = init.external_inputs.clone();
    filtered.external_outputs =
        init.external_outputs.iter().filter(|o| filtered.produces(o)).cloned().collect();
    filtered
}
