use std::collections::HashSet;
use std::fmt;

use itertools::Itertools;

use crate::errors::DreamResult;
use crate::model::OperatorNode;

/// An ordered list of nodes, with its external inputs and outputs.
///
/// External input 0 is the primary input, external output 0 the primary
/// output. Nodes run in declaration order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphDef {
    pub name: String,
    pub nodes: Vec<OperatorNode>,
    pub external_inputs: Vec<String>,
    pub external_outputs: Vec<String>,
}

impl GraphDef {
    pub fn named(name: impl Into<String>) -> GraphDef {
        GraphDef { name: name.into(), ..GraphDef::default() }
    }

    pub fn node(mut self, node: OperatorNode) -> GraphDef {
        self.nodes.push(node);
        self
    }

    pub fn with_external_inputs<S: Into<String>>(
        mut self,
        inputs: impl IntoIterator<Item = S>,
    ) -> GraphDef {
        self.external_inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_external_outputs<S: Into<String>>(
        mut self,
        outputs: impl IntoIterator<Item = S>,
    ) -> GraphDef {
        self.external_outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn push(&mut self, node: OperatorNode) {
        self.nodes.push(node);
    }

    pub fn primary_input(&self) -> DreamResult<&str> {
        self.external_inputs
            .first()
            .map(|s| &**s)
            .ok_or_else(|| anyhow::anyhow!("Graph {:?} has no external input", self.name))
    }

    pub fn primary_output(&self) -> DreamResult<&str> {
        self.external_outputs
            .first()
            .map(|s| &**s)
            .ok_or_else(|| anyhow::anyhow!("Graph {:?} has no external output", self.name))
    }

    /// Blob names produced by the graph nodes, first occurence order, no
    /// duplicates. These are the valid split layers.
    pub fn layers(&self) -> Vec<String> {
        self.nodes.iter().flat_map(|n| n.outputs.iter()).unique().cloned().collect()
    }

    pub fn produces(&self, blob: &str) -> bool {
        self.nodes.iter().any(|n| n.outputs.iter().any(|o| o == blob))
    }

    /// Index of the first node writing `blob`.
    pub fn first_producer(&self, blob: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.outputs.iter().any(|o| o == blob))
    }

    /// All blobs read by at least one node.
    pub fn consumed(&self) -> HashSet<&str> {
        self.nodes.iter().flat_map(|n| n.inputs.iter().map(|s| &**s)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl fmt::Display for GraphDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "graph {:?} ({}) -> ({})",
            self.name,
            self.external_inputs.iter().join(", "),
            self.external_outputs.iter().join(", ")
        )?;
        for (ix, node) in self.nodes.iter().enumerate() {
            writeln!(f, "  #{} {}", ix, node)?;
        }
        Ok(())
    }
}

/// Init and predict graphs of a model.
#[derive(Clone, Debug, Default, PartialEq, new)]
pub struct ModelPair {
    pub init: GraphDef,
    pub predict: GraphDef,
}

impl ModelPair {
    pub fn graphs_mut(&mut self) -> [&mut GraphDef; 2] {
        [&mut self.init, &mut self.predict]
    }
}
