//! Error taxonomy of a dream run.
//!
//! Everything travels as `anyhow::Error`. A `DreamError` is either the root
//! cause (unknown layer or label) or attached as context on top of the
//! underlying failure, so callers can always `downcast_ref::<DreamError>()`.
use std::fmt;
use std::path::PathBuf;

use itertools::Itertools;

pub type DreamResult<T> = anyhow::Result<T>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DreamError {
    /// Model files missing or not decodable.
    ModelLoad { path: PathBuf },
    /// The split layer is not produced by any node.
    LayerNotFound { layer: String, available: Vec<String> },
    /// The dream label is not in the class table.
    LabelNotFound { label: String, classes: Vec<String> },
    /// A net could not be built from its graph.
    GraphInstantiation { net: String, node: String },
    /// A predict run failed. Iterations are counted from 1.
    Execution { iteration: usize },
}

impl fmt::Display for DreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DreamError::ModelLoad { path } => write!(f, "Failed to load model file {:?}", path),
            DreamError::LayerNotFound { layer, available } => write!(
                f,
                "Layer {:?} not found, available layers: {}",
                layer,
                available.iter().join(", ")
            ),
            DreamError::LabelNotFound { label, classes } => write!(
                f,
                "Image class label {:?} not found among {} classes: {}",
                label,
                classes.len(),
                classes.iter().join(", ")
            ),
            DreamError::GraphInstantiation { net, node } => {
                write!(f, "Failed to instantiate node {} of net {}", node, net)
            }
            DreamError::Execution { iteration } => {
                write!(f, "Execution failed at iteration {}", iteration)
            }
        }
    }
}

impl std::error::Error for DreamError {}

/// Find the `DreamError` in an error chain, root cause or context.
pub fn dream_error(e: &anyhow::Error) -> Option<&DreamError> {
    e.chain().find_map(|cause| cause.downcast_ref::<DreamError>()).or_else(|| e.downcast_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn context_is_found() {
        let e: anyhow::Error = Err::<(), _>(anyhow::anyhow!("nan in conv1"))
            .context(DreamError::Execution { iteration: 3 })
            .unwrap_err();
        assert_eq!(dream_error(&e), Some(&DreamError::Execution { iteration: 3 }));
        assert!(format!("{:#}", e).contains("nan in conv1"));
    }

    #[test]
    fn root_is_found() {
        let e = anyhow::Error::from(DreamError::LayerNotFound {
            layer: "conv9".into(),
            available: vec!["conv1".into(), "pool1".into()],
        });
        assert!(matches!(dream_error(&e), Some(DreamError::LayerNotFound { .. })));
        assert!(e.to_string().contains("conv1, pool1"));
    }
}
