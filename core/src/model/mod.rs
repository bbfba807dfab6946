//! # Graphs of named blobs
//!
//! A model is a pair of graphs (`ModelPair`): the init graph fills the
//! weights, the predict graph computes the network output. Nodes refer to
//! blobs by name only; the `Workspace` owns the tensors.
//!
//! This module also hosts the graph level passes that do not need to look
//! at tensor values: splitting a model at a layer and device placement.
mod graph;
mod loader;
mod node;
mod placement;
mod split;

pub use self::graph::{GraphDef, ModelPair};
pub use self::loader::{graph_for_path, graph_for_reader, ModelFiles};
pub use self::node::{ArgValue, Device, DeviceType, OperatorNode};
pub use self::placement::{place_on_accelerator, place_on_host};
pub use self::split::{check_layer_available, split, Split};
