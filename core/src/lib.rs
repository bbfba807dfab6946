//! # Dream core
//!
//! Graph surgery and input optimization for "deep dream" visualizations.
//!
//! A pre-trained classifier comes as a pair of graphs: an init graph filling
//! the weights, and a predict graph computing class probabilities. This crate
//! splits the predict graph at a named layer, appends an objective, its
//! reverse-mode gradient and a gradient ascent update rewriting the *input*
//! blob, and runs the result repeatedly so that the input drifts toward
//! whatever excites the chosen channel or class.
//!
//! ## Example
//!
//! ```
//! use dream_core::prelude::*;
//!
//! # fn main() -> DreamResult<()> {
//! // a two layer toy classifier: data -> fc(mid) -> fc(out)
//! let init = GraphDef::default()
//!     .node(OperatorNode::new(OpKind::GivenTensorFill).output("w1")
//!         .arg("shape", vec![2i64, 3]).arg("values", vec![0.5f32, -1., 2., 1., 0., 0.]))
//!     .node(OperatorNode::new(OpKind::ConstantFill).output("b1")
//!         .arg("shape", vec![2i64]).arg("value", 0f32))
//!     .node(OperatorNode::new(OpKind::ConstantFill).output("w2")
//!         .arg("shape", vec![2i64, 2]).arg("value", 1f32))
//!     .node(OperatorNode::new(OpKind::ConstantFill).output("b2")
//!         .arg("shape", vec![2i64]).arg("value", 0f32));
//! let predict = GraphDef::default()
//!     .node(OperatorNode::new(OpKind::FC).input("data").input("w1").input("b1").output("mid"))
//!     .node(OperatorNode::new(OpKind::FC).input("mid").input("w2").input("b2").output("out"))
//!     .with_external_inputs(["data"])
//!     .with_external_outputs(["out"]);
//! let model = ModelPair::new(init, predict);
//!
//! let options = DreamOptions {
//!     objective: Objective::Channel { layer: "mid".into(), channel: 0 },
//!     input_shape: tvec!(1, 3),
//!     ..DreamOptions::default()
//! };
//! let mut engine = prepare(&model, &options, &Runtimes::host())?;
//! engine.instantiate()?;
//! engine.initialize()?;
//! engine.set_input(Tensor::from_vec(&[1, 3], vec![1f32, 2., 3.])?)?;
//! let dream = engine.run(1, 10, &mut LogReporter)?;
//! assert_eq!(dream.shape(), &[1, 3]);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate log;

pub extern crate dream_data;
pub extern crate ndarray;

pub mod augment;
pub mod autodiff;
pub mod dream;
pub mod engine;
pub mod errors;
pub mod labels;
pub mod model;
pub mod net;
pub mod ops;
pub mod pb;
pub mod runtime;
pub mod schedule;
pub mod telemetry;
pub mod workspace;

pub mod prelude {
    pub use crate::augment::{add_channel_objective, add_class_objective, DreamBlobs};
    pub use crate::dream::{prepare, DreamOptions, Objective};
    pub use crate::engine::{DreamEngine, EngineState};
    pub use crate::errors::{dream_error, DreamError, DreamResult};
    pub use crate::labels::ClassTable;
    pub use crate::model::{
        check_layer_available, split, ArgValue, Device, DeviceType, GraphDef, ModelPair,
        OperatorNode, Split,
    };
    pub use crate::ops::OpKind;
    pub use crate::runtime::{DeviceSelection, HostRuntime, Runtime, Runtimes};
    pub use crate::schedule::{LearningRateSchedule, LrPolicy};
    pub use crate::telemetry::{LogReporter, Reporter, Snapshot};
    pub use crate::workspace::Workspace;
    pub use dream_data::prelude::*;
}

pub mod internal {
    pub use crate::model::*;
    pub use crate::ops::{Kernel, OpKind};
    pub use crate::prelude::*;
    pub use dream_data::internal::*;
    pub use std::borrow::Cow;
    pub use std::collections::{BTreeMap, HashMap, HashSet};
    pub use std::fmt;
    pub use std::sync::Arc;
}

#[cfg(test)]
fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("DREAM_LOG").try_init();
}
