//! From a loaded model and a few options to a ready to instantiate engine.
use crate::augment::{add_channel_objective, add_class_objective};
use crate::engine::DreamEngine;
use crate::errors::DreamResult;
use crate::model::{
    check_layer_available, place_on_accelerator, place_on_host, split, ModelPair,
};
use crate::runtime::{DeviceSelection, Runtimes};
use crate::schedule::LearningRateSchedule;
use dream_data::internal::*;

/// Predict runs of a job on the host. Scaled by the device multiplier.
pub const DEFAULT_ITERATIONS: usize = 200;
/// Predict runs between two reports on the host.
pub const DEFAULT_REPORT_INTERVAL: usize = 10;

/// What the optimized input should excite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Objective {
    /// Mean activation of one channel of an intermediate layer.
    Channel { layer: String, channel: usize },
    /// Log-probability of one class of the classifier output.
    Class { label: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct DreamOptions {
    pub objective: Objective,
    pub input_shape: TVec<usize>,
    pub schedule: LearningRateSchedule,
    pub force_cpu: bool,
}

impl Default for DreamOptions {
    fn default() -> DreamOptions {
        DreamOptions {
            objective: Objective::Channel { layer: "pool5".into(), channel: 3 },
            input_shape: tvec!(1, 3, 224, 224),
            schedule: LearningRateSchedule::default(),
            force_cpu: false,
        }
    }
}

impl DreamOptions {
    /// Total predict runs for a selection, before any early stop.
    pub fn iterations(&self, selection: &DeviceSelection) -> usize {
        DEFAULT_ITERATIONS * selection.multiplier
    }
}

/// Augment a model for `options` and wrap it in an engine.
///
/// The model itself is left untouched. A channel objective works on the
/// part of the model computing the layer, a class objective on the whole
/// model.
pub fn prepare(
    model: &ModelPair,
    options: &DreamOptions,
    runtimes: &Runtimes,
) -> DreamResult<DreamEngine> {
    let selection = DeviceSelection::resolve(options.force_cpu, runtimes);
    let (mut pair, blobs) = match &options.objective {
        Objective::Channel { layer, channel } => {
            check_layer_available(&model.predict, layer)?;
            let mut pair = split(model, layer, options.force_cpu)?.prefix;
            let blobs = add_channel_objective(
                &mut pair,
                *channel,
                &options.input_shape,
                &options.schedule,
            )?;
            (pair, blobs)
        }
        Objective::Class { label } => {
            let mut pair = model.clone();
            if options.force_cpu {
                for graph in pair.graphs_mut() {
                    place_on_host(graph);
                }
            }
            let blobs =
                add_class_objective(&mut pair, *label, &options.input_shape, &options.schedule)?;
            (pair, blobs)
        }
    };
    if selection.accelerator {
        for graph in pair.graphs_mut() {
            place_on_accelerator(graph);
        }
    }
    debug!(
        "Prepared {:?}: {} init and {} predict nodes, input {}",
        options.objective,
        pair.init.nodes.len(),
        pair.predict.nodes.len(),
        blobs.input
    );
    Ok(DreamEngine::new(pair, blobs, runtimes.clone(), selection))
}
