//! The optimization loop.
//!
//! ```text
//! Uninitialized --instantiate--> Ready --initialize--> Running <--> Reporting
//!                                                         |
//!                                                        run
//!                                                         v
//!                                                      Terminal
//! ```
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::augment::DreamBlobs;
use crate::errors::{DreamError, DreamResult};
use crate::model::ModelPair;
use crate::net::{Net, NetKind};
use crate::ops::OpRegister;
use crate::runtime::{DeviceSelection, Runtimes};
use crate::telemetry::{Reporter, Snapshot};
use crate::workspace::Workspace;
use dream_data::internal::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Running,
    Reporting,
    Terminal,
}

#[derive(Debug)]
pub struct DreamEngine {
    model: ModelPair,
    blobs: DreamBlobs,
    runtimes: Runtimes,
    selection: DeviceSelection,
    registry: OpRegister,
    state: EngineState,
    workspace: Workspace,
    nets: Option<(Net, Net)>,
    stop: Arc<AtomicBool>,
    steps: usize,
    dream_time: Duration,
}

impl DreamEngine {
    pub fn new(
        model: ModelPair,
        blobs: DreamBlobs,
        runtimes: Runtimes,
        selection: DeviceSelection,
    ) -> DreamEngine {
        DreamEngine {
            model,
            blobs,
            runtimes,
            selection,
            registry: OpRegister::default(),
            state: EngineState::Uninitialized,
            workspace: Workspace::default(),
            nets: None,
            stop: Arc::new(AtomicBool::new(false)),
            steps: 0,
            dream_time: Duration::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn model(&self) -> &ModelPair {
        &self.model
    }

    pub fn blobs(&self) -> &DreamBlobs {
        &self.blobs
    }

    pub fn selection(&self) -> DeviceSelection {
        self.selection
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Predict runs done so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Wall-clock time spent in predict runs.
    pub fn dream_time(&self) -> Duration {
        self.dream_time
    }

    /// Setting the flag stops `run` before its next iteration.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn check_state(&self, state: EngineState, what: &str) -> DreamResult<()> {
        ensure!(
            self.state == state,
            "Can not {} in state {:?}, expected {:?}",
            what,
            self.state,
            state
        );
        Ok(())
    }

    /// Build and check the init and predict nets.
    pub fn instantiate(&mut self) -> DreamResult<()> {
        self.check_state(EngineState::Uninitialized, "instantiate")?;
        let mut workspace = Workspace::default();
        let init = Net::instantiate(
            &self.model.init,
            NetKind::Init,
            &mut workspace,
            &self.registry,
            &self.runtimes,
        )?;
        workspace.bind_parameter(&self.blobs.input).with_context(|| {
            DreamError::GraphInstantiation {
                net: self.model.predict.name.clone(),
                node: self.blobs.input.clone(),
            }
        })?;
        let predict = Net::instantiate(
            &self.model.predict,
            NetKind::Predict,
            &mut workspace,
            &self.registry,
            &self.runtimes,
        )?;
        for blob in [&self.blobs.score, &self.blobs.iter, &self.blobs.lr] {
            ensure!(workspace.contains(blob), "Blob {} is not computed by the nets", blob);
        }
        if let Some((output, label)) = &self.blobs.class {
            check_class(&workspace, output, *label).with_context(|| {
                DreamError::GraphInstantiation {
                    net: self.model.predict.name.clone(),
                    node: output.clone(),
                }
            })?;
        }
        info!(
            "Instantiated {} init and {} predict nodes on {}",
            init.len(),
            predict.len(),
            if self.selection.accelerator { "accelerator" } else { "host" }
        );
        self.workspace = workspace;
        self.nets = Some((init, predict));
        self.state = EngineState::Ready;
        Ok(())
    }

    /// Run the init net, once.
    pub fn initialize(&mut self) -> DreamResult<()> {
        self.check_state(EngineState::Ready, "initialize")?;
        let Some((init, _)) = &self.nets else { bail!("Nets are not instantiated") };
        init.run(&mut self.workspace)?;
        self.state = EngineState::Running;
        Ok(())
    }

    /// Replace the optimized input, typically by an image.
    pub fn set_input(&mut self, input: Tensor) -> DreamResult<()> {
        self.check_state(EngineState::Running, "set the input")?;
        self.workspace.set(&self.blobs.input, input)
    }

    /// Current value of the optimized input.
    pub fn input(&self) -> DreamResult<Arc<Tensor>> {
        self.workspace.get_arc(&self.blobs.input)
    }

    pub fn snapshot(&self) -> DreamResult<Snapshot> {
        let score = self.workspace.get(&self.blobs.score)?.as_slice::<f32>()?;
        Ok(Snapshot {
            step: self.steps,
            iteration: self.workspace.read_scalar(&self.blobs.iter)? as i64,
            learning_rate: self.workspace.read_scalar(&self.blobs.lr)?,
            score: score.iter().sum::<f32>() / score.len().max(1) as f32,
            input: self.input()?,
        })
    }

    /// Run the predict net `iterations` times, reporting every
    /// `report_every` runs, and return the optimized input.
    pub fn run(
        &mut self,
        iterations: usize,
        report_every: usize,
        reporter: &mut dyn Reporter,
    ) -> DreamResult<Tensor> {
        self.check_state(EngineState::Running, "run")?;
        let mut last_report = self.steps;
        for iteration in 1..=iterations {
            if self.stop.load(Ordering::Relaxed) {
                info!("Stopped before iteration {}", iteration);
                break;
            }
            let Some((_, predict)) = &self.nets else { bail!("Nets are not instantiated") };
            let start = Instant::now();
            let outcome = predict.run(&mut self.workspace);
            self.dream_time += start.elapsed();
            if let Err(e) = outcome {
                if self.steps > last_report {
                    match self.snapshot().and_then(|s| reporter.report(&s)) {
                        Ok(()) => (),
                        Err(flush) => warn!("Telemetry flush failed: {:#}", flush),
                    }
                }
                self.state = EngineState::Terminal;
                return Err(e.context(DreamError::Execution { iteration }));
            }
            self.steps += 1;
            if report_every > 0 && iteration % report_every == 0 {
                self.state = EngineState::Reporting;
                if let Err(e) = self.snapshot().and_then(|s| reporter.report(&s)) {
                    self.state = EngineState::Terminal;
                    return Err(e.context(format!("Reporting after iteration {}", iteration)));
                }
                last_report = self.steps;
                self.state = EngineState::Running;
            }
        }
        self.state = EngineState::Terminal;
        Ok(self.input()?.as_ref().clone())
    }
}

/// The target class must be one of the classifier outputs.
fn check_class(workspace: &Workspace, output: &str, label: usize) -> DreamResult<()> {
    let fact = workspace.fact(output).ok_or_else(|| format_err!("Unknown blob {}", output))?;
    let classes = fact.shape.last().copied().unwrap_or(0);
    ensure!(label < classes, "Label {} out of the {} classes of {}", label, classes, fact);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dream::{prepare, DreamOptions, Objective};
    use crate::errors::dream_error;
    use crate::model::{GraphDef, OperatorNode};
    use crate::ops::OpKind;
    use crate::schedule::{LearningRateSchedule, LrPolicy};

    fn toy() -> ModelPair {
        let init = GraphDef::default().node(
            OperatorNode::new(OpKind::GivenTensorFill)
                .output("w")
                .arg("shape", vec![1i64, 2])
                .arg("values", vec![1f32, -1.]),
        );
        let predict = GraphDef::default()
            .node(OperatorNode::new(OpKind::FC).input("data").input("w").input("b").output("y"))
            .with_external_inputs(["data"])
            .with_external_outputs(["y"]);
        let init = init.node(
            OperatorNode::new(OpKind::ConstantFill).output("b").arg("shape", vec![1i64]),
        );
        ModelPair::new(init, predict)
    }

    fn engine() -> DreamEngine {
        crate::setup_test_logger();
        let options = DreamOptions {
            objective: Objective::Channel { layer: "y".into(), channel: 0 },
            input_shape: tvec!(1, 2),
            schedule: LearningRateSchedule::new(0.5, LrPolicy::Fixed),
            ..DreamOptions::default()
        };
        prepare(&toy(), &options, &Runtimes::host()).unwrap()
    }

    #[test]
    fn state_machine() {
        let mut engine = engine();
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(engine.initialize().is_err());
        engine.instantiate().unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        assert!(engine.set_input(Tensor::zero::<f32>(&[1, 2])).is_err());
        engine.initialize().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        engine.set_input(Tensor::zero::<f32>(&[1, 2])).unwrap();
        assert!(engine.set_input(Tensor::zero::<f32>(&[1, 3])).is_err());
        let mut reports: Vec<Snapshot> = vec![];
        let out = engine.run(4, 2, &mut reports).unwrap();
        assert_eq!(engine.state(), EngineState::Terminal);
        assert_eq!(out.as_slice::<f32>().unwrap(), &[2., -2.]);
        assert_eq!(reports.iter().map(|s| s.iteration).collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(reports[0].score, 1.);
        assert!(engine.run(1, 1, &mut reports).is_err());
    }

    struct FullDisk;

    impl Reporter for FullDisk {
        fn report(&mut self, _snapshot: &Snapshot) -> DreamResult<()> {
            bail!("No space left on device")
        }
    }

    #[test]
    fn failed_report_ends_the_run() {
        let mut engine = engine();
        engine.instantiate().unwrap();
        engine.initialize().unwrap();
        let err = engine.run(4, 2, &mut FullDisk).unwrap_err();
        assert_eq!(engine.state(), EngineState::Terminal);
        assert_eq!(engine.steps(), 2);
        let message = format!("{:#}", err);
        assert!(message.contains("Reporting after iteration 2"), "{}", message);
        assert!(message.contains("No space left"), "{}", message);
    }

    #[test]
    fn class_out_of_the_outputs() {
        let options = |label| DreamOptions {
            objective: Objective::Class { label },
            input_shape: tvec!(1, 2),
            schedule: LearningRateSchedule::new(0.5, LrPolicy::Fixed),
            ..DreamOptions::default()
        };
        let mut engine = prepare(&toy(), &options(1), &Runtimes::host()).unwrap();
        let err = engine.instantiate().unwrap_err();
        assert!(matches!(dream_error(&err), Some(DreamError::GraphInstantiation { .. })));
        assert!(format!("{:#}", err).contains("out of the 1 classes"));
        assert_eq!(engine.state(), EngineState::Uninitialized);
        let mut engine = prepare(&toy(), &options(0), &Runtimes::host()).unwrap();
        engine.instantiate().unwrap();
    }

    #[test]
    fn stop_flag() {
        let mut engine = engine();
        engine.instantiate().unwrap();
        engine.initialize().unwrap();
        engine.stop_handle().store(true, Ordering::Relaxed);
        let mut reports: Vec<Snapshot> = vec![];
        engine.run(10, 1, &mut reports).unwrap();
        assert_eq!(engine.steps(), 0);
        assert!(reports.is_empty());
    }
}
