use std::borrow::Cow;
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use dream_core::internal::*;
use dream_core::model::graph_for_reader;
use proptest::prelude::*;

// data -> fc(mid) -> fc(out), with mid[0] = 0.5 x0 - x1 + 2 x2
fn toy() -> ModelPair {
    let init = GraphDef::named("toy_init")
        .node(
            OperatorNode::new(OpKind::GivenTensorFill)
                .output("w1")
                .arg("shape", vec![2i64, 3])
                .arg("values", vec![0.5f32, -1., 2., 1., 0., 0.]),
        )
        .node(OperatorNode::new(OpKind::ConstantFill).output("b1").arg("shape", vec![2i64]))
        .node(
            OperatorNode::new(OpKind::GivenTensorFill)
                .output("w2")
                .arg("shape", vec![2i64, 2])
                .arg("values", vec![1f32, 0., 0., 1.]),
        )
        .node(OperatorNode::new(OpKind::ConstantFill).output("b2").arg("shape", vec![2i64]));
    let predict = GraphDef::named("toy_predict")
        .node(OperatorNode::new(OpKind::FC).input("data").input("w1").input("b1").output("mid"))
        .node(OperatorNode::new(OpKind::FC).input("mid").input("w2").input("b2").output("out"))
        .node(OperatorNode::new(OpKind::Softmax).input("out").output("prob"))
        .with_external_inputs(["data"])
        .with_external_outputs(["prob"]);
    ModelPair::new(init, predict)
}

fn options(objective: Objective, schedule: LearningRateSchedule) -> DreamOptions {
    DreamOptions { objective, input_shape: tvec!(1, 3), schedule, force_cpu: false }
}

fn mid_channel(schedule: LearningRateSchedule) -> DreamOptions {
    options(Objective::Channel { layer: "mid".into(), channel: 0 }, schedule)
}

fn started(options: &DreamOptions, runtimes: &Runtimes) -> DreamEngine {
    let mut engine = prepare(&toy(), options, runtimes).unwrap();
    engine.instantiate().unwrap();
    engine.initialize().unwrap();
    engine.set_input(Tensor::from_vec(&[1, 3], vec![1f32, 2., 3.]).unwrap()).unwrap();
    engine
}

fn assert_input(t: &Tensor, expected: &[f32]) {
    let values = t.as_slice::<f32>().unwrap();
    assert_eq!(values.len(), expected.len());
    for (v, e) in values.iter().zip(expected) {
        assert_abs_diff_eq!(*v, *e, epsilon = 1e-4);
    }
}

#[test]
fn one_ascent_step() {
    let schedule = LearningRateSchedule::new(1.0, LrPolicy::Exp { gamma: 0.999 });
    let mut engine = started(&mid_channel(schedule), &Runtimes::host());
    let mut reports: Vec<Snapshot> = vec![];
    let dream = engine.run(1, 1, &mut reports).unwrap();
    assert_input(&dream, &[1.4995, 1.001, 4.998]);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].iteration, 1);
    assert_abs_diff_eq!(reports[0].learning_rate, 0.999, epsilon = 1e-6);
    assert_abs_diff_eq!(reports[0].score, 4.5, epsilon = 1e-5);
}

#[test]
fn zero_iterations_leave_the_input_alone() {
    let mut engine = started(&mid_channel(LearningRateSchedule::default()), &Runtimes::host());
    let mut reports: Vec<Snapshot> = vec![];
    let dream = engine.run(0, 1, &mut reports).unwrap();
    assert_eq!(dream.as_slice::<f32>().unwrap(), &[1., 2., 3.]);
    assert!(reports.is_empty());
    assert_eq!(engine.workspace().read_scalar("iter").unwrap(), 0.);
    assert_eq!(engine.workspace().read_scalar("lr").unwrap(), 1e3);
}

#[test]
fn counter_and_rate_after_n_runs() {
    let schedule = LearningRateSchedule::new(1.0, LrPolicy::Exp { gamma: 0.5 });
    let mut engine = started(&mid_channel(schedule), &Runtimes::host());
    engine.run(5, 0, &mut LogReporter).unwrap();
    assert_eq!(engine.steps(), 5);
    assert_eq!(engine.workspace().read_scalar("iter").unwrap(), 5.);
    let lr = engine.workspace().read_scalar("lr").unwrap();
    assert_abs_diff_eq!(lr, 0.5f32.powi(5), epsilon = 1e-7);
}

#[test]
fn rate_stays_positive_on_every_run() {
    let schedule = LearningRateSchedule::new(1.0, LrPolicy::Exp { gamma: 0.5 });
    let mut engine = started(&mid_channel(schedule), &Runtimes::host());
    let mut reports: Vec<Snapshot> = vec![];
    engine.run(200, 1, &mut reports).unwrap();
    assert_eq!(reports.len(), 200);
    assert!(reports.iter().all(|s| s.learning_rate > 0.));
    for pair in reports.windows(2) {
        assert!(pair[1].learning_rate <= pair[0].learning_rate, "{} then {}", pair[0], pair[1]);
    }
    assert_eq!(reports[199].learning_rate, f32::MIN_POSITIVE);
    assert_eq!(engine.workspace().read_scalar("lr").unwrap(), f32::MIN_POSITIVE);
}

#[test]
fn channel_score_does_not_decrease() {
    let schedule = LearningRateSchedule::new(0.01, LrPolicy::Fixed);
    let mut engine = started(&mid_channel(schedule), &Runtimes::host());
    let mut reports: Vec<Snapshot> = vec![];
    engine.run(20, 1, &mut reports).unwrap();
    assert_eq!(reports.len(), 20);
    for pair in reports.windows(2) {
        assert!(pair[1].score >= pair[0].score, "{} then {}", pair[0], pair[1]);
    }
}

#[test]
fn class_score_does_not_decrease() {
    let schedule = LearningRateSchedule::new(0.1, LrPolicy::Fixed);
    let class = options(Objective::Class { label: 1 }, schedule);
    let mut engine = prepare(&toy(), &class, &Runtimes::host()).unwrap();
    engine.instantiate().unwrap();
    engine.initialize().unwrap();
    engine.set_input(Tensor::from_vec(&[1, 3], vec![0.5f32, -0.5, 0.25]).unwrap()).unwrap();
    let mut reports: Vec<Snapshot> = vec![];
    engine.run(10, 2, &mut reports).unwrap();
    assert_eq!(reports.len(), 5);
    assert!(reports.iter().all(|s| s.score <= 0.));
    for pair in reports.windows(2) {
        assert!(pair[1].score >= pair[0].score - 1e-6, "{} then {}", pair[0], pair[1]);
    }
}

#[test]
fn unknown_layer_lists_the_layers() {
    let options = mid_channel(LearningRateSchedule::default());
    let objective = Objective::Channel { layer: "pool5".into(), channel: 3 };
    let options = DreamOptions { objective, ..options };
    let err = prepare(&toy(), &options, &Runtimes::host()).unwrap_err();
    match dream_error(&err) {
        Some(DreamError::LayerNotFound { available, .. }) => {
            assert_eq!(available, &["mid", "out", "prob"])
        }
        other => panic!("{:?}", other),
    }
}

#[test]
fn execution_fault_names_the_iteration() {
    let schedule = LearningRateSchedule::new(1e38, LrPolicy::Fixed);
    let mut engine = started(&mid_channel(schedule), &Runtimes::host());
    let mut reports: Vec<Snapshot> = vec![];
    let err = engine.run(10, 1, &mut reports).unwrap_err();
    assert_eq!(dream_error(&err), Some(&DreamError::Execution { iteration: 2 }));
    assert_eq!(engine.state(), EngineState::Terminal);
    assert_eq!(engine.steps(), 1);
    assert_eq!(reports.len(), 1);
}

#[test]
fn protobuf_round_trip() {
    let model = toy();
    let mut predict = model.predict.clone();
    predict.nodes[0].device = Device::accelerator(0);
    let bytes = predict.write_to_bytes();
    let reloaded = graph_for_reader(&*bytes).unwrap();
    assert_eq!(reloaded, predict);
}

#[derive(Debug)]
struct FakeAccelerator;

impl Runtime for FakeAccelerator {
    fn name(&self) -> Cow<'_, str> {
        "fake accelerator".into()
    }

    fn device(&self) -> Device {
        Device::accelerator(0)
    }

    fn eval(&self, kernel: &dyn Kernel, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        kernel.eval(inputs)
    }
}

#[test]
fn accelerator_placement() {
    let runtimes = Runtimes::host().with_accelerator(Arc::new(FakeAccelerator));
    let schedule = LearningRateSchedule::new(1.0, LrPolicy::Exp { gamma: 0.999 });
    let options = mid_channel(schedule);
    let mut engine = started(&options, &runtimes);
    assert!(engine.selection().accelerator);
    assert_eq!(engine.selection().multiplier, 10);
    for graph in [&engine.model().init, &engine.model().predict] {
        assert!(graph.nodes.iter().all(|n| n.device == Device::accelerator(0)));
    }
    let dream = engine.run(1, 1, &mut LogReporter).unwrap();
    let mut on_host = started(&options, &Runtimes::host());
    let reference = on_host.run(1, 1, &mut LogReporter).unwrap();
    dream.close_enough(&reference, true).unwrap();

    let forced = DreamOptions { force_cpu: true, ..options };
    let engine = prepare(&toy(), &forced, &runtimes).unwrap();
    assert!(!engine.selection().accelerator);
    assert!(engine.model().predict.nodes.iter().all(|n| n.device.is_host()));
}

#[test]
fn accelerator_nodes_need_an_accelerator() {
    let mut model = toy();
    model.predict.nodes[0].device = Device::accelerator(0);
    let options = mid_channel(LearningRateSchedule::default());
    let mut engine = prepare(&model, &options, &Runtimes::host()).unwrap();
    let err = engine.instantiate().unwrap_err();
    assert!(matches!(dream_error(&err), Some(DreamError::GraphInstantiation { .. })));
}

fn chain(len: usize) -> GraphDef {
    let mut graph = GraphDef::named("chain").with_external_inputs(["b0"]);
    for i in 0..len {
        graph.push(
            OperatorNode::new(OpKind::Relu).input(format!("b{}", i)).output(format!("b{}", i + 1)),
        );
    }
    graph.with_external_outputs([format!("b{}", len)])
}

proptest! {
    #[test]
    fn split_halves_cover_the_graph(len in 1usize..10, at in 0usize..10) {
        let at = at % len;
        let layer = format!("b{}", at + 1);
        let full = ModelPair::new(GraphDef::named("init"), chain(len));
        let split = split(&full, &layer, false).unwrap();
        let prefix = &split.prefix.predict;
        let suffix = &split.suffix.predict;
        prop_assert_eq!(prefix.nodes.len(), at + 1);
        prop_assert_eq!(prefix.nodes.len() + suffix.nodes.len(), len);
        prop_assert_eq!(prefix.nodes.last().map(|n| n.outputs[0].clone()), Some(layer.clone()));
        prop_assert_eq!(&suffix.external_inputs[0], &layer);
        prop_assert_eq!(&suffix.external_outputs, &full.predict.external_outputs);
        let rejoined: Vec<_> = prefix.nodes.iter().chain(suffix.nodes.iter()).cloned().collect();
        prop_assert_eq!(rejoined, full.predict.nodes.clone());
    }
}
