//! Turn a classifier into an input optimizer.
//!
//! An objective is appended to the predict graph, followed by its gradient,
//! the iteration and learning rate bookkeeping, and a `WeightedSum` moving
//! the input along its gradient. The init graph gets the matching fills.
use crate::autodiff::{add_gradient_ops, grad_name};
use crate::errors::DreamResult;
use crate::model::{GraphDef, ModelPair, OperatorNode};
use crate::ops::OpKind;
use crate::schedule::LearningRateSchedule;
use dream_data::internal::*;

pub const SCORE: &str = "score";
pub const ITER: &str = "iter";
pub const LR: &str = "lr";
pub const ONE: &str = "one";
pub const LABEL: &str = "label";

/// Names of the blobs an optimization run reads back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DreamBlobs {
    pub input: String,
    pub input_grad: String,
    pub score: String,
    pub iter: String,
    pub lr: String,
    /// Classifier output and target class, for a class objective.
    pub class: Option<(String, usize)>,
}

fn dims(shape: &[usize]) -> Vec<i64> {
    shape.iter().map(|&d| d as i64).collect()
}

/// Maximize the mean of one channel of the predict graph output.
pub fn add_channel_objective(
    model: &mut ModelPair,
    channel: usize,
    input_shape: &[usize],
    schedule: &LearningRateSchedule,
) -> DreamResult<DreamBlobs> {
    let output = model.predict.primary_output()?.to_string();
    debug!("Channel objective: {}[:, {}]", output, channel);
    let channel = channel as i64;
    let predict = &mut model.predict;
    predict.push(
        OperatorNode::new(OpKind::Slice)
            .input(output)
            .output("pick")
            .arg("starts", vec![0i64, channel])
            .arg("ends", vec![-1i64, channel + 1]),
    );
    predict.push(
        OperatorNode::new(OpKind::Reshape)
            .input("pick")
            .output("reshape")
            .arg("shape", vec![0i64, -1]),
    );
    predict.push(OperatorNode::new(OpKind::ReduceBackMean).input("reshape").output(SCORE));
    add_ascent(model, input_shape, schedule, None)
}

/// Maximize the mean log-probability of class `label`.
pub fn add_class_objective(
    model: &mut ModelPair,
    label: usize,
    input_shape: &[usize],
    schedule: &LearningRateSchedule,
) -> DreamResult<DreamBlobs> {
    let output = model.predict.primary_output()?.to_string();
    let batch = *input_shape.first().ok_or_else(|| format_err!("Empty input shape"))?;
    debug!("Class objective: {} of {}", label, output);
    model.init.push(
        OperatorNode::new(OpKind::ConstantFill)
            .output(LABEL)
            .arg("shape", vec![batch as i64])
            .arg("dtype", DatumType::I64.proto_code())
            .arg("value", label as i64),
    );
    let predict = &mut model.predict;
    predict.push(
        OperatorNode::new(OpKind::LabelCrossEntropy).input(&*output).input(LABEL).output("xent"),
    );
    predict.push(OperatorNode::new(OpKind::AveragedLoss).input("xent").output("loss"));
    predict.push(OperatorNode::new(OpKind::Scale).input("loss").output(SCORE).arg("scale", -1f32));
    add_ascent(model, input_shape, schedule, Some((output, label)))
}

/// Iteration counter and learning rate, initialized by the init graph and
/// advanced by every predict run.
pub fn add_iter_lr_ops(
    init: &mut GraphDef,
    predict: &mut GraphDef,
    schedule: &LearningRateSchedule,
) {
    init.push(
        OperatorNode::new(OpKind::ConstantFill)
            .output(ITER)
            .arg("shape", vec![1i64])
            .arg("dtype", DatumType::I64.proto_code())
            .arg("value", 0i64),
    );
    let lr = || {
        schedule
            .to_args()
            .into_iter()
            .fold(OperatorNode::new(OpKind::LearningRate).input(ITER).output(LR), |n, (k, v)| {
                n.arg(k, v)
            })
    };
    init.push(lr());
    predict.push(OperatorNode::new(OpKind::Iter).input(ITER).output(ITER));
    predict.push(lr());
}

fn add_ascent(
    model: &mut ModelPair,
    input_shape: &[usize],
    schedule: &LearningRateSchedule,
    class: Option<(String, usize)>,
) -> DreamResult<DreamBlobs> {
    schedule.validate()?;
    let input = model.predict.primary_input()?.to_string();
    let input_grad = grad_name(&input);
    let added = add_gradient_ops(&mut model.predict, SCORE)?;
    ensure!(
        model.predict.produces(&input_grad),
        "Input {} does not contribute to the objective",
        input
    );
    debug!("Added {} gradient nodes", added);
    add_iter_lr_ops(&mut model.init, &mut model.predict, schedule);
    model.init.push(
        OperatorNode::new(OpKind::UniformFill)
            .output(&*input)
            .arg("shape", dims(input_shape))
            .arg("min", -1f32)
            .arg("max", 1f32),
    );
    model.init.push(
        OperatorNode::new(OpKind::ConstantFill)
            .output(ONE)
            .arg("shape", vec![1i64])
            .arg("value", 1f32),
    );
    model.predict.push(
        OperatorNode::new(OpKind::WeightedSum)
            .input(&*input)
            .input(ONE)
            .input(&*input_grad)
            .input(LR)
            .output(&*input),
    );
    model.predict.external_outputs = vec![SCORE.to_string()];
    Ok(DreamBlobs {
        input,
        input_grad,
        score: SCORE.to_string(),
        iter: ITER.to_string(),
        lr: LR.to_string(),
        class,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> ModelPair {
        let init = GraphDef::default()
            .node(OperatorNode::new(OpKind::ConstantFill).output("w").arg("shape", vec![2i64, 3]))
            .node(OperatorNode::new(OpKind::ConstantFill).output("b").arg("shape", vec![2i64]));
        let predict = GraphDef::default()
            .node(OperatorNode::new(OpKind::FC).input("data").input("w").input("b").output("fc"))
            .node(OperatorNode::new(OpKind::Softmax).input("fc").output("prob"))
            .with_external_inputs(["data"])
            .with_external_outputs(["prob"]);
        ModelPair::new(init, predict)
    }

    fn kinds(graph: &GraphDef) -> Vec<OpKind> {
        graph.nodes.iter().map(|n| n.op.clone()).collect()
    }

    #[test]
    fn channel_objective_layout() {
        let mut model = toy();
        let schedule = LearningRateSchedule::default();
        let blobs = add_channel_objective(&mut model, 1, &[1, 3], &schedule).unwrap();
        assert_eq!(blobs.input, "data");
        assert_eq!(blobs.input_grad, "data_grad");
        use OpKind::*;
        assert_eq!(
            kinds(&model.predict),
            vec![
                FC,
                Softmax,
                Slice,
                Reshape,
                ReduceBackMean,
                ReduceBackMeanGradient,
                ReshapeGradient,
                SliceGradient,
                SoftmaxGradient,
                FCGradient,
                Iter,
                LearningRate,
                WeightedSum
            ]
        );
        assert_eq!(model.predict.external_outputs, vec!["score"]);
        assert_eq!(
            kinds(&model.init)[2..],
            [ConstantFill, LearningRate, UniformFill, ConstantFill]
        );
        let update = model.predict.nodes.last().unwrap();
        assert_eq!(update.inputs, vec!["data", "one", "data_grad", "lr"]);
        assert_eq!(update.outputs, vec!["data"]);
        let slice = &model.predict.nodes[2];
        assert_eq!(slice.get_arg_ints("starts").unwrap(), &[0, 1]);
        assert_eq!(slice.get_arg_ints("ends").unwrap(), &[-1, 2]);
    }

    #[test]
    fn class_objective_layout() {
        let mut model = toy();
        let blobs =
            add_class_objective(&mut model, 1, &[1, 3], &LearningRateSchedule::default()).unwrap();
        assert_eq!(blobs.class, Some(("prob".to_string(), 1)));
        let label = &model.init.nodes[2];
        assert_eq!(label.outputs, vec!["label"]);
        assert_eq!(label.get_arg_int("value").unwrap(), 1);
        let score = &model.predict.nodes[4];
        assert_eq!(score.op, OpKind::Scale);
        assert_eq!(score.get_arg_float("scale").unwrap(), -1.0);
        let xent_grad = &model.predict.nodes[7];
        assert_eq!(xent_grad.op, OpKind::LabelCrossEntropyGradient);
        assert_eq!(xent_grad.inputs, vec!["prob", "label", "xent_grad"]);
        assert_eq!(xent_grad.outputs, vec!["prob_grad"]);
    }

    #[test]
    fn invalid_schedule_is_rejected() {
        let mut model = toy();
        let schedule = LearningRateSchedule { base_lr: -1.0, ..LearningRateSchedule::default() };
        assert!(add_channel_objective(&mut model, 0, &[1, 3], &schedule).is_err());
    }
}
