//! Operator kinds and their host kernels.
//!
//! Every supported `OpKind` maps to a kernel builder. A kernel is built
//! from the node arguments once, when a net is instantiated; it then infers
//! output facts from input facts and evaluates tensors.
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use dream_data::internal::*;

use crate::errors::DreamResult;
use crate::model::OperatorNode;

#[macro_use]
mod macros;

pub mod activ;
pub mod conv;
pub mod fc;
pub mod fill;
pub mod geometry;
pub mod loss;
pub mod lrn;
pub mod pool;
pub mod reduce;
pub mod shape;
pub mod train;

op_kinds!(
    ConstantFill,
    UniformFill,
    GivenTensorFill,
    GivenTensorInt64Fill,
    Conv,
    ConvGradient,
    Relu,
    ReluGradient,
    MaxPool,
    MaxPoolGradient,
    AveragePool,
    AveragePoolGradient,
    LRN,
    LRNGradient,
    Dropout,
    DropoutGradient,
    FC,
    FCGradient,
    Softmax,
    SoftmaxGradient,
    Concat,
    ConcatGradient,
    Reshape,
    ReshapeGradient,
    Slice,
    SliceGradient,
    ReduceBackMean,
    ReduceBackMeanGradient,
    LabelCrossEntropy,
    LabelCrossEntropyGradient,
    AveragedLoss,
    AveragedLossGradient,
    Scale,
    Iter,
    LearningRate,
    WeightedSum,
);

impl OpKind {
    /// Kind of the node computing the gradient of this one, if any.
    pub fn gradient(&self) -> Option<OpKind> {
        use OpKind::*;
        Some(match self {
            Conv => ConvGradient,
            Relu => ReluGradient,
            MaxPool => MaxPoolGradient,
            AveragePool => AveragePoolGradient,
            LRN => LRNGradient,
            Dropout => DropoutGradient,
            FC => FCGradient,
            Softmax => SoftmaxGradient,
            Concat => ConcatGradient,
            Reshape => ReshapeGradient,
            Slice => SliceGradient,
            ReduceBackMean => ReduceBackMeanGradient,
            LabelCrossEntropy => LabelCrossEntropyGradient,
            AveragedLoss => AveragedLossGradient,
            Scale => Scale,
            _ => return None,
        })
    }

    /// Kinds that may rewrite a blob the init net produced.
    pub fn is_bookkeeping(&self) -> bool {
        matches!(self, OpKind::Iter | OpKind::LearningRate)
    }

    pub fn is_fill(&self) -> bool {
        matches!(
            self,
            OpKind::ConstantFill
                | OpKind::UniformFill
                | OpKind::GivenTensorFill
                | OpKind::GivenTensorInt64Fill
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shape inference and host evaluation of one node.
pub trait Kernel: fmt::Debug + Send + Sync {
    fn name(&self) -> Cow<'_, str>;

    /// Output facts, one per output of the node.
    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>>;

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>>;
}

pub type KernelBuilder = fn(&OperatorNode) -> DreamResult<Box<dyn Kernel>>;

/// Dispatch table from operator kind to kernel builder.
pub struct OpRegister(HashMap<OpKind, KernelBuilder>);

impl OpRegister {
    pub fn insert(&mut self, kind: OpKind, builder: KernelBuilder) {
        self.0.insert(kind, builder);
    }

    pub fn supports(&self, kind: &OpKind) -> bool {
        self.0.contains_key(kind)
    }

    /// Build the kernel for a node. A `seed` argument names an input slot
    /// to be replaced by ones at evaluation.
    pub fn build(&self, node: &OperatorNode) -> DreamResult<Box<dyn Kernel>> {
        let Some(builder) = self.0.get(&node.op) else {
            bail!("Unsupported operator {}", node.op)
        };
        let kernel = builder(node)?;
        if let Some(slot) = node.get_arg_opt_int("seed")? {
            let slot = usize::try_from(slot)
                .ok()
                .filter(|s| *s < node.inputs.len())
                .ok_or_else(|| format_err!("Invalid seed slot {} for {}", slot, node.label()))?;
            Ok(Box::new(Seeded { slot, inner: kernel }))
        } else {
            Ok(kernel)
        }
    }
}

impl Default for OpRegister {
    fn default() -> OpRegister {
        let mut reg = OpRegister(HashMap::new());
        activ::register_all_ops(&mut reg);
        conv::register_all_ops(&mut reg);
        fc::register_all_ops(&mut reg);
        fill::register_all_ops(&mut reg);
        loss::register_all_ops(&mut reg);
        lrn::register_all_ops(&mut reg);
        pool::register_all_ops(&mut reg);
        reduce::register_all_ops(&mut reg);
        shape::register_all_ops(&mut reg);
        train::register_all_ops(&mut reg);
        reg
    }
}

impl fmt::Debug for OpRegister {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OpRegister({} kinds)", self.0.len())
    }
}

/// Substitute ones to the upstream gradient of the objective.
#[derive(Debug)]
struct Seeded {
    slot: usize,
    inner: Box<dyn Kernel>,
}

impl Kernel for Seeded {
    fn name(&self) -> Cow<'_, str> {
        format!("Seeded({})", self.inner.name()).into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        self.inner.output_facts(inputs)
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let seed = &inputs[self.slot];
        let ones = Tensor::filled::<f32>(seed.shape(), 1.0);
        let inputs: TVec<&Tensor> = inputs
            .iter()
            .enumerate()
            .map(|(ix, t)| if ix == self.slot { &ones } else { *t })
            .collect();
        self.inner.eval(&inputs)
    }
}

/// Fail unless the fact is a float tensor.
pub(crate) fn check_float(fact: &BlobFact, what: &str) -> DreamResult<()> {
    ensure!(fact.datum_type == DatumType::F32, "{} should be F32, got {}", what, fact);
    Ok(())
}

/// Fail unless the fact is a float tensor of the given rank.
pub(crate) fn check_float_rank(fact: &BlobFact, rank: usize, what: &str) -> DreamResult<()> {
    check_float(fact, what)?;
    ensure!(fact.rank() == rank, "{} should be of rank {}, got {}", what, rank, fact);
    Ok(())
}

/// Fail unless two facts are equal.
pub(crate) fn check_same(a: &BlobFact, b: &BlobFact, what: &str) -> DreamResult<()> {
    ensure!(a == b, "{}: {} and {} should match", what, a, b);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for name in ["Conv", "LRN", "FC", "ReduceBackMean", "WeightedSum"] {
            assert_eq!(OpKind::from_name(name).as_str(), name);
        }
        assert_eq!(OpKind::from_name("SpatialBN"), OpKind::Unsupported("SpatialBN".into()));
    }

    #[test]
    fn every_gradient_kind_has_a_kernel() {
        let reg = OpRegister::default();
        for name in ["Conv", "Relu", "MaxPool", "AveragePool", "LRN", "Dropout", "FC", "Softmax"]
            .iter()
            .chain(["Concat", "Reshape", "Slice", "ReduceBackMean", "LabelCrossEntropy"].iter())
            .chain(["AveragedLoss", "Scale"].iter())
        {
            let kind = OpKind::from_name(name);
            assert!(reg.supports(&kind), "{}", kind);
            let grad = kind.gradient().unwrap();
            assert!(reg.supports(&grad), "{}", grad);
        }
        assert!(OpKind::WeightedSum.gradient().is_none());
        assert!(!reg.supports(&OpKind::Unsupported("Foo".into())));
    }

    #[test]
    fn seed_replaces_upstream_gradient() {
        let node = OperatorNode::new(OpKind::Scale)
            .input("score")
            .output("score_grad")
            .arg("scale", -2f32)
            .arg("seed", 0i64);
        let kernel = OpRegister::default().build(&node).unwrap();
        let score = Tensor::from_vec(&[2], vec![4f32, 5.]).unwrap();
        let out = kernel.eval(&[&score]).unwrap();
        assert_eq!(out[0].as_slice::<f32>().unwrap(), &[-2., -2.]);
    }
}
