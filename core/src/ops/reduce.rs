use std::borrow::Cow;

use crate::errors::DreamResult;
use crate::model::OperatorNode;
use crate::ops::{check_float, check_same, Kernel, OpKind, OpRegister};
use dream_data::internal::*;

pub fn register_all_ops(reg: &mut OpRegister) {
    reg.insert(OpKind::ReduceBackMean, |node| Ok(Box::new(ReduceBackMean::from_node(node)?)));
    reg.insert(OpKind::ReduceBackMeanGradient, |node| {
        Ok(Box::new(ReduceBackMeanGradient(ReduceBackMean::from_node(node)?)))
    });
    reg.insert(OpKind::AveragedLoss, |_| Ok(Box::new(AveragedLoss)));
    reg.insert(OpKind::AveragedLossGradient, |_| Ok(Box::new(AveragedLossGradient)));
}

/// Mean over the `num_reduce_dim` trailing dimensions.
#[derive(Clone, Debug, PartialEq)]
pub struct ReduceBackMean {
    pub reduced: usize,
}

impl ReduceBackMean {
    fn from_node(node: &OperatorNode) -> DreamResult<ReduceBackMean> {
        let reduced = node.get_arg_opt_int("num_reduce_dim")?.unwrap_or(1);
        ensure!(reduced >= 0, "{}: negative num_reduce_dim", node.label());
        Ok(ReduceBackMean { reduced: reduced as usize })
    }

    /// Kept shape and the number of elements averaged for each output.
    fn split(&self, x: &BlobFact) -> DreamResult<(TVec<usize>, usize)> {
        check_float(x, "ReduceBackMean input")?;
        ensure!(self.reduced <= x.rank(), "Can not reduce {} dims of {}", self.reduced, x);
        let kept = x.rank() - self.reduced;
        Ok((x.shape[..kept].into(), x.shape[kept..].iter().product()))
    }
}

impl Kernel for ReduceBackMean {
    fn name(&self) -> Cow<'_, str> {
        "ReduceBackMean".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (shape, _) = self.split(args_1!(inputs))?;
        Ok(tvec!(BlobFact::shape::<f32>(shape)))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let x = args_1!(inputs);
        let (shape, count) = self.split(&x.fact())?;
        let means = x
            .as_slice::<f32>()?
            .chunks(count.max(1))
            .map(|chunk| chunk.iter().sum::<f32>() / count.max(1) as f32)
            .collect();
        Ok(tvec!(Tensor::from_vec(&shape, means)?))
    }
}

/// Inputs X, dY. Output dX, dY spread evenly over each reduced group.
#[derive(Clone, Debug, PartialEq)]
pub struct ReduceBackMeanGradient(pub ReduceBackMean);

impl Kernel for ReduceBackMeanGradient {
    fn name(&self) -> Cow<'_, str> {
        "ReduceBackMeanGradient".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (x, dy) = args_2!(inputs);
        let (shape, _) = self.0.split(x)?;
        check_same(dy, &BlobFact::shape::<f32>(shape), "ReduceBackMean dY")?;
        Ok(tvec!(x.clone()))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (x, dy) = args_2!(inputs);
        let (_, count) = self.0.split(&x.fact())?;
        let data = dy
            .as_slice::<f32>()?
            .iter()
            .flat_map(|&g| std::iter::repeat_n(g / count as f32, count))
            .collect();
        Ok(tvec!(Tensor::from_vec(x.shape(), data)?))
    }
}

/// Mean of all elements, as a scalar.
#[derive(Clone, Debug, PartialEq)]
pub struct AveragedLoss;

impl Kernel for AveragedLoss {
    fn name(&self) -> Cow<'_, str> {
        "AveragedLoss".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let x = args_1!(inputs);
        check_float(x, "AveragedLoss input")?;
        ensure!(x.volume() > 0, "AveragedLoss of an empty blob");
        Ok(tvec!(BlobFact::shape::<f32>([0usize; 0])))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let x = args_1!(inputs);
        let data = x.as_slice::<f32>()?;
        Ok(tvec!(Tensor::scalar(data.iter().sum::<f32>() / data.len() as f32)))
    }
}

/// Inputs X, dY. Output dX, the scalar dY divided among the elements.
#[derive(Clone, Debug, PartialEq)]
pub struct AveragedLossGradient;

impl Kernel for AveragedLossGradient {
    fn name(&self) -> Cow<'_, str> {
        "AveragedLossGradient".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (x, dy) = args_2!(inputs);
        check_float(x, "AveragedLoss input")?;
        ensure!(dy.volume() == 1, "AveragedLoss dY should be a scalar, got {}", dy);
        Ok(tvec!(x.clone()))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (x, dy) = args_2!(inputs);
        let g = dy.as_slice::<f32>()?[0];
        Ok(tvec!(Tensor::filled(x.shape(), g / x.len() as f32)))
    }
}
