//! Optimization bookkeeping: iteration counter, learning rate and the
//! weighted sum update.
use std::borrow::Cow;

use crate::errors::DreamResult;
use crate::ops::{check_float, check_same, Kernel, OpKind, OpRegister};
use crate::schedule::LearningRateSchedule;
use dream_data::internal::*;

pub fn register_all_ops(reg: &mut OpRegister) {
    reg.insert(OpKind::Iter, |_| Ok(Box::new(Iter)));
    reg.insert(OpKind::LearningRate, |node| {
        let schedule = LearningRateSchedule::from_node(node)?;
        schedule.validate()?;
        Ok(Box::new(LearningRate(schedule)))
    });
    reg.insert(OpKind::WeightedSum, |node| {
        ensure!(
            !node.inputs.is_empty() && node.inputs.len() % 2 == 0,
            "{}: WeightedSum expects pairs of data and weight",
            node.label()
        );
        Ok(Box::new(WeightedSum))
    });
}

fn check_counter(fact: &BlobFact) -> DreamResult<()> {
    ensure!(
        *fact == BlobFact::shape::<i64>([1]),
        "Iteration counter should be a single I64, got {}",
        fact
    );
    Ok(())
}

/// Increment the iteration counter.
#[derive(Clone, Debug, PartialEq)]
pub struct Iter;

impl Kernel for Iter {
    fn name(&self) -> Cow<'_, str> {
        "Iter".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let iter = args_1!(inputs);
        check_counter(iter)?;
        Ok(tvec!(iter.clone()))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let iter = args_1!(inputs);
        let next = iter.as_slice::<i64>()?[0] + 1;
        Ok(tvec!(Tensor::from_vec(&[1], vec![next])?))
    }
}

/// Learning rate of the current iteration, as a single F32.
#[derive(Clone, Debug, PartialEq)]
pub struct LearningRate(pub LearningRateSchedule);

impl Kernel for LearningRate {
    fn name(&self) -> Cow<'_, str> {
        "LearningRate".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        check_counter(args_1!(inputs))?;
        Ok(tvec!(BlobFact::shape::<f32>([1])))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let iter = args_1!(inputs).as_slice::<i64>()?[0];
        Ok(tvec!(Tensor::from_vec(&[1], vec![self.0.rate(iter)])?))
    }
}

/// Inputs X0, w0, X1, w1... Output `sum(Xi * wi)`, each weight a single
/// value.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightedSum;

impl Kernel for WeightedSum {
    fn name(&self) -> Cow<'_, str> {
        "WeightedSum".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        ensure!(!inputs.is_empty() && inputs.len() % 2 == 0, "WeightedSum expects pairs");
        let x0 = inputs[0];
        check_float(x0, "WeightedSum data")?;
        for pair in inputs.chunks(2) {
            check_same(x0, pair[0], "WeightedSum data")?;
            check_float(pair[1], "WeightedSum weight")?;
            ensure!(
                pair[1].volume() == 1,
                "WeightedSum weight should be a single value, got {}",
                pair[1]
            );
        }
        Ok(tvec!(x0.clone()))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let mut sum = vec![0f32; inputs[0].len()];
        for pair in inputs.chunks(2) {
            let w = pair[1].as_slice::<f32>()?[0];
            for (s, x) in sum.iter_mut().zip(pair[0].as_slice::<f32>()?) {
                *s += x * w;
            }
        }
        Ok(tvec!(Tensor::from_vec(inputs[0].shape(), sum)?))
    }
}
