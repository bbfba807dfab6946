use std::borrow::Cow;

use crate::errors::DreamResult;
use crate::ops::{check_float, check_float_rank, check_same, Kernel, OpKind, OpRegister};
use dream_data::internal::*;

/// Probabilities are clamped to this before taking the log.
pub const LOG_THRESHOLD: f32 = 1e-20;

pub fn register_all_ops(reg: &mut OpRegister) {
    reg.insert(OpKind::LabelCrossEntropy, |_| Ok(Box::new(LabelCrossEntropy)));
    reg.insert(OpKind::LabelCrossEntropyGradient, |_| Ok(Box::new(LabelCrossEntropyGradient)));
}

/// Check X is `[N, D]` probabilities and labels are `N` indices.
fn check_inputs(x: &BlobFact, label: &BlobFact) -> DreamResult<(usize, usize)> {
    check_float_rank(x, 2, "LabelCrossEntropy input")?;
    ensure!(
        label.datum_type == DatumType::I64 && label.shape.as_slice() == &x.shape[..1],
        "LabelCrossEntropy labels should be {}xI64, got {}",
        x.shape[0],
        label
    );
    Ok((x.shape[0], x.shape[1]))
}

fn labels(label: &Tensor, classes: usize) -> DreamResult<impl Iterator<Item = usize> + '_> {
    let labels = label.as_slice::<i64>()?;
    if let Some(bad) = labels.iter().find(|&&l| l < 0 || l as usize >= classes) {
        bail!("Label {} out of {} classes", bad, classes)
    }
    Ok(labels.iter().map(|&l| l as usize))
}

/// Inputs X, label. Output `-ln(X[n, label[n]])` per row.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelCrossEntropy;

impl Kernel for LabelCrossEntropy {
    fn name(&self) -> Cow<'_, str> {
        "LabelCrossEntropy".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (x, label) = args_2!(inputs);
        let (n, _) = check_inputs(x, label)?;
        Ok(tvec!(BlobFact::shape::<f32>([n])))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (x, label) = args_2!(inputs);
        let (n, d) = check_inputs(&x.fact(), &label.fact())?;
        let probs = x.as_slice::<f32>()?;
        let xent = labels(label, d)?
            .enumerate()
            .map(|(row, l)| -probs[row * d + l].max(LOG_THRESHOLD).ln())
            .collect();
        Ok(tvec!(Tensor::from_vec(&[n], xent)?))
    }
}

/// Inputs X, label, dY. Output dX, non zero at labelled positions only.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelCrossEntropyGradient;

impl Kernel for LabelCrossEntropyGradient {
    fn name(&self) -> Cow<'_, str> {
        "LabelCrossEntropyGradient".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (x, label, dy) = args_3!(inputs);
        let (n, _) = check_inputs(x, label)?;
        check_float(dy, "LabelCrossEntropy dY")?;
        check_same(dy, &BlobFact::shape::<f32>([n]), "LabelCrossEntropy dY")?;
        Ok(tvec!(x.clone()))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (x, label, dy) = args_3!(inputs);
        let (_, d) = check_inputs(&x.fact(), &label.fact())?;
        let probs = x.as_slice::<f32>()?;
        let dy = dy.as_slice::<f32>()?;
        let mut dx = Tensor::zero::<f32>(x.shape());
        let grad = dx.as_slice_mut::<f32>()?;
        for (row, l) in labels(label, d)?.enumerate() {
            let ix = row * d + l;
            grad[ix] = -dy[row] / probs[ix].max(LOG_THRESHOLD);
        }
        Ok(tvec!(dx))
    }
}
