//! Element-wise activations, softmax, dropout and scaling.
use std::borrow::Cow;

use ndarray::prelude::*;

use crate::errors::DreamResult;
use crate::model::OperatorNode;
use crate::ops::{check_float, check_same, Kernel, OpKind, OpRegister};
use dream_data::internal::*;

pub fn register_all_ops(reg: &mut OpRegister) {
    reg.insert(OpKind::Relu, |_| Ok(Box::new(Relu)));
    reg.insert(OpKind::ReluGradient, |_| Ok(Box::new(ReluGradient)));
    reg.insert(OpKind::Softmax, |node| Ok(Box::new(Softmax::from_node(node)?)));
    reg.insert(OpKind::SoftmaxGradient, |node| {
        Ok(Box::new(SoftmaxGradient(Softmax::from_node(node)?)))
    });
    reg.insert(OpKind::Dropout, |node| Ok(Box::new(Dropout { with_mask: node.outputs.len() > 1 })));
    reg.insert(OpKind::DropoutGradient, |_| Ok(Box::new(Identity)));
    reg.insert(OpKind::Scale, Scale::build);
}

fn unary_float(inputs: &[&BlobFact], what: &str) -> DreamResult<TVec<BlobFact>> {
    let x = args_1!(inputs);
    check_float(x, what)?;
    Ok(tvec!(x.clone()))
}

fn map(x: &Tensor, f: impl Fn(f32) -> f32) -> DreamResult<Tensor> {
    let data = x.as_slice::<f32>()?.iter().map(|&v| f(v)).collect();
    Tensor::from_vec(x.shape(), data)
}

#[derive(Clone, Debug, PartialEq)]
pub struct Relu;

impl Kernel for Relu {
    fn name(&self) -> Cow<'_, str> {
        "Relu".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        unary_float(inputs, "Relu input")
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let x = args_1!(inputs);
        Ok(tvec!(map(x, |v| v.max(0.0))?))
    }
}

/// Inputs Y, dY. Output dX.
#[derive(Clone, Debug, PartialEq)]
pub struct ReluGradient;

impl Kernel for ReluGradient {
    fn name(&self) -> Cow<'_, str> {
        "ReluGradient".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (y, dy) = args_2!(inputs);
        check_float(y, "Relu output")?;
        check_same(y, dy, "Relu dY")?;
        Ok(tvec!(y.clone()))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (y, dy) = args_2!(inputs);
        let data = y
            .as_slice::<f32>()?
            .iter()
            .zip(dy.as_slice::<f32>()?.iter())
            .map(|(&y, &dy)| if y > 0.0 { dy } else { 0.0 })
            .collect();
        Ok(tvec!(Tensor::from_vec(y.shape(), data)?))
    }
}

/// Softmax over the dimensions from `axis` on.
#[derive(Clone, Debug, PartialEq)]
pub struct Softmax {
    pub axis: usize,
}

impl Softmax {
    fn from_node(node: &OperatorNode) -> DreamResult<Softmax> {
        let axis = node.get_arg_opt_int("axis")?.unwrap_or(1);
        ensure!(axis >= 0, "{}: negative axis", node.label());
        Ok(Softmax { axis: axis as usize })
    }

    fn rows(&self, x: &Tensor) -> DreamResult<(usize, usize)> {
        ensure!(self.axis < x.rank(), "Softmax axis {} out of {:?}", self.axis, x.shape());
        let cols = x.shape()[self.axis..].iter().product::<usize>();
        Ok((x.len() / cols.max(1), cols))
    }
}

impl Kernel for Softmax {
    fn name(&self) -> Cow<'_, str> {
        "Softmax".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let x = args_1!(inputs);
        ensure!(self.axis < x.rank(), "Softmax axis {} out of {}", self.axis, x);
        unary_float(inputs, "Softmax input")
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let x = args_1!(inputs);
        let shape = (self.rows(x)?, x.shape());
        let mut y = ArrayView2::from_shape(shape.0, x.as_slice::<f32>()?)?.to_owned();
        for mut row in y.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            row.mapv_inplace(|v| (v - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|v| v / sum);
        }
        Ok(tvec!(y.into_tensor().into_shape(shape.1)?))
    }
}

/// Inputs Y, dY. Output dX.
#[derive(Clone, Debug, PartialEq)]
pub struct SoftmaxGradient(pub Softmax);

impl Kernel for SoftmaxGradient {
    fn name(&self) -> Cow<'_, str> {
        "SoftmaxGradient".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (y, dy) = args_2!(inputs);
        check_same(y, dy, "Softmax dY")?;
        self.0.output_facts(&[y])
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (y, dy) = args_2!(inputs);
        let dims = self.0.rows(y)?;
        let ym = ArrayView2::from_shape(dims, y.as_slice::<f32>()?)?;
        let mut dx = ArrayView2::from_shape(dims, dy.as_slice::<f32>()?)?.to_owned();
        for (mut d, y) in dx.rows_mut().into_iter().zip(ym.rows()) {
            let dot = d.dot(&y);
            ndarray::Zip::from(&mut d).and(&y).for_each(|d, y| *d = y * (*d - dot));
        }
        Ok(tvec!(dx.into_tensor().into_shape(y.shape())?))
    }
}

/// Dropout at inference time: the identity. The optional mask output is
/// all ones.
#[derive(Clone, Debug, PartialEq)]
pub struct Dropout {
    pub with_mask: bool,
}

impl Kernel for Dropout {
    fn name(&self) -> Cow<'_, str> {
        "Dropout".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let mut facts = unary_float(inputs, "Dropout input")?;
        if self.with_mask {
            facts.push(facts[0].clone());
        }
        Ok(facts)
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let x = args_1!(inputs);
        let mut outputs = tvec!(x.clone());
        if self.with_mask {
            outputs.push(Tensor::filled(x.shape(), 1f32));
        }
        Ok(outputs)
    }
}

/// Gradient of an identity: dY passes through.
#[derive(Clone, Debug, PartialEq)]
pub struct Identity;

impl Kernel for Identity {
    fn name(&self) -> Cow<'_, str> {
        "Identity".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        unary_float(inputs, "Identity input")
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        Ok(tvec!(args_1!(inputs).clone()))
    }
}

/// `y = x * scale`. Its own gradient.
#[derive(Clone, Debug, PartialEq)]
pub struct Scale {
    pub scale: f32,
}

impl Scale {
    pub fn build(node: &OperatorNode) -> DreamResult<Box<dyn Kernel>> {
        Ok(Box::new(Scale { scale: node.get_arg_opt_float("scale")?.unwrap_or(1.0) }))
    }
}

impl Kernel for Scale {
    fn name(&self) -> Cow<'_, str> {
        "Scale".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        unary_float(inputs, "Scale input")
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let x = args_1!(inputs);
        Ok(tvec!(map(x, |v| v * self.scale)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn relu_and_gradient() {
        let x = Tensor::from_vec(&[4], vec![-1f32, 0., 2., 3.]).unwrap();
        let y = Relu.eval(&[&x]).unwrap().remove(0);
        assert_eq!(y.as_slice::<f32>().unwrap(), &[0., 0., 2., 3.]);
        let dy = Tensor::filled(&[4], 5f32);
        let dx = ReluGradient.eval(&[&y, &dy]).unwrap().remove(0);
        assert_eq!(dx.as_slice::<f32>().unwrap(), &[0., 0., 5., 5.]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = Tensor::from_vec(&[2, 3], vec![1f32, 2., 3., 1000., 1000., 1000.]).unwrap();
        let y = Softmax { axis: 1 }.eval(&[&x]).unwrap().remove(0);
        let y = y.as_slice::<f32>().unwrap();
        assert_abs_diff_eq!(y[..3].iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(y[3], 1.0 / 3.0, epsilon = 1e-6);
        assert!(y[2] > y[1] && y[1] > y[0]);
    }

    #[test]
    fn softmax_gradient_of_uniform_upstream_vanishes() {
        let y = Tensor::from_vec(&[1, 3], vec![0.2f32, 0.3, 0.5]).unwrap();
        let dy = Tensor::filled(&[1, 3], 2f32);
        let dx = SoftmaxGradient(Softmax { axis: 1 }).eval(&[&y, &dy]).unwrap().remove(0);
        for v in dx.as_slice::<f32>().unwrap() {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn dropout_is_identity() {
        let x = Tensor::from_vec(&[2], vec![1f32, 2.]).unwrap();
        let out = Dropout { with_mask: true }.eval(&[&x]).unwrap();
        assert_eq!(out[0], x);
        assert_eq!(out[1], Tensor::filled(&[2], 1f32));
    }

    #[test]
    fn scale() {
        let x = Tensor::from_vec(&[2], vec![1f32, -2.]).unwrap();
        let y = Scale { scale: -1.0 }.eval(&[&x]).unwrap().remove(0);
        assert_eq!(y.as_slice::<f32>().unwrap(), &[-1., 2.]);
    }
}
