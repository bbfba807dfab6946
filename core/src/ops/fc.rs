use std::borrow::Cow;

use ndarray::prelude::*;

use crate::errors::DreamResult;
use crate::model::OperatorNode;
use crate::ops::{check_float, check_float_rank, check_same, Kernel, OpKind, OpRegister};
use dream_data::internal::*;

pub fn register_all_ops(reg: &mut OpRegister) {
    reg.insert(OpKind::FC, |node| Ok(Box::new(FullyConnected::from_node(node)?)));
    reg.insert(OpKind::FCGradient, |node| {
        Ok(Box::new(FullyConnectedGradient(FullyConnected::from_node(node)?)))
    });
}

/// `Y = X · Wᵀ + b`, X flattened to a matrix at `axis`.
#[derive(Clone, Debug, PartialEq, new)]
pub struct FullyConnected {
    pub axis: usize,
}

impl FullyConnected {
    fn from_node(node: &OperatorNode) -> DreamResult<FullyConnected> {
        let axis = node.get_arg_opt_int("axis")?.unwrap_or(1);
        ensure!(axis >= 0, "{}: negative axis", node.label());
        Ok(FullyConnected::new(axis as usize))
    }

    /// Rows, depth and outputs of the product.
    fn dims(&self, x: &BlobFact, w: &BlobFact) -> DreamResult<(usize, usize, usize)> {
        check_float(x, "FC input")?;
        check_float_rank(w, 2, "FC weights")?;
        ensure!(self.axis <= x.rank(), "FC axis {} out of {}", self.axis, x);
        let rows = x.shape[..self.axis].iter().product::<usize>();
        let depth = x.shape[self.axis..].iter().product::<usize>();
        ensure!(w.shape[1] == depth, "FC weights {} do not match input {}", w, x);
        Ok((rows, depth, w.shape[0]))
    }

    fn output_fact(&self, x: &BlobFact, outputs: usize) -> BlobFact {
        let mut shape: TVec<usize> = x.shape[..self.axis].into();
        shape.push(outputs);
        BlobFact::shape::<f32>(shape)
    }
}

impl Kernel for FullyConnected {
    fn name(&self) -> Cow<'_, str> {
        "FC".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (x, w, b) = args_3!(inputs);
        let (_, _, n) = self.dims(x, w)?;
        check_same(b, &BlobFact::shape::<f32>([n]), "FC bias")?;
        Ok(tvec!(self.output_fact(x, n)))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (x, w, b) = args_3!(inputs);
        let (m, k, n) = self.dims(&x.fact(), &w.fact())?;
        let fact = self.output_fact(&x.fact(), n);
        let xm = ArrayView2::from_shape((m, k), x.as_slice::<f32>()?)?;
        let wm = ArrayView2::from_shape((n, k), w.as_slice::<f32>()?)?;
        let b = ArrayView1::from(b.as_slice::<f32>()?);
        let y = xm.dot(&wm.t()) + &b;
        Ok(tvec!(y.into_tensor().into_shape(&fact.shape)?))
    }
}

/// Inputs X, W, dY. Outputs dX, dW, db.
#[derive(Clone, Debug, PartialEq)]
pub struct FullyConnectedGradient(pub FullyConnected);

impl Kernel for FullyConnectedGradient {
    fn name(&self) -> Cow<'_, str> {
        "FCGradient".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (x, w, dy) = args_3!(inputs);
        let (_, _, n) = self.0.dims(x, w)?;
        check_same(dy, &self.0.output_fact(x, n), "FC dY")?;
        Ok(tvec!(x.clone(), w.clone(), BlobFact::shape::<f32>([n])))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (x, w, dy) = args_3!(inputs);
        let (m, k, n) = self.0.dims(&x.fact(), &w.fact())?;
        let xm = ArrayView2::from_shape((m, k), x.as_slice::<f32>()?)?;
        let wm = ArrayView2::from_shape((n, k), w.as_slice::<f32>()?)?;
        let dym = ArrayView2::from_shape((m, n), dy.as_slice::<f32>()?)?;
        let dx = dym.dot(&wm);
        let dw = dym.t().dot(&xm);
        let db = dym.sum_axis(Axis(0));
        Ok(tvec!(
            dx.into_tensor().into_shape(x.shape())?,
            dw.into_tensor(),
            db.into_tensor()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_at_axis() {
        let fc = FullyConnected::new(1);
        let x = Tensor::from_vec(&[1, 2, 1, 1], vec![1f32, 2.]).unwrap();
        let w = Tensor::from_vec(&[3, 2], vec![1f32, 0., 0., 1., 1., 1.]).unwrap();
        let b = Tensor::from_vec(&[3], vec![0f32, 0., 10.]).unwrap();
        let facts = fc.output_facts(&[&x.fact(), &w.fact(), &b.fact()]).unwrap();
        assert_eq!(facts[0], BlobFact::shape::<f32>([1, 3]));
        let y = fc.eval(&[&x, &w, &b]).unwrap().remove(0);
        assert_eq!(y.as_slice::<f32>().unwrap(), &[1., 2., 13.]);
    }

    #[test]
    fn gradient() {
        let grad = FullyConnectedGradient(FullyConnected::new(1));
        let x = Tensor::from_vec(&[2, 2], vec![1f32, 2., 3., 4.]).unwrap();
        let w = Tensor::from_vec(&[1, 2], vec![0.5f32, -1.]).unwrap();
        let dy = Tensor::from_vec(&[2, 1], vec![1f32, 2.]).unwrap();
        let out = grad.eval(&[&x, &w, &dy]).unwrap();
        assert_eq!(out[0].as_slice::<f32>().unwrap(), &[0.5, -1., 1., -2.]);
        assert_eq!(out[1].as_slice::<f32>().unwrap(), &[7., 10.]);
        assert_eq!(out[2].as_slice::<f32>().unwrap(), &[3.]);
    }
}
