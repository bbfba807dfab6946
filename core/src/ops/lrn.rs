//! Local response normalization across channels.
use std::borrow::Cow;

use ndarray::prelude::*;

use crate::errors::DreamResult;
use crate::model::OperatorNode;
use crate::ops::geometry::nchw;
use crate::ops::{check_same, Kernel, OpKind, OpRegister};
use dream_data::internal::*;

pub fn register_all_ops(reg: &mut OpRegister) {
    reg.insert(OpKind::LRN, Lrn::build);
    reg.insert(OpKind::LRNGradient, LrnGradient::build);
}

/// `y = x * (bias + alpha / size * sum(x²))^-beta`, the sum running over
/// `size` neighbouring channels.
#[derive(Clone, Debug, PartialEq)]
pub struct Lrn {
    pub size: usize,
    pub alpha: f32,
    pub beta: f32,
    pub bias: f32,
    /// Also output the scale.
    pub with_scale: bool,
}

impl Lrn {
    fn from_node(node: &OperatorNode) -> DreamResult<Lrn> {
        let size = node.get_arg_int("size")?;
        ensure!(size > 0, "{}: invalid size {}", node.label(), size);
        Ok(Lrn {
            size: size as usize,
            alpha: node.get_arg_opt_float("alpha")?.unwrap_or(0.0),
            beta: node.get_arg_opt_float("beta")?.unwrap_or(0.0),
            bias: node.get_arg_opt_float("bias")?.unwrap_or(1.0),
            with_scale: node.outputs.len() > 1,
        })
    }

    pub fn build(node: &OperatorNode) -> DreamResult<Box<dyn Kernel>> {
        Ok(Box::new(Lrn::from_node(node)?))
    }

    fn pre_pad(&self) -> usize {
        (self.size - 1) / 2
    }

    /// Channels summed for the scale of channel `c`.
    fn window(&self, c: usize, channels: usize) -> std::ops::Range<usize> {
        let start = c.saturating_sub(self.pre_pad());
        let end = (c + self.size - self.pre_pad()).min(channels);
        start..end
    }

    /// Channels whose window contains channel `c`.
    fn reverse_window(&self, c: usize, channels: usize) -> std::ops::Range<usize> {
        let start = (c + self.pre_pad() + 1).saturating_sub(self.size);
        let end = (c + self.pre_pad() + 1).min(channels);
        start..end
    }

    fn scale(&self, x: ArrayView3<f32>) -> Array3<f32> {
        let channels = x.shape()[1];
        let mut scale = Array3::<f32>::zeros(x.raw_dim());
        for c in 0..channels {
            let mut sum = scale.index_axis_mut(Axis(1), c);
            for c2 in self.window(c, channels) {
                sum.zip_mut_with(&x.index_axis(Axis(1), c2), |s, v| *s += v * v);
            }
            sum.mapv_inplace(|s| self.bias + self.alpha / self.size as f32 * s);
        }
        scale
    }
}

fn flat(t: &Tensor) -> DreamResult<ArrayView3<'_, f32>> {
    let s = t.shape();
    Ok(ArrayView3::from_shape((s[0], s[1], s[2] * s[3]), t.as_slice::<f32>()?)?)
}

impl Kernel for Lrn {
    fn name(&self) -> Cow<'_, str> {
        "LRN".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let x = args_1!(inputs);
        nchw(x, "LRN input")?;
        let mut facts = tvec!(x.clone());
        if self.with_scale {
            facts.push(x.clone());
        }
        Ok(facts)
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let x = args_1!(inputs);
        let shape = x.shape();
        let xv = flat(x)?;
        let scale = self.scale(xv);
        let mut y = xv.to_owned();
        y.zip_mut_with(&scale, |y, s| *y *= s.powf(-self.beta));
        let mut outputs = tvec!(y.into_tensor().into_shape(shape)?);
        if self.with_scale {
            outputs.push(scale.into_tensor().into_shape(shape)?);
        }
        Ok(outputs)
    }
}

/// Inputs X, Y, dY. Output dX.
#[derive(Clone, Debug, PartialEq)]
pub struct LrnGradient {
    pub lrn: Lrn,
}

impl LrnGradient {
    pub fn build(node: &OperatorNode) -> DreamResult<Box<dyn Kernel>> {
        Ok(Box::new(LrnGradient { lrn: Lrn::from_node(node)? }))
    }
}

impl Kernel for LrnGradient {
    fn name(&self) -> Cow<'_, str> {
        "LRNGradient".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (x, y, dy) = args_3!(inputs);
        nchw(x, "LRN input")?;
        check_same(x, y, "LRN output")?;
        check_same(x, dy, "LRN dY")?;
        Ok(tvec!(x.clone()))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (x, y, dy) = args_3!(inputs);
        let shape = x.shape();
        let (xv, yv, dyv) = (flat(x)?, flat(y)?, flat(dy)?);
        let channels = shape[1];
        let scale = self.lrn.scale(xv);
        // dY * Y / scale, summed over the channels each input contributes to
        let mut ratio = dyv.to_owned();
        ndarray::Zip::from(&mut ratio).and(&yv).and(&scale).for_each(|r, y, s| *r *= y / s);
        let factor = 2.0 * self.lrn.alpha * self.lrn.beta / self.lrn.size as f32;
        let mut dx = dyv.to_owned();
        dx.zip_mut_with(&scale, |d, s| *d *= s.powf(-self.lrn.beta));
        for c in 0..channels {
            let mut acc = Array2::<f32>::zeros((shape[0], shape[2] * shape[3]));
            for c2 in self.lrn.reverse_window(c, channels) {
                acc += &ratio.index_axis(Axis(1), c2);
            }
            let mut dxc = dx.index_axis_mut(Axis(1), c);
            ndarray::Zip::from(&mut dxc)
                .and(&xv.index_axis(Axis(1), c))
                .and(&acc)
                .for_each(|d, x, a| *d -= factor * x * a);
        }
        Ok(tvec!(dx.into_tensor().into_shape(shape)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn node(size: i64) -> OperatorNode {
        OperatorNode::new(OpKind::LRN)
            .output("norm")
            .output("scale")
            .arg("size", size)
            .arg("alpha", 0.5f32)
            .arg("beta", 0.75f32)
            .arg("bias", 2f32)
    }

    #[test]
    fn windows() {
        let lrn = Lrn::from_node(&node(5)).unwrap();
        assert_eq!(lrn.window(0, 8), 0..3);
        assert_eq!(lrn.window(4, 8), 2..7);
        assert_eq!(lrn.reverse_window(4, 8), 2..7);
        let even = Lrn::from_node(&node(4)).unwrap();
        assert_eq!(even.window(3, 8), 2..6);
        assert_eq!(even.reverse_window(3, 8), 1..5);
    }

    #[test]
    fn forward_values() {
        let lrn = Lrn::build(&node(3)).unwrap();
        let x = Tensor::from_vec(&[1, 2, 1, 1], vec![1f32, 2.]).unwrap();
        let out = lrn.eval(&[&x]).unwrap();
        // both windows cover both channels: scale = 2 + 0.5 / 3 * 5
        let s = 2.0 + 0.5 / 3.0 * 5.0f32;
        assert_abs_diff_eq!(out[1].as_slice::<f32>().unwrap()[0], s, epsilon = 1e-6);
        let expected = 2.0 * s.powf(-0.75);
        assert_abs_diff_eq!(out[0].as_slice::<f32>().unwrap()[1], expected, epsilon = 1e-6);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let lrn = Lrn::build(&node(3)).unwrap();
        let grad = LrnGradient::build(&node(3)).unwrap();
        let x = Tensor::from_vec(&[1, 4, 1, 1], vec![0.5f32, -1., 2., 1.5]).unwrap();
        let weights = [1f32, -2., 0.5, 3.];
        let objective = |x: &Tensor| -> f32 {
            let y = lrn.eval(&[x]).unwrap().remove(0);
            y.as_slice::<f32>().unwrap().iter().zip(weights.iter()).map(|(a, b)| a * b).sum()
        };
        let y = lrn.eval(&[&x]).unwrap().remove(0);
        let dy = Tensor::from_vec(&[1, 4, 1, 1], weights.to_vec()).unwrap();
        let dx = grad.eval(&[&x, &y, &dy]).unwrap().remove(0);
        let eps = 1e-2;
        for i in 0..4 {
            let mut plus = x.clone();
            plus.as_slice_mut::<f32>().unwrap()[i] += eps;
            let mut minus = x.clone();
            minus.as_slice_mut::<f32>().unwrap()[i] -= eps;
            let numeric = (objective(&plus) - objective(&minus)) / (2. * eps);
            assert_abs_diff_eq!(dx.as_slice::<f32>().unwrap()[i], numeric, epsilon = 1e-2);
        }
    }
}
