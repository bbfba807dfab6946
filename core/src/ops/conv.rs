//! Grouped 2D convolution by im2col and matrix products.
use std::borrow::Cow;

use ndarray::prelude::*;

use crate::errors::DreamResult;
use crate::model::OperatorNode;
use crate::ops::geometry::{nchw, Geometry, Window};
use crate::ops::{check_float_rank, check_same, Kernel, OpKind, OpRegister};
use dream_data::internal::*;

pub fn register_all_ops(reg: &mut OpRegister) {
    reg.insert(OpKind::Conv, Conv::build);
    reg.insert(OpKind::ConvGradient, ConvGradient::build);
}

/// Unfold the receptive fields of a `[C, H, W]` input into the columns of a
/// `[C * kh * kw, oh * ow]` matrix.
pub fn im2col(x: ArrayView3<f32>, window: &Window) -> Array2<f32> {
    let channels = x.shape()[0];
    let [kh, kw] = window.kernel;
    let [oh, ow] = window.output;
    let mut col = Array2::<f32>::zeros((channels * kh * kw, oh * ow));
    for c in 0..channels {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (c * kh + ki) * kw + kj;
                for oy in 0..oh {
                    let Some(y) = window.input_coord(0, oy, ki) else { continue };
                    for ox in 0..ow {
                        if let Some(xx) = window.input_coord(1, ox, kj) {
                            col[(row, oy * ow + ox)] = x[(c, y, xx)];
                        }
                    }
                }
            }
        }
    }
    col
}

/// Fold columns back onto a `[C, H, W]` input, accumulating overlaps.
pub fn col2im(col: ArrayView2<f32>, window: &Window, mut x: ArrayViewMut3<f32>) {
    let channels = x.shape()[0];
    let [kh, kw] = window.kernel;
    let [oh, ow] = window.output;
    for c in 0..channels {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = (c * kh + ki) * kw + kj;
                for oy in 0..oh {
                    let Some(y) = window.input_coord(0, oy, ki) else { continue };
                    for ox in 0..ow {
                        if let Some(xx) = window.input_coord(1, ox, kj) {
                            x[(c, y, xx)] += col[(row, oy * ow + ox)];
                        }
                    }
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Conv {
    pub geometry: Geometry,
    pub group: usize,
}

/// Dimensions of a convolution, checked against each other.
#[derive(Clone, Debug)]
struct ConvShape {
    batch: usize,
    channels: usize,
    filters: usize,
    window: Window,
}

impl Conv {
    pub fn build(node: &OperatorNode) -> DreamResult<Box<dyn Kernel>> {
        Ok(Box::new(Conv::from_node(node)?))
    }

    fn from_node(node: &OperatorNode) -> DreamResult<Conv> {
        let geometry = Geometry::from_node(node)?;
        ensure!(!geometry.global, "{}: global convolution is not supported", node.label());
        let group = node.get_arg_opt_int("group")?.unwrap_or(1);
        ensure!(group > 0, "{}: invalid group {}", node.label(), group);
        Ok(Conv { geometry, group: group as usize })
    }

    fn shape(&self, x: &BlobFact, w: &BlobFact) -> DreamResult<ConvShape> {
        let (batch, channels, hw) = nchw(x, "Conv input")?;
        check_float_rank(w, 4, "Conv filter")?;
        let filters = w.shape[0];
        ensure!(
            channels == w.shape[1] * self.group && filters % self.group == 0,
            "Conv filter {} does not match input {} with {} groups",
            w,
            x,
            self.group
        );
        let kernel = [w.shape[2], w.shape[3]];
        if let Some(k) = self.geometry.kernel {
            ensure!(k == kernel, "Conv kernel {:?} does not match filter {}", k, w);
        }
        let window = self.geometry.resolve(hw, Some(kernel))?;
        Ok(ConvShape { batch, channels, filters, window })
    }
}

impl Kernel for Conv {
    fn name(&self) -> Cow<'_, str> {
        "Conv".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        ensure!(inputs.len() == 2 || inputs.len() == 3, "Conv expects 2 or 3 inputs");
        let shape = self.shape(inputs[0], inputs[1])?;
        if let Some(bias) = inputs.get(2) {
            check_same(bias, &BlobFact::shape::<f32>([shape.filters]), "Conv bias")?;
        }
        let [oh, ow] = shape.window.output;
        Ok(tvec!(BlobFact::shape::<f32>([shape.batch, shape.filters, oh, ow])))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (x, w) = (inputs[0], inputs[1]);
        let ConvShape { batch, channels, filters, window } = self.shape(&x.fact(), &w.fact())?;
        let (cg, mg) = (channels / self.group, filters / self.group);
        let x = x.to_array_view::<f32>()?.into_dimensionality::<Ix4>()?;
        let w = ArrayView2::from_shape((filters, w.len() / filters), w.as_slice::<f32>()?)?;
        let pixels = window.output_volume();
        let mut y = Array3::<f32>::zeros((batch, filters, pixels));
        for n in 0..batch {
            for g in 0..self.group {
                let col = im2col(x.slice(s![n, g * cg..(g + 1) * cg, .., ..]), &window);
                let out = w.slice(s![g * mg..(g + 1) * mg, ..]).dot(&col);
                y.slice_mut(s![n, g * mg..(g + 1) * mg, ..]).assign(&out);
            }
        }
        if let Some(bias) = inputs.get(2) {
            for (m, b) in bias.as_slice::<f32>()?.iter().enumerate() {
                y.slice_mut(s![.., m, ..]).mapv_inplace(|v| v + b);
            }
        }
        let [oh, ow] = window.output;
        Ok(tvec!(y.into_tensor().into_shape(&[batch, filters, oh, ow])?))
    }
}

/// Inputs X, W, dY. Outputs dX, dW and optionally db.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvGradient {
    pub conv: Conv,
    pub bias: bool,
}

impl ConvGradient {
    pub fn build(node: &OperatorNode) -> DreamResult<Box<dyn Kernel>> {
        ensure!(
            node.outputs.len() == 2 || node.outputs.len() == 3,
            "{}: ConvGradient has 2 or 3 outputs",
            node.label()
        );
        Ok(Box::new(ConvGradient { conv: Conv::from_node(node)?, bias: node.outputs.len() == 3 }))
    }
}

impl Kernel for ConvGradient {
    fn name(&self) -> Cow<'_, str> {
        "ConvGradient".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (x, w, dy) = args_3!(inputs);
        let shape = self.conv.shape(x, w)?;
        let [oh, ow] = shape.window.output;
        check_same(dy, &BlobFact::shape::<f32>([shape.batch, shape.filters, oh, ow]), "Conv dY")?;
        let mut facts = tvec!(x.clone(), w.clone());
        if self.bias {
            facts.push(BlobFact::shape::<f32>([shape.filters]));
        }
        Ok(facts)
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (x, w, dy) = args_3!(inputs);
        let ConvShape { batch, channels, filters, window } =
            self.conv.shape(&x.fact(), &w.fact())?;
        let group = self.conv.group;
        let (cg, mg) = (channels / group, filters / group);
        let x_shape = x.shape();
        let x = x.to_array_view::<f32>()?.into_dimensionality::<Ix4>()?;
        let w_shape = w.shape();
        let k = w.len() / filters;
        let w = ArrayView2::from_shape((filters, k), w.as_slice::<f32>()?)?;
        let pixels = window.output_volume();
        let dy = ArrayView3::from_shape((batch, filters, pixels), dy.as_slice::<f32>()?)?;

        let mut dx = Array4::<f32>::zeros((x_shape[0], x_shape[1], x_shape[2], x_shape[3]));
        let mut dw = Array2::<f32>::zeros((filters, k));
        for n in 0..batch {
            for g in 0..group {
                let dyg = dy.slice(s![n, g * mg..(g + 1) * mg, ..]);
                let col = im2col(x.slice(s![n, g * cg..(g + 1) * cg, .., ..]), &window);
                let mut dwg = dw.slice_mut(s![g * mg..(g + 1) * mg, ..]);
                dwg += &dyg.dot(&col.t());
                let dcol = w.slice(s![g * mg..(g + 1) * mg, ..]).t().dot(&dyg);
                col2im(dcol.view(), &window, dx.slice_mut(s![n, g * cg..(g + 1) * cg, .., ..]));
            }
        }
        let mut outputs = tvec!(dx.into_tensor(), dw.into_tensor().into_shape(w_shape)?);
        if self.bias {
            outputs.push(dy.sum_axis(Axis(2)).sum_axis(Axis(0)).into_tensor());
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn conv(args: &[(&str, i64)]) -> OperatorNode {
        args.iter().fold(
            OperatorNode::new(OpKind::Conv).input("x").input("w").input("b").output("y"),
            |node, (k, v)| node.arg(*k, *v),
        )
    }

    #[test]
    fn one_by_one_is_a_matrix_product() {
        let kernel = Conv::build(&conv(&[("kernel", 1)])).unwrap();
        let x = Tensor::from_vec(&[1, 2, 1, 2], vec![1f32, 2., 3., 4.]).unwrap();
        let w = Tensor::from_vec(&[1, 2, 1, 1], vec![10f32, 100.]).unwrap();
        let b = Tensor::from_vec(&[1], vec![0.5f32]).unwrap();
        let facts = kernel.output_facts(&[&x.fact(), &w.fact(), &b.fact()]).unwrap();
        assert_eq!(facts[0], BlobFact::shape::<f32>([1, 1, 1, 2]));
        let y = kernel.eval(&[&x, &w, &b]).unwrap().remove(0);
        assert_eq!(y.as_slice::<f32>().unwrap(), &[310.5, 420.5]);
    }

    #[test]
    fn padded_box_filter() {
        let kernel = Conv::build(&conv(&[("kernel", 3), ("pad", 1)])).unwrap();
        let x = Tensor::filled(&[1, 1, 3, 3], 1f32);
        let w = Tensor::filled(&[1, 1, 3, 3], 1f32);
        let b = Tensor::zero::<f32>(&[1]);
        let y = kernel.eval(&[&x, &w, &b]).unwrap().remove(0);
        assert_eq!(y.as_slice::<f32>().unwrap(), &[4., 6., 4., 6., 9., 6., 4., 6., 4.]);
    }

    #[test]
    fn grouped() {
        let kernel = Conv::build(&conv(&[("kernel", 1), ("group", 2)])).unwrap();
        let x = Tensor::from_vec(&[1, 2, 1, 1], vec![1f32, 2.]).unwrap();
        let w = Tensor::from_vec(&[2, 1, 1, 1], vec![3f32, 5.]).unwrap();
        let b = Tensor::zero::<f32>(&[2]);
        let y = kernel.eval(&[&x, &w, &b]).unwrap().remove(0);
        assert_eq!(y.as_slice::<f32>().unwrap(), &[3., 10.]);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let node = conv(&[("kernel", 2), ("stride", 1), ("pad", 1)]);
        let forward = Conv::build(&node).unwrap();
        let mut grad_node = node.clone();
        grad_node.op = OpKind::ConvGradient;
        grad_node.outputs = vec!["dx".into(), "dw".into(), "db".into()];
        let backward = ConvGradient::build(&grad_node).unwrap();

        let x = Tensor::from_vec(&[1, 1, 2, 2], vec![0.5f32, -1., 2., 0.25]).unwrap();
        let w = Tensor::from_vec(&[2, 1, 2, 2], vec![1f32, 2., -1., 0.5, 0., 1., 1., -2.]).unwrap();
        let b = Tensor::from_vec(&[2], vec![0.1f32, -0.2]).unwrap();
        // objective: sum of outputs, so dY is all ones
        let y = forward.eval(&[&x, &w, &b]).unwrap().remove(0);
        let dy = Tensor::filled(y.shape(), 1f32);
        let grads = backward.eval(&[&x, &w, &dy]).unwrap();
        let sum = |x: &Tensor| -> f32 {
            forward.eval(&[x, &w, &b]).unwrap()[0].as_slice::<f32>().unwrap().iter().sum()
        };
        let eps = 0.1;
        for i in 0..4 {
            let mut plus = x.clone();
            plus.as_slice_mut::<f32>().unwrap()[i] += eps;
            let mut minus = x.clone();
            minus.as_slice_mut::<f32>().unwrap()[i] -= eps;
            let numeric = (sum(&plus) - sum(&minus)) / (2. * eps);
            assert_abs_diff_eq!(grads[0].as_slice::<f32>().unwrap()[i], numeric, epsilon = 1e-3);
        }
        assert_eq!(grads[1].shape(), &[2, 1, 2, 2]);
        // each filter tap sees every input pixel exactly once with pad 1
        assert_abs_diff_eq!(grads[1].as_slice::<f32>().unwrap()[0], 1.75, epsilon = 1e-6);
        assert_eq!(grads[2].as_slice::<f32>().unwrap(), &[9., 9.]);
    }
}
