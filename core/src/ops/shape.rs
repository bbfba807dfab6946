//! Operators moving data around without computing: reshape, slice, concat.
use std::borrow::Cow;

use itertools::Itertools;
use ndarray::{ArrayD, ArrayViewD, Axis, Slice as AxisSlice};

use crate::errors::DreamResult;
use crate::model::OperatorNode;
use crate::ops::{check_float, check_same, Kernel, OpKind, OpRegister};
use dream_data::internal::*;

pub fn register_all_ops(reg: &mut OpRegister) {
    reg.insert(OpKind::Reshape, Reshape::build);
    reg.insert(OpKind::ReshapeGradient, |_| Ok(Box::new(ReshapeGradient)));
    reg.insert(OpKind::Slice, |node| Ok(Box::new(Slice::from_node(node)?)));
    reg.insert(OpKind::SliceGradient, |node| Ok(Box::new(SliceGradient(Slice::from_node(node)?))));
    reg.insert(OpKind::Concat, |node| {
        Ok(Box::new(Concat { axis: Concat::axis(node)?, with_split: node.outputs.len() > 1 }))
    });
    reg.insert(OpKind::ConcatGradient, |node| {
        Ok(Box::new(ConcatGradient { axis: Concat::axis(node)? }))
    });
}

/// Reshape to the `shape` argument, where 0 copies the input dimension and
/// -1 is inferred. The optional second output holds the input shape.
#[derive(Clone, Debug, PartialEq)]
pub struct Reshape {
    pub shape: Vec<i64>,
    pub with_old_shape: bool,
}

impl Reshape {
    pub fn build(node: &OperatorNode) -> DreamResult<Box<dyn Kernel>> {
        ensure!(
            node.inputs.len() == 1,
            "{}: Reshape only supports the shape given as an argument",
            node.label()
        );
        let shape = node.get_arg_ints("shape")?.to_vec();
        ensure!(
            shape.iter().all(|&d| d >= -1) && shape.iter().filter(|&&d| d == -1).count() <= 1,
            "{}: invalid shape {:?}",
            node.label(),
            shape
        );
        Ok(Box::new(Reshape { shape, with_old_shape: node.outputs.len() > 1 }))
    }

    pub fn output_shape(&self, input: &[usize]) -> DreamResult<TVec<usize>> {
        let volume = input.iter().product::<usize>();
        let mut shape: TVec<usize> = tvec!();
        for (ix, &d) in self.shape.iter().enumerate() {
            shape.push(match d {
                0 => *input
                    .get(ix)
                    .ok_or_else(|| format_err!("Can not copy dim {} of {:?}", ix, input))?,
                -1 => 1,
                d => d as usize,
            });
        }
        if let Some(infer) = self.shape.iter().position(|&d| d == -1) {
            let known = shape.iter().product::<usize>();
            ensure!(
                known > 0 && volume % known == 0,
                "Can not reshape {:?} to {:?}",
                input,
                self.shape
            );
            shape[infer] = volume / known;
        }
        ensure!(
            shape.iter().product::<usize>() == volume,
            "Can not reshape {:?} to {:?}",
            input,
            self.shape
        );
        Ok(shape)
    }
}

impl Kernel for Reshape {
    fn name(&self) -> Cow<'_, str> {
        "Reshape".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let x = args_1!(inputs);
        let mut facts = tvec!(BlobFact::dt_shape(x.datum_type, self.output_shape(&x.shape)?));
        if self.with_old_shape {
            facts.push(BlobFact::shape::<i64>([x.rank()]));
        }
        Ok(facts)
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let x = args_1!(inputs);
        let shape = self.output_shape(x.shape())?;
        let mut outputs = tvec!(x.clone().into_shape(&shape)?);
        if self.with_old_shape {
            let old = x.shape().iter().map(|&d| d as i64).collect_vec();
            outputs.push(Tensor::from_vec(&[old.len()], old)?);
        }
        Ok(outputs)
    }
}

/// Inputs X, dY. Output dY in the shape of X.
#[derive(Clone, Debug, PartialEq)]
pub struct ReshapeGradient;

impl Kernel for ReshapeGradient {
    fn name(&self) -> Cow<'_, str> {
        "ReshapeGradient".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (x, dy) = args_2!(inputs);
        ensure!(x.volume() == dy.volume(), "Reshape dY {} does not match input {}", dy, x);
        Ok(tvec!(BlobFact::dt_shape(dy.datum_type, &x.shape)))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (x, dy) = args_2!(inputs);
        Ok(tvec!(dy.clone().into_shape(x.shape())?))
    }
}

/// Slice with `starts` and `ends`, one value per axis from the first, or
/// per axis listed in `axes`. A negative bound `b` stands for `dim + b + 1`,
/// so -1 is the end of the axis.
#[derive(Clone, Debug, PartialEq)]
pub struct Slice {
    pub starts: Vec<i64>,
    pub ends: Vec<i64>,
    pub axes: Option<Vec<usize>>,
}

impl Slice {
    fn from_node(node: &OperatorNode) -> DreamResult<Slice> {
        let starts = node.get_arg_ints("starts")?.to_vec();
        let ends = node.get_arg_ints("ends")?.to_vec();
        ensure!(starts.len() == ends.len(), "{}: starts and ends differ in length", node.label());
        let axes = node.get_arg_opt_dims("axes")?;
        if let Some(axes) = &axes {
            ensure!(
                axes.len() == starts.len(),
                "{}: axes and starts differ in length",
                node.label()
            );
        }
        Ok(Slice { starts, ends, axes })
    }

    /// The range kept on every axis of an input shape.
    pub fn ranges(&self, input: &[usize]) -> DreamResult<TVec<(usize, usize)>> {
        let mut ranges: TVec<(usize, usize)> = input.iter().map(|&d| (0, d)).collect();
        for ix in 0..self.starts.len() {
            let axis = self.axes.as_ref().map(|a| a[ix]).unwrap_or(ix);
            ensure!(axis < input.len(), "Slice axis {} out of {:?}", axis, input);
            let dim = input[axis] as i64;
            let bound = |b: i64| if b < 0 { dim + b + 1 } else { b };
            let (start, end) = (bound(self.starts[ix]), bound(self.ends[ix]));
            ensure!(
                0 <= start && start <= end && end <= dim,
                "Invalid slice {}..{} of axis {} in {:?}",
                self.starts[ix],
                self.ends[ix],
                axis,
                input
            );
            ranges[axis] = (start as usize, end as usize);
        }
        Ok(ranges)
    }
}

fn slice_view<'a>(mut x: ArrayViewD<'a, f32>, ranges: &[(usize, usize)]) -> ArrayViewD<'a, f32> {
    for (axis, &(start, end)) in ranges.iter().enumerate() {
        x.slice_axis_inplace(Axis(axis), AxisSlice::from(start..end));
    }
    x
}

impl Kernel for Slice {
    fn name(&self) -> Cow<'_, str> {
        "Slice".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let x = args_1!(inputs);
        check_float(x, "Slice input")?;
        let shape: TVec<usize> = self.ranges(&x.shape)?.iter().map(|(s, e)| e - s).collect();
        Ok(tvec!(BlobFact::shape::<f32>(shape)))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let x = args_1!(inputs);
        let ranges = self.ranges(x.shape())?;
        Ok(tvec!(slice_view(x.to_array_view::<f32>()?, &ranges).to_owned().into_tensor()))
    }
}

/// Inputs X, dY. Output dY written at the sliced region of zeros shaped
/// like X.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceGradient(pub Slice);

impl Kernel for SliceGradient {
    fn name(&self) -> Cow<'_, str> {
        "SliceGradient".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (x, dy) = args_2!(inputs);
        let sliced = self.0.output_facts(&[x])?;
        check_same(&sliced[0], dy, "Slice dY")?;
        Ok(tvec!(x.clone()))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (x, dy) = args_2!(inputs);
        let ranges = self.0.ranges(x.shape())?;
        let mut dx = ArrayD::<f32>::zeros(x.shape());
        let mut region = dx.view_mut();
        for (axis, &(start, end)) in ranges.iter().enumerate() {
            region.slice_axis_inplace(Axis(axis), AxisSlice::from(start..end));
        }
        region.assign(&dy.to_array_view::<f32>()?);
        Ok(tvec!(dx.into_tensor()))
    }
}

/// Concatenate along `axis`. The optional second output holds the size of
/// each input along the axis.
#[derive(Clone, Debug, PartialEq)]
pub struct Concat {
    pub axis: usize,
    pub with_split: bool,
}

impl Concat {
    fn axis(node: &OperatorNode) -> DreamResult<usize> {
        if let Some(order) = node.get_arg_opt_str("order")? {
            ensure!(order == "NCHW", "{}: only NCHW is supported", node.label());
        }
        ensure!(
            node.get_arg_opt_int("add_axis")?.unwrap_or(0) == 0,
            "{}: add_axis is not supported",
            node.label()
        );
        let axis = node.get_arg_opt_int("axis")?.unwrap_or(1);
        ensure!(axis >= 0, "{}: negative axis", node.label());
        Ok(axis as usize)
    }
}

/// Check the inputs agree on every axis but `axis`, return the sum along it.
fn concat_dim(axis: usize, inputs: &[&BlobFact]) -> DreamResult<usize> {
    ensure!(!inputs.is_empty(), "Concat without inputs");
    let first = inputs[0];
    check_float(first, "Concat input")?;
    ensure!(axis < first.rank(), "Concat axis {} out of {}", axis, first);
    for fact in inputs {
        ensure!(
            fact.datum_type == first.datum_type
                && fact.rank() == first.rank()
                && (0..first.rank()).all(|ax| ax == axis || fact.shape[ax] == first.shape[ax]),
            "Concat inputs {} and {} do not match along axis {}",
            first,
            fact,
            axis
        );
    }
    Ok(inputs.iter().map(|f| f.shape[axis]).sum())
}

impl Kernel for Concat {
    fn name(&self) -> Cow<'_, str> {
        "Concat".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let total = concat_dim(self.axis, inputs)?;
        let mut shape = inputs[0].shape.clone();
        shape[self.axis] = total;
        let mut facts = tvec!(BlobFact::shape::<f32>(shape));
        if self.with_split {
            facts.push(BlobFact::shape::<i64>([inputs.len()]));
        }
        Ok(facts)
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let views =
            inputs.iter().map(|t| t.to_array_view::<f32>()).collect::<DreamResult<Vec<_>>>()?;
        let y = ndarray::concatenate(Axis(self.axis), &views)?;
        let mut outputs = tvec!(y.into_tensor());
        if self.with_split {
            let split = inputs.iter().map(|t| t.shape()[self.axis] as i64).collect_vec();
            outputs.push(Tensor::from_vec(&[split.len()], split)?);
        }
        Ok(outputs)
    }
}

/// Inputs X1..Xn, dY. Outputs dX1..dXn, the slices of dY.
#[derive(Clone, Debug, PartialEq)]
pub struct ConcatGradient {
    pub axis: usize,
}

impl Kernel for ConcatGradient {
    fn name(&self) -> Cow<'_, str> {
        "ConcatGradient".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        ensure!(inputs.len() >= 2, "ConcatGradient needs inputs and dY");
        let (dy, xs) = inputs.split_last().ok_or_else(|| format_err!("no inputs"))?;
        let total = concat_dim(self.axis, xs)?;
        let mut shape = xs[0].shape.clone();
        shape[self.axis] = total;
        check_same(dy, &BlobFact::shape::<f32>(shape), "Concat dY")?;
        Ok(xs.iter().map(|f| (*f).clone()).collect())
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (dy, xs) = inputs.split_last().ok_or_else(|| format_err!("no inputs"))?;
        let dy = dy.to_array_view::<f32>()?;
        let mut offset = 0;
        let mut outputs = tvec!();
        for x in xs {
            let len = x.shape()[self.axis];
            let part = dy.slice_axis(Axis(self.axis), AxisSlice::from(offset..offset + len));
            outputs.push(part.to_owned().into_tensor());
            offset += len;
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reshape_copy_and_infer() {
        let node = OperatorNode::new(OpKind::Reshape)
            .input("x")
            .output("y")
            .output("old")
            .arg("shape", vec![0i64, -1]);
        let reshape = Reshape::build(&node).unwrap();
        let x = Tensor::zero::<f32>(&[2, 3, 4]);
        let out = reshape.eval(&[&x]).unwrap();
        assert_eq!(out[0].shape(), &[2, 12]);
        assert_eq!(out[1].as_slice::<i64>().unwrap(), &[2, 3, 4]);
        let facts = reshape.output_facts(&[&x.fact()]).unwrap();
        assert_eq!(facts[0], BlobFact::shape::<f32>([2, 12]));
        assert_eq!(facts[1], BlobFact::shape::<i64>([3]));
    }

    #[test]
    fn reshape_rejects_bad_volume() {
        let node = OperatorNode::new(OpKind::Reshape).input("x").arg("shape", vec![5i64, -1]);
        let reshape = Reshape::build(&node).unwrap();
        assert!(reshape.output_facts(&[&BlobFact::shape::<f32>([2, 3])]).is_err());
    }

    fn channel_pick(channel: i64) -> Slice {
        Slice { starts: vec![0, channel], ends: vec![-1, channel + 1], axes: None }
    }

    #[test]
    fn slice_picks_a_channel() {
        let x = Tensor::from_vec(&[1, 3, 1, 2], (0..6).map(|x| x as f32).collect()).unwrap();
        let y = channel_pick(1).eval(&[&x]).unwrap().remove(0);
        assert_eq!(y.shape(), &[1, 1, 1, 2]);
        assert_eq!(y.as_slice::<f32>().unwrap(), &[2., 3.]);
        assert!(channel_pick(3).output_facts(&[&x.fact()]).is_err());
    }

    #[test]
    fn slice_with_axes() {
        let slice = Slice { starts: vec![1], ends: vec![3], axes: Some(vec![1]) };
        let x = Tensor::from_vec(&[2, 4], (0..8).map(|x| x as f32).collect()).unwrap();
        let y = slice.eval(&[&x]).unwrap().remove(0);
        assert_eq!(y.as_slice::<f32>().unwrap(), &[1., 2., 5., 6.]);
    }

    #[test]
    fn slice_gradient_scatters() {
        let x = Tensor::zero::<f32>(&[1, 3, 1, 2]);
        let dy = Tensor::from_vec(&[1, 1, 1, 2], vec![7f32, 8.]).unwrap();
        let dx = SliceGradient(channel_pick(2)).eval(&[&x, &dy]).unwrap().remove(0);
        assert_eq!(dx.as_slice::<f32>().unwrap(), &[0., 0., 0., 0., 7., 8.]);
    }

    #[test]
    fn concat_and_gradient() {
        let a = Tensor::from_vec(&[1, 1, 2], vec![1f32, 2.]).unwrap();
        let b = Tensor::from_vec(&[1, 2, 2], vec![3f32, 4., 5., 6.]).unwrap();
        let concat = Concat { axis: 1, with_split: true };
        let out = concat.eval(&[&a, &b]).unwrap();
        assert_eq!(out[0].shape(), &[1, 3, 2]);
        assert_eq!(out[1].as_slice::<i64>().unwrap(), &[1, 2]);
        let grads = ConcatGradient { axis: 1 }.eval(&[&a, &b, &out[0]]).unwrap();
        assert_eq!(grads[0], a);
        assert_eq!(grads[1], b);
    }
}
