use std::borrow::Cow;

use ndarray::prelude::*;

use crate::errors::DreamResult;
use crate::model::OperatorNode;
use crate::ops::geometry::{nchw, Geometry, Window};
use crate::ops::{check_same, Kernel, OpKind, OpRegister};
use dream_data::internal::*;

pub fn register_all_ops(reg: &mut OpRegister) {
    reg.insert(OpKind::MaxPool, |node| Pool::build(node, Pooler::Max));
    reg.insert(OpKind::AveragePool, |node| Pool::build(node, Pooler::Avg));
    reg.insert(OpKind::MaxPoolGradient, |node| PoolGradient::build(node, Pooler::Max));
    reg.insert(OpKind::AveragePoolGradient, |node| PoolGradient::build(node, Pooler::Avg));
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pooler {
    Max,
    /// Averages over the part of the window inside the input.
    Avg,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Pool {
    pub geometry: Geometry,
    pub pooler: Pooler,
}

impl Pool {
    fn from_node(node: &OperatorNode, pooler: Pooler) -> DreamResult<Pool> {
        let geometry = Geometry::from_node(node)?;
        ensure!(
            geometry.global || geometry.kernel.is_some(),
            "{}: kernel size is required",
            node.label()
        );
        Ok(Pool { geometry, pooler })
    }

    pub fn build(node: &OperatorNode, pooler: Pooler) -> DreamResult<Box<dyn Kernel>> {
        Ok(Box::new(Pool::from_node(node, pooler)?))
    }

    fn window(&self, x: &BlobFact) -> DreamResult<(BlobFact, Window)> {
        let (n, c, hw) = nchw(x, "Pooling input")?;
        let window = self.geometry.resolve(hw, None)?;
        let [oh, ow] = window.output;
        Ok((BlobFact::shape::<f32>([n, c, oh, ow]), window))
    }
}

/// Input offsets inside one `[H, W]` plane covered by the window of an
/// output position.
fn covered(window: &Window, oy: usize, ox: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
    (0..window.kernel[0])
        .filter_map(move |ki| window.input_coord(0, oy, ki))
        .flat_map(move |y| {
            (0..window.kernel[1])
                .filter_map(move |kj| window.input_coord(1, ox, kj))
                .map(move |x| (y, x))
        })
}

/// Offset of the first maximum of the window, if it covers any input.
fn argmax(
    plane: &ArrayView2<f32>,
    window: &Window,
    oy: usize,
    ox: usize,
) -> Option<(usize, usize)> {
    covered(window, oy, ox).fold(None, |best: Option<(usize, usize)>, pos| match best {
        Some(b) if plane[b] >= plane[pos] => Some(b),
        _ => Some(pos),
    })
}

impl Kernel for Pool {
    fn name(&self) -> Cow<'_, str> {
        match self.pooler {
            Pooler::Max => "MaxPool".into(),
            Pooler::Avg => "AveragePool".into(),
        }
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let x = args_1!(inputs);
        Ok(tvec!(self.window(x)?.0))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let x = args_1!(inputs);
        let (fact, window) = self.window(&x.fact())?;
        let x = x.to_array_view::<f32>()?.into_dimensionality::<Ix4>()?;
        let (n, c) = (fact.shape[0], fact.shape[1]);
        let [oh, ow] = window.output;
        let mut y = Array4::<f32>::zeros((n, c, oh, ow));
        for b in 0..n {
            for ch in 0..c {
                let plane = x.slice(s![b, ch, .., ..]);
                for oy in 0..oh {
                    for ox in 0..ow {
                        y[(b, ch, oy, ox)] = match self.pooler {
                            Pooler::Max => argmax(&plane, &window, oy, ox).map(|p| plane[p]),
                            Pooler::Avg => {
                                let (sum, count) = covered(&window, oy, ox)
                                    .fold((0f32, 0usize), |(s, c), p| (s + plane[p], c + 1));
                                Some(sum / count.max(1) as f32)
                            }
                        }
                        .unwrap_or(0.0);
                    }
                }
            }
        }
        Ok(tvec!(y.into_tensor()))
    }
}

/// Inputs X, Y, dY. Output dX.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolGradient {
    pub pool: Pool,
}

impl PoolGradient {
    pub fn build(node: &OperatorNode, pooler: Pooler) -> DreamResult<Box<dyn Kernel>> {
        Ok(Box::new(PoolGradient { pool: Pool::from_node(node, pooler)? }))
    }
}

impl Kernel for PoolGradient {
    fn name(&self) -> Cow<'_, str> {
        format!("{}Gradient", self.pool.name()).into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let (x, y, dy) = args_3!(inputs);
        let (fact, _) = self.pool.window(x)?;
        check_same(y, &fact, "Pooling output")?;
        check_same(dy, &fact, "Pooling dY")?;
        Ok(tvec!(x.clone()))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let (x, _y, dy) = args_3!(inputs);
        let (fact, window) = self.pool.window(&x.fact())?;
        let mut dx = ArrayD::<f32>::zeros(x.shape()).into_dimensionality::<Ix4>()?;
        let x = x.to_array_view::<f32>()?.into_dimensionality::<Ix4>()?;
        let dy = dy.to_array_view::<f32>()?.into_dimensionality::<Ix4>()?;
        let (n, c) = (fact.shape[0], fact.shape[1]);
        let [oh, ow] = window.output;
        for b in 0..n {
            for ch in 0..c {
                let plane = x.slice(s![b, ch, .., ..]);
                let mut dplane = dx.slice_mut(s![b, ch, .., ..]);
                for oy in 0..oh {
                    for ox in 0..ow {
                        let g = dy[(b, ch, oy, ox)];
                        match self.pool.pooler {
                            Pooler::Max => {
                                if let Some(p) = argmax(&plane, &window, oy, ox) {
                                    dplane[p] += g;
                                }
                            }
                            Pooler::Avg => {
                                let count = covered(&window, oy, ox).count().max(1) as f32;
                                for p in covered(&window, oy, ox) {
                                    dplane[p] += g / count;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(tvec!(dx.into_tensor()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(kernel: i64, stride: i64) -> OperatorNode {
        OperatorNode::new(OpKind::MaxPool).arg("kernel", kernel).arg("stride", stride)
    }

    fn x() -> Tensor {
        Tensor::from_vec(&[1, 1, 2, 4], vec![1f32, 5., 2., 0., 3., 4., 8., 8.]).unwrap()
    }

    #[test]
    fn max_and_average() {
        let max = Pool::build(&node(2, 2), Pooler::Max).unwrap();
        assert_eq!(max.eval(&[&x()]).unwrap()[0].as_slice::<f32>().unwrap(), &[5., 8.]);
        let avg = Pool::build(&node(2, 2), Pooler::Avg).unwrap();
        assert_eq!(avg.eval(&[&x()]).unwrap()[0].as_slice::<f32>().unwrap(), &[3.25, 4.5]);
    }

    #[test]
    fn global_average() {
        let node = OperatorNode::new(OpKind::AveragePool).arg("global_pooling", 1i64);
        let avg = Pool::build(&node, Pooler::Avg).unwrap();
        let y = avg.eval(&[&x()]).unwrap().remove(0);
        assert_eq!(y.shape(), &[1, 1, 1, 1]);
        assert_eq!(y.as_slice::<f32>().unwrap(), &[3.875]);
    }

    #[test]
    fn max_gradient_goes_to_first_max() {
        let grad = PoolGradient::build(&node(2, 2), Pooler::Max).unwrap();
        let y = Tensor::from_vec(&[1, 1, 1, 2], vec![5f32, 8.]).unwrap();
        let dy = Tensor::from_vec(&[1, 1, 1, 2], vec![1f32, 2.]).unwrap();
        let dx = grad.eval(&[&x(), &y, &dy]).unwrap().remove(0);
        assert_eq!(dx.as_slice::<f32>().unwrap(), &[0., 1., 0., 0., 0., 0., 2., 0.]);
    }

    #[test]
    fn average_gradient_spreads() {
        let grad = PoolGradient::build(&node(2, 2), Pooler::Avg).unwrap();
        let y = Tensor::zero::<f32>(&[1, 1, 1, 2]);
        let dy = Tensor::from_vec(&[1, 1, 1, 2], vec![4f32, 8.]).unwrap();
        let dx = grad.eval(&[&x(), &y, &dy]).unwrap().remove(0);
        assert_eq!(dx.as_slice::<f32>().unwrap(), &[1., 1., 2., 2., 1., 1., 2., 2.]);
    }
}
