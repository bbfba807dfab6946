//! Spatial arguments shared by convolution and pooling, NCHW only.
use crate::errors::DreamResult;
use crate::model::OperatorNode;
use dream_data::internal::*;

/// `legacy_pad` values understood by caffe2.
const LEGACY_PAD_NOTSET: i64 = 0;
const LEGACY_PAD_VALID: i64 = 1;
const LEGACY_PAD_CAFFE: i64 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// None when not given as an argument.
    pub kernel: Option<[usize; 2]>,
    /// The window covers the whole input.
    pub global: bool,
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    /// Top, left, bottom, right.
    pub pads: [usize; 4],
    /// Ceil output size, as caffe (not caffe2) computes it.
    pub ceil_mode: bool,
}

/// A geometry resolved against an input size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Window {
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    pub pads: [usize; 4],
    pub input: [usize; 2],
    pub output: [usize; 2],
}

fn pair(
    node: &OperatorNode,
    one: &str,
    h: &str,
    w: &str,
    many: &str,
) -> DreamResult<Option<[usize; 2]>> {
    if let Some(v) = node.get_arg_opt_dims(many)? {
        ensure!(v.len() == 2, "{}: expected 2 values for {}, got {:?}", node.label(), many, v);
        return Ok(Some([v[0], v[1]]));
    }
    let dim = |name: &str| -> DreamResult<Option<usize>> {
        node.get_arg_opt_int(name)?
            .map(|i| {
                usize::try_from(i).map_err(|_| format_err!("{}: negative {}", node.label(), name))
            })
            .transpose()
    };
    if let (Some(h), Some(w)) = (dim(h)?, dim(w)?) {
        return Ok(Some([h, w]));
    }
    Ok(dim(one)?.map(|x| [x, x]))
}

impl Geometry {
    pub fn from_node(node: &OperatorNode) -> DreamResult<Geometry> {
        if let Some(order) = node.get_arg_opt_str("order")? {
            ensure!(order == "NCHW", "{}: only NCHW is supported, got {}", node.label(), order);
        }
        let global = node.get_arg_opt_int("global_pooling")?.unwrap_or(0) != 0;
        let kernel = pair(node, "kernel", "kernel_h", "kernel_w", "kernels")?;
        let strides = pair(node, "stride", "stride_h", "stride_w", "strides")?.unwrap_or([1, 1]);
        let dilations =
            pair(node, "dilation", "dilation_h", "dilation_w", "dilations")?.unwrap_or([1, 1]);
        ensure!(
            strides.iter().chain(dilations.iter()).all(|&x| x > 0),
            "{}: strides and dilations must be positive",
            node.label()
        );
        let pads = if let Some(v) = node.get_arg_opt_dims("pads")? {
            ensure!(v.len() == 4, "{}: expected 4 pads, got {:?}", node.label(), v);
            [v[0], v[1], v[2], v[3]]
        } else if let Some(p) = node.get_arg_opt_int("pad")? {
            let p = usize::try_from(p).map_err(|_| format_err!("{}: negative pad", node.label()))?;
            [p; 4]
        } else {
            let mut pads = [0; 4];
            for (ix, name) in ["pad_t", "pad_l", "pad_b", "pad_r"].iter().enumerate() {
                if let Some(p) = node.get_arg_opt_int(name)? {
                    pads[ix] = usize::try_from(p)
                        .map_err(|_| format_err!("{}: negative {}", node.label(), name))?;
                }
            }
            pads
        };
        let (pads, ceil_mode) = match node.get_arg_opt_int("legacy_pad")?.unwrap_or(0) {
            LEGACY_PAD_NOTSET => (pads, false),
            LEGACY_PAD_VALID => ([0; 4], false),
            LEGACY_PAD_CAFFE => (pads, true),
            other => bail!("{}: unsupported legacy_pad {}", node.label(), other),
        };
        Ok(Geometry { kernel, global, strides, dilations, pads, ceil_mode })
    }

    /// Compute the output size for an input size. `kernel` is only used
    /// when the geometry does not carry one and is not global.
    pub fn resolve(&self, input: [usize; 2], kernel: Option<[usize; 2]>) -> DreamResult<Window> {
        let (kernel, strides, pads) = if self.global {
            (input, [1, 1], [0; 4])
        } else {
            let kernel = self
                .kernel
                .or(kernel)
                .ok_or_else(|| format_err!("Kernel size is required"))?;
            (kernel, self.strides, self.pads)
        };
        let mut output = [0; 2];
        for axis in 0..2 {
            ensure!(kernel[axis] > 0, "Empty kernel {:?}", kernel);
            let dk = self.dilations[axis] * (kernel[axis] - 1) + 1;
            let padded = input[axis] + pads[axis] + pads[axis + 2];
            ensure!(
                padded >= dk,
                "Kernel {:?} does not fit in input {:?} with pads {:?}",
                kernel,
                input,
                pads
            );
            let stride = strides[axis];
            output[axis] = if self.ceil_mode {
                let mut out = (padded - dk).div_ceil(stride) + 1;
                // last window must start inside the input or its head padding
                if pads[axis] > 0 && (out - 1) * stride >= input[axis] + pads[axis] {
                    out -= 1;
                }
                out
            } else {
                (padded - dk) / stride + 1
            };
        }
        Ok(Window { kernel, strides, dilations: self.dilations, pads, input, output })
    }
}

impl Window {
    /// Input coordinate along `axis` for output position `o` and kernel
    /// offset `k`, None when it falls in the padding.
    #[inline]
    pub fn input_coord(&self, axis: usize, o: usize, k: usize) -> Option<usize> {
        let c = (o * self.strides[axis] + k * self.dilations[axis]).checked_sub(self.pads[axis])?;
        if c < self.input[axis] {
            Some(c)
        } else {
            None
        }
    }

    pub fn output_volume(&self) -> usize {
        self.output[0] * self.output[1]
    }
}

/// Split an NCHW fact in batch, channels and spatial size.
pub(crate) fn nchw(fact: &BlobFact, what: &str) -> DreamResult<(usize, usize, [usize; 2])> {
    super::check_float_rank(fact, 4, what)?;
    Ok((fact.shape[0], fact.shape[1], [fact.shape[2], fact.shape[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpKind;

    fn pool(kernel: i64, stride: i64, pad: i64, legacy: i64) -> Geometry {
        Geometry::from_node(
            &OperatorNode::new(OpKind::MaxPool)
                .arg("kernel", kernel)
                .arg("stride", stride)
                .arg("pad", pad)
                .arg("legacy_pad", legacy),
        )
        .unwrap()
    }

    #[test]
    fn alexnet_sizes() {
        let conv1 = Geometry::from_node(
            &OperatorNode::new(OpKind::Conv).arg("kernel", 11i64).arg("stride", 4i64),
        )
        .unwrap();
        assert_eq!(conv1.resolve([227, 227], None).unwrap().output, [55, 55]);
        assert_eq!(pool(3, 2, 0, 3).resolve([55, 55], None).unwrap().output, [27, 27]);
        assert_eq!(pool(3, 2, 0, 3).resolve([13, 13], None).unwrap().output, [6, 6]);
    }

    #[test]
    fn ceil_mode_differs_from_floor() {
        assert_eq!(pool(3, 2, 0, 0).resolve([56, 56], None).unwrap().output, [27, 27]);
        assert_eq!(pool(3, 2, 0, 3).resolve([56, 56], None).unwrap().output, [28, 28]);
        assert_eq!(pool(3, 2, 1, 3).resolve([112, 112], None).unwrap().output, [57, 57]);
    }

    #[test]
    fn padding_coords() {
        let w = pool(3, 1, 1, 0).resolve([4, 4], None).unwrap();
        assert_eq!(w.output, [4, 4]);
        assert_eq!(w.input_coord(0, 0, 0), None);
        assert_eq!(w.input_coord(0, 0, 1), Some(0));
        assert_eq!(w.input_coord(0, 3, 2), None);
    }

    #[test]
    fn kernel_from_filter() {
        let g = Geometry::from_node(&OperatorNode::new(OpKind::Conv).arg("pad", 1i64)).unwrap();
        assert!(g.resolve([8, 8], None).is_err());
        assert_eq!(g.resolve([8, 8], Some([3, 3])).unwrap().output, [8, 8]);
    }

    #[test]
    fn global() {
        let g = Geometry::from_node(
            &OperatorNode::new(OpKind::AveragePool).arg("global_pooling", 1i64),
        )
        .unwrap();
        let w = g.resolve([7, 5], None).unwrap();
        assert_eq!(w.kernel, [7, 5]);
        assert_eq!(w.output, [1, 1]);
    }
}
