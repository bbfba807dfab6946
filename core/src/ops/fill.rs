use std::borrow::Cow;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::errors::DreamResult;
use crate::model::{ArgValue, OperatorNode};
use crate::ops::{Kernel, OpKind, OpRegister};
use dream_data::internal::*;

pub fn register_all_ops(reg: &mut OpRegister) {
    reg.insert(OpKind::ConstantFill, ConstantFill::build);
    reg.insert(OpKind::UniformFill, UniformFill::build);
    reg.insert(OpKind::GivenTensorFill, GivenTensorFill::build);
    reg.insert(OpKind::GivenTensorInt64Fill, GivenTensorFill::build);
}

fn shape_arg(node: &OperatorNode) -> DreamResult<Option<TVec<usize>>> {
    Ok(node.get_arg_opt_dims("shape")?.map(|v| v.into_iter().collect()))
}

/// Fill with a constant. The shape comes from the `shape` argument, or from
/// the input when there is one.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstantFill {
    pub datum_type: DatumType,
    pub shape: Option<TVec<usize>>,
    pub value: f64,
}

impl ConstantFill {
    pub fn build(node: &OperatorNode) -> DreamResult<Box<dyn Kernel>> {
        let datum_type = match node.get_arg_opt_int("dtype")? {
            Some(code) => DatumType::from_proto_code(code)
                .ok_or_else(|| format_err!("{}: unsupported dtype {}", node.label(), code))?,
            None => DatumType::F32,
        };
        let value = match node.args.get("value") {
            None => 0.0,
            Some(ArgValue::Int(i)) => *i as f64,
            Some(ArgValue::Float(f)) => *f as f64,
            Some(other) => bail!("{}: invalid fill value {}", node.label(), other),
        };
        let shape = shape_arg(node)?;
        ensure!(
            shape.is_some() || node.inputs.len() == 1,
            "{}: ConstantFill needs a shape argument or an input",
            node.label()
        );
        Ok(Box::new(ConstantFill { datum_type, shape, value }))
    }

    fn shape_for<'a>(&'a self, input: Option<&'a [usize]>) -> DreamResult<&'a [usize]> {
        input
            .or(self.shape.as_deref())
            .ok_or_else(|| format_err!("ConstantFill without shape"))
    }
}

impl Kernel for ConstantFill {
    fn name(&self) -> Cow<'_, str> {
        "ConstantFill".into()
    }

    fn output_facts(&self, inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        let shape = self.shape_for(inputs.first().map(|f| &*f.shape))?;
        Ok(tvec!(BlobFact::dt_shape(self.datum_type, shape)))
    }

    fn eval(&self, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let shape = self.shape_for(inputs.first().map(|t| t.shape()))?;
        let tensor = match self.datum_type {
            DatumType::F32 => Tensor::filled(shape, self.value as f32),
            DatumType::I64 => Tensor::filled(shape, self.value as i64),
        };
        Ok(tvec!(tensor))
    }
}

/// Fill with values drawn uniformly in `[min, max]`.
#[derive(Clone, Debug, PartialEq)]
pub struct UniformFill {
    pub shape: TVec<usize>,
    pub min: f32,
    pub max: f32,
    pub seed: Option<u64>,
}

impl UniformFill {
    pub fn build(node: &OperatorNode) -> DreamResult<Box<dyn Kernel>> {
        let shape =
            shape_arg(node)?.ok_or_else(|| format_err!("{}: shape is required", node.label()))?;
        let min = node.get_arg_opt_float("min")?.unwrap_or(0.0);
        let max = node.get_arg_opt_float("max")?.unwrap_or(1.0);
        ensure!(min <= max, "{}: empty range [{}, {}]", node.label(), min, max);
        let seed = node.get_arg_opt_int("random_seed")?.map(|s| s as u64);
        Ok(Box::new(UniformFill { shape, min, max, seed }))
    }
}

impl Kernel for UniformFill {
    fn name(&self) -> Cow<'_, str> {
        "UniformFill".into()
    }

    fn output_facts(&self, _inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        Ok(tvec!(BlobFact::shape::<f32>(&self.shape)))
    }

    fn eval(&self, _inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        let mut rng = match self.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let volume = self.shape.iter().product::<usize>();
        let data: Vec<f32> = (0..volume).map(|_| rng.gen_range(self.min..=self.max)).collect();
        Ok(tvec!(Tensor::from_vec(&self.shape, data)?))
    }
}

/// Fill with the literal `values` argument, floats or 64 bits ints.
#[derive(Clone, Debug, PartialEq)]
pub struct GivenTensorFill {
    pub value: Tensor,
}

impl GivenTensorFill {
    pub fn build(node: &OperatorNode) -> DreamResult<Box<dyn Kernel>> {
        let shape =
            shape_arg(node)?.ok_or_else(|| format_err!("{}: shape is required", node.label()))?;
        let value = if node.op == OpKind::GivenTensorInt64Fill {
            Tensor::from_shape(&shape, node.get_arg_ints("values")?)
        } else {
            Tensor::from_shape(&shape, node.get_arg_floats("values")?)
        }
        .with_context(|| format!("Building {}", node.label()))?;
        Ok(Box::new(GivenTensorFill { value }))
    }
}

impl Kernel for GivenTensorFill {
    fn name(&self) -> Cow<'_, str> {
        "GivenTensorFill".into()
    }

    fn output_facts(&self, _inputs: &[&BlobFact]) -> DreamResult<TVec<BlobFact>> {
        Ok(tvec!(self.value.fact()))
    }

    fn eval(&self, _inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        Ok(tvec!(self.value.clone()))
    }
}
