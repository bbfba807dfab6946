use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;

use crate::errors::DreamResult;
use crate::ops::OpKind;

/// Value of an operator argument.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    Int(i64),
    Float(f32),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strs(Vec<String>),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ArgValue::Int(i) => write!(f, "{}", i),
            ArgValue::Float(x) => write!(f, "{:?}", x),
            ArgValue::Str(s) => write!(f, "{:?}", s),
            ArgValue::Ints(v) => write!(f, "[{}]", v.iter().join(", ")),
            ArgValue::Floats(v) => {
                write!(f, "[{}]", v.iter().map(|x| format!("{:?}", x)).join(", "))
            }
            ArgValue::Strs(v) => write!(f, "[{}]", v.iter().map(|s| format!("{:?}", s)).join(", ")),
        }
    }
}

macro_rules! arg_from {
    ($t:ty, $v:ident) => {
        impl From<$t> for ArgValue {
            fn from(it: $t) -> ArgValue {
                ArgValue::$v(it.into())
            }
        }
    };
}

arg_from!(i64, Int);
arg_from!(i32, Int);
arg_from!(f32, Float);
arg_from!(&str, Str);
arg_from!(String, Str);
arg_from!(Vec<i64>, Ints);
arg_from!(Vec<f32>, Floats);
arg_from!(Vec<String>, Strs);

impl From<usize> for ArgValue {
    fn from(it: usize) -> ArgValue {
        ArgValue::Int(it as i64)
    }
}

impl From<bool> for ArgValue {
    fn from(it: bool) -> ArgValue {
        ArgValue::Int(it as i64)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DeviceType {
    #[default]
    Cpu,
    Cuda,
}

impl DeviceType {
    pub fn from_proto_code(code: i32) -> Option<DeviceType> {
        match code {
            0 => Some(DeviceType::Cpu),
            1 => Some(DeviceType::Cuda),
            _ => None,
        }
    }

    pub fn proto_code(&self) -> i32 {
        match self {
            DeviceType::Cpu => 0,
            DeviceType::Cuda => 1,
        }
    }
}

/// Where a node runs. The default device is the host processor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Device {
    pub kind: DeviceType,
    pub id: i32,
}

impl Device {
    pub fn host() -> Device {
        Device::default()
    }

    pub fn accelerator(id: i32) -> Device {
        Device { kind: DeviceType::Cuda, id }
    }

    pub fn is_host(&self) -> bool {
        self.kind == DeviceType::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Cuda => write!(f, "cuda:{}", self.id),
        }
    }
}

/// One operation of a graph, wired to blobs by name.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorNode {
    pub name: String,
    pub op: OpKind,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub args: BTreeMap<String, ArgValue>,
    pub device: Device,
}

impl OperatorNode {
    pub fn new(op: OpKind) -> OperatorNode {
        OperatorNode {
            name: String::new(),
            op,
            inputs: vec![],
            outputs: vec![],
            args: BTreeMap::new(),
            device: Device::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> OperatorNode {
        self.name = name.into();
        self
    }

    pub fn input(mut self, name: impl Into<String>) -> OperatorNode {
        self.inputs.push(name.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> OperatorNode {
        self.outputs.push(name.into());
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> OperatorNode {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn device(mut self, device: Device) -> OperatorNode {
        self.device = device;
        self
    }

    /// Node name if set, else a name made of the op and its first output.
    pub fn label(&self) -> String {
        if !self.name.is_empty() {
            self.name.clone()
        } else {
            format!("{}({})", self.op, self.outputs.first().map(|s| &**s).unwrap_or(""))
        }
    }

    /// True if the node writes one of its own inputs.
    pub fn is_in_place(&self) -> bool {
        self.outputs.iter().any(|o| self.inputs.contains(o))
    }

    pub fn has_arg(&self, name: &str) -> bool {
        self.args.contains_key(name)
    }
}

impl OperatorNode {
    fn missing(&self, name: &str, kind: &str) -> anyhow::Error {
        anyhow::anyhow!("Node {} expected {} argument '{}'", self.label(), kind, name)
    }

    fn mistyped(&self, name: &str, kind: &str) -> anyhow::Error {
        anyhow::anyhow!(
            "Node {} argument '{}' should be {}, found {}",
            self.label(),
            name,
            kind,
            self.args[name]
        )
    }

    pub fn get_arg_opt_int(&self, name: &str) -> DreamResult<Option<i64>> {
        match self.args.get(name) {
            None => Ok(None),
            Some(ArgValue::Int(i)) => Ok(Some(*i)),
            Some(_) => Err(self.mistyped(name, "an int")),
        }
    }

    pub fn get_arg_int(&self, name: &str) -> DreamResult<i64> {
        self.get_arg_opt_int(name)?.ok_or_else(|| self.missing(name, "int"))
    }

    /// Floats accept integer values, as serialized graphs are not always
    /// careful about the distinction.
    pub fn get_arg_opt_float(&self, name: &str) -> DreamResult<Option<f32>> {
        match self.args.get(name) {
            None => Ok(None),
            Some(ArgValue::Float(x)) => Ok(Some(*x)),
            Some(ArgValue::Int(i)) => Ok(Some(*i as f32)),
            Some(_) => Err(self.mistyped(name, "a float")),
        }
    }

    pub fn get_arg_float(&self, name: &str) -> DreamResult<f32> {
        self.get_arg_opt_float(name)?.ok_or_else(|| self.missing(name, "float"))
    }

    pub fn get_arg_opt_str(&self, name: &str) -> DreamResult<Option<&str>> {
        match self.args.get(name) {
            None => Ok(None),
            Some(ArgValue::Str(s)) => Ok(Some(s)),
            Some(_) => Err(self.mistyped(name, "a string")),
        }
    }

    pub fn get_arg_str(&self, name: &str) -> DreamResult<&str> {
        self.get_arg_opt_str(name)?.ok_or_else(|| self.missing(name, "string"))
    }

    pub fn get_arg_opt_ints(&self, name: &str) -> DreamResult<Option<&[i64]>> {
        match self.args.get(name) {
            None => Ok(None),
            Some(ArgValue::Ints(v)) => Ok(Some(v)),
            Some(_) => Err(self.mistyped(name, "a list of ints")),
        }
    }

    pub fn get_arg_ints(&self, name: &str) -> DreamResult<&[i64]> {
        self.get_arg_opt_ints(name)?.ok_or_else(|| self.missing(name, "ints"))
    }

    pub fn get_arg_opt_floats(&self, name: &str) -> DreamResult<Option<&[f32]>> {
        match self.args.get(name) {
            None => Ok(None),
            Some(ArgValue::Floats(v)) => Ok(Some(v)),
            Some(_) => Err(self.mistyped(name, "a list of floats")),
        }
    }

    pub fn get_arg_floats(&self, name: &str) -> DreamResult<&[f32]> {
        self.get_arg_opt_floats(name)?.ok_or_else(|| self.missing(name, "floats"))
    }

    /// Read a list of non-negative ints as dimensions.
    pub fn get_arg_opt_dims(&self, name: &str) -> DreamResult<Option<Vec<usize>>> {
        let Some(ints) = self.get_arg_opt_ints(name)? else { return Ok(None) };
        let dims = ints
            .iter()
            .map(|&i| {
                usize::try_from(i).map_err(|_| {
                    anyhow::anyhow!("Node {} argument '{}': negative dim {}", self.label(), name, i)
                })
            })
            .collect::<DreamResult<Vec<usize>>>()?;
        Ok(Some(dims))
    }
}

impl fmt::Display for OperatorNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}] -> [{}]",
            self.op,
            self.inputs.iter().join(", "),
            self.outputs.iter().join(", ")
        )?;
        if !self.args.is_empty() {
            let args = self.args.iter().map(|(k, v)| format!("{}: {}", k, v)).join(", ");
            write!(f, " {{{}}}", args)?;
        }
        if !self.device.is_host() {
            write!(f, " @{}", self.device)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_args() {
        let node = OperatorNode::new(OpKind::Conv)
            .input("data")
            .input("conv1_w")
            .output("conv1")
            .arg("kernel", 11i64)
            .arg("pads", vec![1i64, 2, 1, 2])
            .arg("scale", 0.5f32);
        assert_eq!(node.get_arg_int("kernel").unwrap(), 11);
        assert_eq!(node.get_arg_float("kernel").unwrap(), 11.0);
        assert_eq!(node.get_arg_ints("pads").unwrap(), &[1, 2, 1, 2]);
        assert!(node.get_arg_int("scale").is_err());
        assert!(node.get_arg_int("stride").is_err());
        assert_eq!(node.get_arg_opt_int("stride").unwrap(), None);
        assert_eq!(node.label(), "Conv(conv1)");
        assert!(!node.is_in_place());
    }

    #[test]
    fn negative_dims_are_rejected() {
        let node = OperatorNode::new(OpKind::ConstantFill).arg("shape", vec![1i64, -1]);
        assert!(node.get_arg_opt_dims("shape").is_err());
    }

    #[test]
    fn display() {
        let node = OperatorNode::new(OpKind::Relu)
            .input("conv1")
            .output("conv1")
            .device(Device::accelerator(0));
        assert!(node.is_in_place());
        assert_eq!(node.to_string(), "Relu [conv1] -> [conv1] @cuda:0");
    }
}
