//! Caffe2 protobuf messages, and their conversion to and from `GraphDef`.
//!
//! Only the subset of `caffe2.proto` needed to read and write `NetDef`
//! files is declared here.

pub mod caffe2 {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct DeviceOption {
        #[prost(int32, optional, tag = "1")]
        pub device_type: Option<i32>,
        #[prost(int32, optional, tag = "2")]
        pub device_id: Option<i32>,
        #[prost(uint32, optional, tag = "3")]
        pub random_seed: Option<u32>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Argument {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(float, optional, tag = "2")]
        pub f: Option<f32>,
        #[prost(int64, optional, tag = "3")]
        pub i: Option<i64>,
        #[prost(bytes = "vec", optional, tag = "4")]
        pub s: Option<Vec<u8>>,
        #[prost(float, repeated, packed = "false", tag = "5")]
        pub floats: Vec<f32>,
        #[prost(int64, repeated, packed = "false", tag = "6")]
        pub ints: Vec<i64>,
        #[prost(bytes = "vec", repeated, tag = "7")]
        pub strings: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct OperatorDef {
        #[prost(string, repeated, tag = "1")]
        pub input: Vec<String>,
        #[prost(string, repeated, tag = "2")]
        pub output: Vec<String>,
        #[prost(string, optional, tag = "3")]
        pub name: Option<String>,
        #[prost(string, optional, tag = "4")]
        pub r#type: Option<String>,
        #[prost(message, repeated, tag = "5")]
        pub arg: Vec<Argument>,
        #[prost(message, optional, tag = "6")]
        pub device_option: Option<DeviceOption>,
        #[prost(string, optional, tag = "7")]
        pub engine: Option<String>,
        #[prost(string, repeated, tag = "8")]
        pub control_input: Vec<String>,
        #[prost(bool, optional, tag = "9")]
        pub is_gradient_op: Option<bool>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct NetDef {
        #[prost(string, optional, tag = "1")]
        pub name: Option<String>,
        #[prost(message, repeated, tag = "2")]
        pub op: Vec<OperatorDef>,
        #[prost(string, optional, tag = "3")]
        pub r#type: Option<String>,
        #[prost(message, optional, tag = "5")]
        pub device_option: Option<DeviceOption>,
        #[prost(message, repeated, tag = "6")]
        pub arg: Vec<Argument>,
        #[prost(string, repeated, tag = "7")]
        pub external_input: Vec<String>,
        #[prost(string, repeated, tag = "8")]
        pub external_output: Vec<String>,
    }
}

use self::caffe2::{Argument, DeviceOption, NetDef, OperatorDef};
use crate::errors::DreamResult;
use crate::model::{ArgValue, Device, DeviceType, GraphDef, OperatorNode};
use crate::ops::OpKind;
use anyhow::Context;

fn utf8(bytes: &[u8]) -> DreamResult<String> {
    Ok(std::str::from_utf8(bytes).context("Non utf-8 string argument")?.to_string())
}

impl Argument {
    /// Decode the value, in the field order caffe2 checks them.
    pub fn value(&self) -> DreamResult<ArgValue> {
        Ok(if let Some(f) = self.f {
            ArgValue::Float(f)
        } else if let Some(i) = self.i {
            ArgValue::Int(i)
        } else if let Some(s) = &self.s {
            ArgValue::Str(utf8(s)?)
        } else if !self.floats.is_empty() {
            ArgValue::Floats(self.floats.clone())
        } else if !self.strings.is_empty() {
            ArgValue::Strs(self.strings.iter().map(|s| utf8(s)).collect::<DreamResult<_>>()?)
        } else {
            // an empty list is indistinguishable between types, ints is the
            // most common case (empty shapes)
            ArgValue::Ints(self.ints.clone())
        })
    }

    pub fn from_value(name: &str, value: &ArgValue) -> Argument {
        let mut arg = Argument { name: Some(name.to_string()), ..Argument::default() };
        match value {
            ArgValue::Int(i) => arg.i = Some(*i),
            ArgValue::Float(f) => arg.f = Some(*f),
            ArgValue::Str(s) => arg.s = Some(s.as_bytes().to_vec()),
            ArgValue::Ints(v) => arg.ints = v.clone(),
            ArgValue::Floats(v) => arg.floats = v.clone(),
            ArgValue::Strs(v) => arg.strings = v.iter().map(|s| s.as_bytes().to_vec()).collect(),
        }
        arg
    }
}

impl DeviceOption {
    pub fn device(&self) -> DreamResult<Device> {
        let code = self.device_type.unwrap_or(0);
        let kind = DeviceType::from_proto_code(code)
            .with_context(|| format!("Unsupported device type {}", code))?;
        Ok(Device { kind, id: self.device_id.unwrap_or(0) })
    }
}

impl From<Device> for DeviceOption {
    fn from(device: Device) -> DeviceOption {
        DeviceOption {
            device_type: Some(device.kind.proto_code()),
            device_id: Some(device.id),
            random_seed: None,
        }
    }
}

impl OperatorDef {
    pub fn to_node(&self, net_device: Option<Device>) -> DreamResult<OperatorNode> {
        let op = OpKind::from_name(self.r#type.as_deref().unwrap_or(""));
        let mut node = OperatorNode::new(op).name(self.name.clone().unwrap_or_default());
        node.inputs = self.input.clone();
        node.outputs = self.output.clone();
        for arg in &self.arg {
            let name = arg.name.as_deref().context("Unnamed argument")?;
            let value = arg.value().with_context(|| format!("Decoding argument {}", name))?;
            node.args.insert(name.to_string(), value);
        }
        node.device = match &self.device_option {
            Some(option) => option.device()?,
            None => net_device.unwrap_or_default(),
        };
        Ok(node)
    }
}

impl From<&OperatorNode> for OperatorDef {
    fn from(node: &OperatorNode) -> OperatorDef {
        OperatorDef {
            input: node.inputs.clone(),
            output: node.outputs.clone(),
            name: Some(node.name.clone()).filter(|n| !n.is_empty()),
            r#type: Some(node.op.to_string()),
            arg: node.args.iter().map(|(k, v)| Argument::from_value(k, v)).collect(),
            device_option: Some(node.device).filter(|d| !d.is_host()).map(Into::into),
            ..OperatorDef::default()
        }
    }
}

impl NetDef {
    pub fn to_graph(&self) -> DreamResult<GraphDef> {
        let net_device = self.device_option.as_ref().map(|d| d.device()).transpose()?;
        let mut graph = GraphDef::named(self.name.clone().unwrap_or_default());
        for (ix, op) in self.op.iter().enumerate() {
            let node = op
                .to_node(net_device)
                .with_context(|| format!("Decoding operator #{} {:?}", ix, op.name))?;
            graph.nodes.push(node);
        }
        graph.external_inputs = self.external_input.clone();
        graph.external_outputs = self.external_output.clone();
        Ok(graph)
    }
}

impl From<&GraphDef> for NetDef {
    fn from(graph: &GraphDef) -> NetDef {
        NetDef {
            name: Some(graph.name.clone()),
            op: graph.nodes.iter().map(Into::into).collect(),
            external_input: graph.external_inputs.clone(),
            external_output: graph.external_outputs.clone(),
            ..NetDef::default()
        }
    }
}

impl GraphDef {
    pub fn to_pb(&self) -> NetDef {
        self.into()
    }

    pub fn write_to_bytes(&self) -> Vec<u8> {
        use prost::Message;
        self.to_pb().encode_to_vec()
    }

    pub fn save_to<P: AsRef<std::path::Path>>(&self, p: P) -> DreamResult<()> {
        let path = p.as_ref();
        std::fs::write(path, self.write_to_bytes())
            .with_context(|| format!("Writing {:?}", path))?;
        Ok(())
    }
}
