//! Named, typed blob storage shared by the init and predict nets.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::DreamResult;
use dream_data::internal::*;

/// Who may write a blob once the init net has run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlobRole {
    /// Written by the init net only.
    Constant,
    /// Bookkeeping rewritten by `Iter` and `LearningRate`.
    State,
    /// Activations and gradients of the predict net.
    Scratch,
}

#[derive(Clone, Debug)]
struct Blob {
    fact: BlobFact,
    role: BlobRole,
    value: Option<Arc<Tensor>>,
}

/// The optimized tensor. Only the update node of the predict net, the init
/// net or an external caller may rewrite it.
#[derive(Clone, Debug)]
pub struct ParameterCell {
    pub name: String,
    pub fact: BlobFact,
    value: Option<Arc<Tensor>>,
}

impl ParameterCell {
    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_deref()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Workspace {
    blobs: HashMap<String, Blob>,
    parameter: Option<ParameterCell>,
}

impl Workspace {
    /// Declare a blob, or check a redeclaration agrees with the known fact.
    /// A constant may be redeclared as state.
    pub fn declare(&mut self, name: &str, fact: BlobFact, role: BlobRole) -> DreamResult<()> {
        if self.is_parameter(name) {
            let cell = self.parameter.as_ref().map(|p| &p.fact);
            ensure!(cell == Some(&fact), "Parameter {} is {:?}, not {}", name, cell, fact);
            return Ok(());
        }
        match self.blobs.get_mut(name) {
            Some(blob) => {
                ensure!(
                    blob.fact == fact,
                    "Blob {} is {}, redeclared as {}",
                    name,
                    blob.fact,
                    fact
                );
                if blob.role == BlobRole::Constant && role == BlobRole::State {
                    blob.role = BlobRole::State;
                }
            }
            None => {
                trace!("Declare {} {} as {:?}", name, fact, role);
                self.blobs.insert(name.to_string(), Blob { fact, role, value: None });
            }
        }
        Ok(())
    }

    /// Move a declared blob to the parameter cell.
    pub fn bind_parameter(&mut self, name: &str) -> DreamResult<()> {
        ensure!(self.parameter.is_none(), "A parameter is already bound");
        let Some(blob) = self.blobs.remove(name) else {
            bail!("Parameter {} is not initialized by the init net", name)
        };
        self.parameter =
            Some(ParameterCell { name: name.to_string(), fact: blob.fact, value: blob.value });
        Ok(())
    }

    pub fn parameter(&self) -> Option<&ParameterCell> {
        self.parameter.as_ref()
    }

    pub fn is_parameter(&self, name: &str) -> bool {
        self.parameter.as_ref().is_some_and(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.is_parameter(name) || self.blobs.contains_key(name)
    }

    pub fn fact(&self, name: &str) -> Option<&BlobFact> {
        match &self.parameter {
            Some(p) if p.name == name => Some(&p.fact),
            _ => self.blobs.get(name).map(|b| &b.fact),
        }
    }

    /// Role of a blob, `None` for the parameter and unknown blobs.
    pub fn role(&self, name: &str) -> Option<BlobRole> {
        self.blobs.get(name).map(|b| b.role)
    }

    fn slot(&self, name: &str) -> DreamResult<&Option<Arc<Tensor>>> {
        match &self.parameter {
            Some(p) if p.name == name => Ok(&p.value),
            _ => self
                .blobs
                .get(name)
                .map(|b| &b.value)
                .ok_or_else(|| format_err!("Unknown blob {}", name)),
        }
    }

    pub fn get_arc(&self, name: &str) -> DreamResult<Arc<Tensor>> {
        self.slot(name)?.clone().ok_or_else(|| format_err!("Blob {} has no value", name))
    }

    pub fn get(&self, name: &str) -> DreamResult<&Tensor> {
        self.slot(name)?.as_deref().ok_or_else(|| format_err!("Blob {} has no value", name))
    }

    /// Store a value, checking it against the declared fact.
    pub fn set(&mut self, name: &str, value: Tensor) -> DreamResult<()> {
        let fact = self.fact(name).ok_or_else(|| format_err!("Unknown blob {}", name))?;
        ensure!(
            value.datum_type() == fact.datum_type && value.shape() == &*fact.shape,
            "Blob {} is declared {}, got {}",
            name,
            fact,
            value.fact()
        );
        let value = Some(Arc::new(value));
        match &mut self.parameter {
            Some(p) if p.name == name => p.value = value,
            _ => {
                if let Some(blob) = self.blobs.get_mut(name) {
                    blob.value = value;
                }
            }
        }
        Ok(())
    }

    /// Scalar reading of a single value blob, as f32.
    pub fn read_scalar(&self, name: &str) -> DreamResult<f32> {
        let t = self.get(name)?;
        ensure!(t.len() == 1, "Blob {} is not a single value: {}", name, t.fact());
        Ok(match t.datum_type() {
            DatumType::F32 => t.as_slice::<f32>()?[0],
            DatumType::I64 => t.as_slice::<i64>()?[0] as f32,
        })
    }

    pub fn len(&self) -> usize {
        self.blobs.len() + self.parameter.is_some() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(p) = &self.parameter {
            writeln!(f, "{} {} parameter", p.name, p.fact)?;
        }
        let mut names: Vec<&String> = self.blobs.keys().collect();
        names.sort();
        for name in names {
            let blob = &self.blobs[name];
            writeln!(f, "{} {} {:?}", name, blob.fact, blob.role)?;
        }
        Ok(())
    }
}
