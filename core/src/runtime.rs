use std::borrow::Cow;
use std::fmt::Debug;
use std::sync::Arc;

use crate::errors::DreamResult;
use crate::model::Device;
use crate::ops::Kernel;
use dream_data::internal::*;

/// Report interval multiplier and default run count scale when the nets
/// run on an accelerator.
pub const ACCELERATOR_MULTIPLIER: usize = 10;

/// Something able to evaluate kernels for nodes placed on one device.
pub trait Runtime: Debug + Send + Sync {
    fn name(&self) -> Cow<'_, str>;

    fn device(&self) -> Device;

    fn eval(&self, kernel: &dyn Kernel, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>>;
}

/// Evaluates kernels on the host processor.
#[derive(Debug, Default)]
pub struct HostRuntime;

impl Runtime for HostRuntime {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("host")
    }

    fn device(&self) -> Device {
        Device::host()
    }

    fn eval(&self, kernel: &dyn Kernel, inputs: &[&Tensor]) -> DreamResult<TVec<Tensor>> {
        kernel.eval(inputs)
    }
}

/// The runtimes available to a dream job: always the host, optionally one
/// accelerator.
#[derive(Clone, Debug)]
pub struct Runtimes {
    pub host: Arc<dyn Runtime>,
    pub accelerator: Option<Arc<dyn Runtime>>,
}

impl Runtimes {
    pub fn host() -> Runtimes {
        Runtimes { host: Arc::new(HostRuntime), accelerator: None }
    }

    pub fn with_accelerator(mut self, accelerator: Arc<dyn Runtime>) -> Runtimes {
        self.accelerator = Some(accelerator);
        self
    }

    /// Runtime for nodes tagged with `device`.
    pub fn for_device(&self, device: &Device) -> DreamResult<Arc<dyn Runtime>> {
        if device.is_host() {
            return Ok(self.host.clone());
        }
        match &self.accelerator {
            Some(rt) if rt.device() == *device => Ok(rt.clone()),
            Some(rt) => {
                bail!("Node placed on {} but the accelerator runtime is {}", device, rt.device())
            }
            None => bail!("Node placed on {} but no accelerator runtime is available", device),
        }
    }
}

impl Default for Runtimes {
    fn default() -> Runtimes {
        Runtimes::host()
    }
}

/// Device choice of a job, fixed before its engine is instantiated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceSelection {
    pub accelerator: bool,
    pub multiplier: usize,
}

impl DeviceSelection {
    /// Use the accelerator when there is one, unless `force_cpu`.
    pub fn resolve(force_cpu: bool, runtimes: &Runtimes) -> DeviceSelection {
        if !force_cpu && runtimes.accelerator.is_some() {
            DeviceSelection { accelerator: true, multiplier: ACCELERATOR_MULTIPLIER }
        } else {
            DeviceSelection { accelerator: false, multiplier: 1 }
        }
    }

    pub fn report_every(&self, interval: usize) -> usize {
        interval * self.multiplier
    }
}
