//! Learning rate decay driven by the iteration counter blob.
use std::fmt;

use crate::errors::DreamResult;
use crate::model::{ArgValue, OperatorNode};
use dream_data::internal::*;

/// Decay policy, named like the caffe2 `LearningRate` operator argument.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LrPolicy {
    Fixed,
    /// `gamma ^ floor(iter / stepsize)`. Piecewise constant, so unlike the
    /// other decays it is not continuous in `iter`.
    Step { stepsize: i64, gamma: f32 },
    /// `gamma ^ iter`
    Exp { gamma: f32 },
    /// `(1 + gamma * iter) ^ -power`
    Inv { gamma: f32, power: f32 },
}

impl Default for LrPolicy {
    fn default() -> LrPolicy {
        LrPolicy::Exp { gamma: 0.999 }
    }
}

impl LrPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            LrPolicy::Fixed => "fixed",
            LrPolicy::Step { .. } => "step",
            LrPolicy::Exp { .. } => "exp",
            LrPolicy::Inv { .. } => "inv",
        }
    }

    fn multiplier(&self, iter: i64) -> f64 {
        let iter = iter.max(0) as f64;
        match *self {
            LrPolicy::Fixed => 1.0,
            LrPolicy::Step { stepsize, gamma } => {
                (gamma as f64).powf((iter / stepsize.max(1) as f64).floor())
            }
            LrPolicy::Exp { gamma } => (gamma as f64).powf(iter),
            LrPolicy::Inv { gamma, power } => (1.0 + gamma as f64 * iter).powf(-power as f64),
        }
    }
}

/// `base_lr` scaled by the policy multiplier of the current iteration.
#[derive(Clone, Copy, Debug, PartialEq, new)]
pub struct LearningRateSchedule {
    pub base_lr: f32,
    pub policy: LrPolicy,
}

impl Default for LearningRateSchedule {
    fn default() -> LearningRateSchedule {
        LearningRateSchedule::new(1e3, LrPolicy::default())
    }
}

impl LearningRateSchedule {
    /// Fail unless every rate of the schedule is finite, positive and no
    /// larger than the previous one.
    pub fn validate(&self) -> DreamResult<()> {
        ensure!(
            self.base_lr.is_finite() && self.base_lr > 0.0,
            "Learning rate should be positive, got {}",
            self.base_lr
        );
        match self.policy {
            LrPolicy::Fixed => (),
            LrPolicy::Step { stepsize, gamma } => {
                ensure!(stepsize > 0, "Step size should be positive, got {}", stepsize);
                ensure!(
                    gamma > 0.0 && gamma <= 1.0,
                    "Decay gamma should be in (0, 1], got {}",
                    gamma
                );
            }
            LrPolicy::Exp { gamma } => {
                ensure!(
                    gamma > 0.0 && gamma <= 1.0,
                    "Decay gamma should be in (0, 1], got {}",
                    gamma
                );
            }
            LrPolicy::Inv { gamma, power } => {
                ensure!(gamma >= 0.0 && power >= 0.0, "Invalid inv decay {} ^ {}", gamma, power)
            }
        }
        Ok(())
    }

    /// Never below `f32::MIN_POSITIVE`: a long decay saturates instead of
    /// reaching zero.
    pub fn rate(&self, iter: i64) -> f32 {
        let rate = self.base_lr as f64 * self.policy.multiplier(iter);
        rate.max(f32::MIN_POSITIVE as f64) as f32
    }

    /// Arguments of a `LearningRate` node computing this schedule.
    pub fn to_args(&self) -> Vec<(&'static str, ArgValue)> {
        let mut args: Vec<(&'static str, ArgValue)> =
            vec![("base_lr", self.base_lr.into()), ("policy", self.policy.name().into())];
        match self.policy {
            LrPolicy::Fixed => (),
            LrPolicy::Step { stepsize, gamma } => {
                args.push(("stepsize", stepsize.into()));
                args.push(("gamma", gamma.into()));
            }
            LrPolicy::Exp { gamma } => args.push(("gamma", gamma.into())),
            LrPolicy::Inv { gamma, power } => {
                args.push(("gamma", gamma.into()));
                args.push(("power", power.into()));
            }
        }
        args
    }

    pub fn from_node(node: &OperatorNode) -> DreamResult<LearningRateSchedule> {
        let base_lr = node.get_arg_float("base_lr")?;
        let gamma = || node.get_arg_float("gamma");
        let policy = match node.get_arg_opt_str("policy")?.unwrap_or("fixed") {
            "fixed" => LrPolicy::Fixed,
            "step" => LrPolicy::Step { stepsize: node.get_arg_int("stepsize")?, gamma: gamma()? },
            "exp" => LrPolicy::Exp { gamma: gamma()? },
            "inv" => LrPolicy::Inv { gamma: gamma()?, power: node.get_arg_float("power")? },
            other => bail!("{}: unknown learning rate policy {:?}", node.label(), other),
        };
        Ok(LearningRateSchedule::new(base_lr, policy))
    }
}

impl fmt::Display for LearningRateSchedule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.policy {
            LrPolicy::Fixed => write!(f, "{}", self.base_lr),
            LrPolicy::Step { stepsize, gamma } => {
                write!(f, "{} * {}^(iter/{})", self.base_lr, gamma, stepsize)
            }
            LrPolicy::Exp { gamma } => write!(f, "{} * {}^iter", self.base_lr, gamma),
            LrPolicy::Inv { gamma, power } => {
                write!(f, "{} * (1 + {} * iter)^-{}", self.base_lr, gamma, power)
            }
        }
    }
}
