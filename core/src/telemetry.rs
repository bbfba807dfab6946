//! Read-only progress reports of an optimization run.
use std::fmt;
use std::sync::Arc;

use crate::errors::DreamResult;
use dream_data::internal::*;

/// State of a run after some predict runs.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// Predict runs done by the engine.
    pub step: usize,
    /// Value of the iteration counter blob.
    pub iteration: i64,
    pub learning_rate: f32,
    /// Objective, averaged over the batch.
    pub score: f32,
    pub input: Arc<Tensor>,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "step: {}  rate: {}  score: {}", self.iteration, self.learning_rate, self.score)
    }
}

/// Receives snapshots while the engine runs.
pub trait Reporter {
    fn report(&mut self, snapshot: &Snapshot) -> DreamResult<()>;
}

/// Logs every snapshot at info level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&mut self, snapshot: &Snapshot) -> DreamResult<()> {
        info!("{}", snapshot);
        Ok(())
    }
}

/// Keep every snapshot.
impl Reporter for Vec<Snapshot> {
    fn report(&mut self, snapshot: &Snapshot) -> DreamResult<()> {
        self.push(snapshot.clone());
        Ok(())
    }
}
