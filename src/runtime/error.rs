use anyhow::Error as AnyError;
use std::fmt;

/// Phases of a catch-up cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    Begin,
    Plan,
    Fetch,
    Publish,
    Execute,
    Cancel,
    PeriodicUpdate,
    Watermark,
    Commit,
}

/// Failure of one cycle, tagged with the phase that failed. The cycle's
/// transaction has been rolled back by the time this is observed.
#[derive(Debug)]
pub struct CycleError {
    stage: CycleStage,
    source: AnyError,
}

impl CycleError {
    pub fn new(stage: CycleStage, source: AnyError) -> Self {
        Self { stage, source }
    }

    pub fn stage(&self) -> CycleStage {
        self.stage
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} stage failed: {}", self.stage, self.source)
    }
}

impl std::error::Error for CycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Rejected read-side request parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputError {
    message: String,
}

impl InputError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid input: {}", self.message)
    }
}

impl std::error::Error for InputError {}
