use scorch_core::{CoreError, Stage};
use std::fmt;
use thiserror::Error;

use crate::actor::CallError;

#[derive(Debug, Error)]
pub enum ScorchError {
    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("Run {run} is already active for experiment {experiment}")]
    RunInProgress { experiment: String, run: usize },

    #[error("No active run for experiment: {0}")]
    NoActiveRun(String),

    #[error("Component {name} failed during {stage}: {reason}")]
    ComponentFailed {
        name: String,
        stage: Stage,
        reason: String,
    },

    #[error("Invalid metadata for component {component}: {reason}")]
    InvalidMetadata { component: String, reason: String },

    #[error("Terminal not found: {0}")]
    TerminalNotFound(String),

    #[error("Terminal ownership rejected: {0}")]
    OwnershipRejected(String),

    #[error("Terminal error: {0}")]
    Terminal(String),

    #[error("{actor} actor unavailable: {reason}")]
    ActorUnavailable {
        actor: &'static str,
        reason: CallError,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Run task failed: {0}")]
    TaskFailed(String),

    #[error("{0}")]
    Aggregate(MultiError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] cluster::ClusterError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl ScorchError {
    pub fn component_failed(name: impl Into<String>, stage: Stage, reason: impl fmt::Display) -> Self {
        Self::ComponentFailed {
            name: name.into(),
            stage,
            reason: reason.to_string(),
        }
    }

    pub fn invalid_metadata(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMetadata {
            component: component.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScorchError>;

/// Errors collected across components or loop iterations, in recording order.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<ScorchError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error. Nested aggregates are flattened.
    pub fn push(&mut self, error: ScorchError) {
        match error {
            ScorchError::Aggregate(inner) => self.errors.extend(inner.errors),
            other => self.errors.push(other),
        }
    }

    /// Record the error of a result, if any.
    pub fn record<T>(&mut self, result: Result<T>) {
        if let Err(e) = result {
            self.push(e);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[ScorchError] {
        &self.errors
    }

    /// `Ok(())` when nothing was recorded, otherwise the aggregate.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ScorchError::Aggregate(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
