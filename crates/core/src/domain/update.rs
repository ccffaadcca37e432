use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::stage::{ComponentStatus, Stage};

/// Identity of one component invocation slot: `experiment|run|loop|stage|name`.
///
/// Iterations of a nested loop share the key; the slot is reset when a new
/// invocation starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentKey {
    pub experiment: String,
    pub run: usize,
    #[serde(rename = "loop")]
    pub loop_index: usize,
    pub stage: Stage,
    pub name: String,
}

impl ComponentKey {
    pub fn new(
        experiment: impl Into<String>,
        run: usize,
        loop_index: usize,
        stage: Stage,
        name: impl Into<String>,
    ) -> Self {
        Self {
            experiment: experiment.into(),
            run,
            loop_index,
            stage,
            name: name.into(),
        }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.experiment, self.run, self.loop_index, self.stage, self.name
        )
    }
}

/// A status event for one component invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentUpdate {
    pub experiment: String,
    pub name: String,
    pub component_type: String,
    pub run: usize,
    pub loop_index: usize,
    pub count: usize,
    pub stage: Stage,
    pub status: ComponentStatus,
    pub output: Option<Bytes>,
}

impl ComponentUpdate {
    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(
            self.experiment.clone(),
            self.run,
            self.loop_index,
            self.stage,
            self.name.clone(),
        )
    }

    pub fn with_output(mut self, output: impl Into<Bytes>) -> Self {
        self.output = Some(output.into());
        self
    }
}
