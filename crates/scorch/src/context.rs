use bytes::Bytes;
use cluster::{ClusterControl, HealthChecker};
use scorch_core::{ComponentKey, ComponentStatus, ComponentUpdate, Experiment, Metadata, Stage};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::actor::ComponentHandle;
use crate::config::ScorchConfig;
use crate::error::{Result, ScorchError};
use crate::store::ExperimentStore;
use crate::terminal::TerminalRegistry;

/// Where breakpoints hand control to a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminalMode {
    /// A pseudo-terminal negotiated over HTTP and streamed to browsers
    #[default]
    Web,
    /// The engine's own stdin/stdout
    Cli,
}

/// Long-lived collaborators shared by every component invocation.
#[derive(Clone)]
pub struct Environment {
    pub config: Arc<ScorchConfig>,
    pub store: Arc<dyn ExperimentStore>,
    pub cluster: Arc<dyn ClusterControl>,
    pub health: Arc<dyn HealthChecker>,
    pub terminals: TerminalRegistry,
    pub terminal_mode: TerminalMode,
}

/// Reports status and output for one component invocation.
#[derive(Clone)]
pub struct Reporter {
    components: ComponentHandle,
    template: ComponentUpdate,
}

impl Reporter {
    pub fn new(components: ComponentHandle, template: ComponentUpdate) -> Self {
        Self {
            components,
            template,
        }
    }

    pub async fn status(&self, status: ComponentStatus) -> Result<()> {
        let mut update = self.template.clone();
        update.status = status;
        update.output = None;
        self.components.update(update).await
    }

    /// Stream a chunk of output; the component is running while it talks.
    pub async fn output(&self, chunk: impl Into<Bytes>) -> Result<()> {
        let mut update = self.template.clone();
        update.status = ComponentStatus::Running;
        update.output = Some(chunk.into());
        self.components.update(update).await
    }

    /// Final status, with an optional closing line appended to the output.
    pub async fn finish(&self, status: ComponentStatus, message: Option<String>) -> Result<()> {
        let mut update = self.template.clone();
        update.status = status;
        update.output = message.map(|m| Bytes::from(format!("{}\n", m)));
        self.components.update(update).await
    }

    pub fn key(&self) -> ComponentKey {
        self.template.key()
    }
}

/// Everything a component needs for one stage invocation. Built fresh for
/// every call and never shared between invocations.
#[derive(Clone)]
pub struct ExecutionContext {
    pub experiment: Arc<Experiment>,
    pub stage: Stage,
    pub component_type: String,
    pub name: String,
    pub metadata: Metadata,
    pub run: usize,
    pub loop_index: usize,
    pub count: usize,
    pub background: bool,
    pub reporter: Reporter,
}

impl ExecutionContext {
    pub fn key(&self) -> ComponentKey {
        ComponentKey::new(
            self.experiment.name.clone(),
            self.run,
            self.loop_index,
            self.stage,
            self.name.clone(),
        )
    }

    /// Decode the component's metadata bag into a typed options struct.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.metadata.clone()))
            .map_err(|e| ScorchError::invalid_metadata(self.name.clone(), e.to_string()))
    }

    pub fn failed(&self, reason: impl std::fmt::Display) -> ScorchError {
        ScorchError::component_failed(self.name.clone(), self.stage, reason)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("experiment", &self.experiment.name)
            .field("stage", &self.stage)
            .field("component_type", &self.component_type)
            .field("name", &self.name)
            .field("run", &self.run)
            .field("loop_index", &self.loop_index)
            .field("count", &self.count)
            .field("background", &self.background)
            .finish()
    }
}
