use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::domain::stage::Stage;
use crate::error::{CoreError, Result};

/// Opaque key/value bag interpreted by a component variant.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Static declaration of a component, loaded from experiment metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    /// Variant to resolve. Empty means "same as the name".
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub component_type: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub background: bool,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, component_type: impl Into<String>) -> Self {
        self.component_type = component_type.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn component_type(&self) -> &str {
        if self.component_type.is_empty() {
            &self.name
        } else {
            &self.component_type
        }
    }
}

/// One stage group: component names per lifecycle stage plus an optional
/// nested loop. `count` is how many times this loop repeats when it is the
/// nested loop of another; it is ignored on a top-level run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Loop {
    #[serde(default)]
    pub configure: Vec<String>,
    #[serde(default)]
    pub start: Vec<String>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub cleanup: Vec<String>,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub nested: Option<Box<Loop>>,
    #[serde(default)]
    pub count: usize,
}

impl Loop {
    pub fn stage(&self, stage: Stage) -> &[String] {
        match stage {
            Stage::Configure => &self.configure,
            Stage::Start => &self.start,
            Stage::Stop => &self.stop,
            Stage::Cleanup => &self.cleanup,
        }
    }

    /// Number of iterations when nested. A zero count still runs once.
    pub fn iterations(&self) -> usize {
        self.count.max(1)
    }

    /// Walk `depth` levels into the nested loops; depth 0 is `self`.
    pub fn at_depth(&self, depth: usize) -> Option<&Loop> {
        let mut current = self;
        for _ in 0..depth {
            current = current.nested.as_deref()?;
        }
        Some(current)
    }

    /// Number of loop levels including this one.
    pub fn levels(&self) -> usize {
        1 + self.nested.as_ref().map(|n| n.levels()).unwrap_or(0)
    }

    fn names(&self) -> impl Iterator<Item = &String> {
        Stage::ALL.into_iter().flat_map(move |s| self.stage(s).iter())
    }
}

/// The `scorch` application metadata of an experiment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScorchMetadata {
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
    #[serde(default)]
    pub runs: Vec<Loop>,
}

impl ScorchMetadata {
    pub fn component(&self, name: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|c| c.name == name)
    }

    pub fn run(&self, run: usize) -> Result<&Loop> {
        self.runs.get(run).ok_or(CoreError::RunNotFound(run))
    }

    pub fn loop_at(&self, run: usize, depth: usize) -> Result<&Loop> {
        self.run(run)?
            .at_depth(depth)
            .ok_or(CoreError::LoopNotFound { run, depth })
    }

    /// Check that names are unique and every run references declared components.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for component in &self.components {
            if component.name.trim().is_empty() {
                return Err(CoreError::Validation(
                    "component name must not be empty".to_string(),
                ));
            }
            if !seen.insert(component.name.as_str()) {
                return Err(CoreError::DuplicateComponent(component.name.clone()));
            }
        }

        for run in &self.runs {
            let mut level = Some(run);
            while let Some(current) = level {
                if let Some(name) = current.names().find(|n| !seen.contains(n.as_str())) {
                    return Err(CoreError::UndeclaredComponent(name.clone()));
                }
                level = current.nested.as_deref();
            }
        }

        Ok(())
    }
}
