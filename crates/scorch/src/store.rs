//! Experiment metadata provider.
//!
//! The engine never owns experiment configuration; it reads the static
//! SCORCH metadata through this seam and writes back the small amount of
//! status it needs (the live run marker and component values such as taps).

use async_trait::async_trait;
use scorch_core::{Experiment, RunProgress};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, ScorchError};

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Experiment>;

    async fn set_status_value(&self, name: &str, key: &str, value: serde_json::Value)
        -> Result<()>;

    async fn remove_status_value(&self, name: &str, key: &str) -> Result<()>;

    /// Mark which run/loop/count is executing, or clear it with `None`.
    async fn set_running(&self, name: &str, progress: Option<RunProgress>) -> Result<()>;

    async fn running(&self, name: &str) -> Result<Option<RunProgress>>;
}

#[derive(Default)]
pub struct MemoryExperimentStore {
    experiments: RwLock<HashMap<String, Experiment>>,
}

impl MemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, experiment: Experiment) {
        self.experiments
            .write()
            .await
            .insert(experiment.name.clone(), experiment);
    }

    async fn update<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Experiment) + Send,
    {
        let mut experiments = self.experiments.write().await;
        let experiment = experiments
            .get_mut(name)
            .ok_or_else(|| ScorchError::ExperimentNotFound(name.to_string()))?;
        f(experiment);
        Ok(())
    }
}

#[async_trait]
impl ExperimentStore for MemoryExperimentStore {
    async fn get(&self, name: &str) -> Result<Experiment> {
        self.experiments
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ScorchError::ExperimentNotFound(name.to_string()))
    }

    async fn set_status_value(
        &self,
        name: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.update(name, |exp| {
            exp.status.values.insert(key.to_string(), value);
        })
        .await
    }

    async fn remove_status_value(&self, name: &str, key: &str) -> Result<()> {
        self.update(name, |exp| {
            exp.status.values.remove(key);
        })
        .await
    }

    async fn set_running(&self, name: &str, progress: Option<RunProgress>) -> Result<()> {
        self.update(name, |exp| exp.status.scorch_run = progress).await
    }

    async fn running(&self, name: &str) -> Result<Option<RunProgress>> {
        Ok(self.get(name).await?.status.scorch_run)
    }
}

/// One JSON document per experiment under `<base_dir>/experiments/`.
pub struct FileExperimentStore {
    dir: PathBuf,
    // serializes read-modify-write cycles
    lock: tokio::sync::Mutex<()>,
}

impl FileExperimentStore {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            dir: base_dir.join("experiments"),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    async fn read(&self, name: &str) -> Result<Experiment> {
        let path = self.path(name);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ScorchError::ExperimentNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut experiment: Experiment = serde_json::from_slice(&content)?;
        if experiment.name.is_empty() {
            experiment.name = name.to_string();
        }
        Ok(experiment)
    }

    pub async fn write(&self, experiment: &Experiment) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(&experiment.name);
        let content = serde_json::to_vec_pretty(experiment)?;
        tokio::fs::write(&path, content).await?;
        debug!(path = %path.display(), "Experiment saved");
        Ok(())
    }

    async fn update<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Experiment) + Send,
    {
        let _guard = self.lock.lock().await;
        let mut experiment = self.read(name).await?;
        f(&mut experiment);
        self.write(&experiment).await
    }
}

#[async_trait]
impl ExperimentStore for FileExperimentStore {
    async fn get(&self, name: &str) -> Result<Experiment> {
        self.read(name).await
    }

    async fn set_status_value(
        &self,
        name: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<()> {
        self.update(name, |exp| {
            exp.status.values.insert(key.to_string(), value);
        })
        .await
    }

    async fn remove_status_value(&self, name: &str, key: &str) -> Result<()> {
        self.update(name, |exp| {
            exp.status.values.remove(key);
        })
        .await
    }

    async fn set_running(&self, name: &str, progress: Option<RunProgress>) -> Result<()> {
        self.update(name, |exp| exp.status.scorch_run = progress).await
    }

    async fn running(&self, name: &str) -> Result<Option<RunProgress>> {
        Ok(self.read(name).await?.status.scorch_run)
    }
}
