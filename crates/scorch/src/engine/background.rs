use scorch_core::Stage;
use std::collections::HashMap;
use std::fmt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Identifies background work launched by an acquisition stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackgroundKey {
    pub experiment: String,
    pub stage: Stage,
    pub name: String,
}

impl BackgroundKey {
    pub fn new(experiment: impl Into<String>, stage: Stage, name: impl Into<String>) -> Self {
        Self {
            experiment: experiment.into(),
            stage,
            name: name.into(),
        }
    }
}

impl fmt::Display for BackgroundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.experiment, self.stage, self.name)
    }
}

/// Cancellation capability for one background component.
#[derive(Debug)]
pub struct BackgroundHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl BackgroundHandle {
    pub fn new(token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            token,
            task: Some(task),
        }
    }

    /// Signal the task to stop. Repeated calls do nothing more.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and wait for the task to report its final status.
    pub async fn cancel_and_wait(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Background component task did not finish cleanly");
            }
        }
    }
}

/// Open background handles for one run. Each entry is taken at most once.
#[derive(Debug, Default)]
pub struct BackgroundRegistry {
    handles: HashMap<BackgroundKey, BackgroundHandle>,
}

impl BackgroundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a handle, returning whatever it replaced.
    pub fn insert(&mut self, key: BackgroundKey, handle: BackgroundHandle) -> Option<BackgroundHandle> {
        self.handles.insert(key, handle)
    }

    /// Remove the handle for `key`. Only the first call finds it.
    pub fn take(&mut self, key: &BackgroundKey) -> Option<BackgroundHandle> {
        self.handles.remove(key)
    }

    pub fn contains(&self, key: &BackgroundKey) -> bool {
        self.handles.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn drain(&mut self) -> Vec<(BackgroundKey, BackgroundHandle)> {
        self.handles.drain().collect()
    }
}
