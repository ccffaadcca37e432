use bytes::{Bytes, BytesMut};
use events::{Event, EventBus};
use scorch_core::{ComponentKey, ComponentStatus, ComponentUpdate};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use utoipa::ToSchema;

use super::pipeline::PipelineHandle;
use super::viewer::{OutputFrame, ViewerHandle, ViewerId};
use super::Mailbox;
use crate::error::Result;

#[derive(Debug, Default)]
struct ComponentState {
    component_type: String,
    running: bool,
    finished: bool,
    status: Option<ComponentStatus>,
    output: BytesMut,
}

/// Snapshot of a component's buffered output.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ComponentOutput {
    #[serde(rename = "type")]
    pub component_type: String,
    pub running: bool,
    pub status: Option<ComponentStatus>,
    #[serde(serialize_with = "serialize_lossy")]
    #[schema(value_type = String)]
    #[cfg_attr(feature = "typescript", ts(type = "string"))]
    pub output: Bytes,
}

fn serialize_lossy<S: serde::Serializer>(bytes: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

/// A live output feed. Buffered output arrives first, then live chunks, then
/// `OutputFrame::Done` once the component finishes.
#[derive(Debug)]
pub struct OutputSubscription {
    pub key: ComponentKey,
    pub id: ViewerId,
    rx: mpsc::UnboundedReceiver<OutputFrame>,
}

impl OutputSubscription {
    pub async fn recv(&mut self) -> Option<OutputFrame> {
        self.rx.recv().await
    }
}

pub(crate) enum ComponentRequest {
    Update {
        update: ComponentUpdate,
        reply: oneshot::Sender<()>,
    },
    Attach {
        key: ComponentKey,
        reply: oneshot::Sender<Result<OutputSubscription>>,
    },
    Detach {
        key: ComponentKey,
        id: ViewerId,
        reply: oneshot::Sender<Result<bool>>,
    },
    Output {
        key: ComponentKey,
        reply: oneshot::Sender<Option<ComponentOutput>>,
    },
    Forget {
        experiment: String,
        reply: oneshot::Sender<()>,
    },
}

/// Owns per-key running flag, buffered output and declared type.
pub struct ComponentActor {
    states: HashMap<ComponentKey, ComponentState>,
    viewers: ViewerHandle,
    pipelines: PipelineHandle,
    bus: EventBus,
    persist_dir: Option<PathBuf>,
    next_viewer: ViewerId,
}

impl ComponentActor {
    /// `persist_dir` enables writing finished output under
    /// `<dir>/<experiment>/run-<run>/loop-<loop>/<stage>-<name>.log`.
    pub fn spawn(
        viewers: ViewerHandle,
        pipelines: PipelineHandle,
        bus: EventBus,
        persist_dir: Option<PathBuf>,
        timeout: Duration,
    ) -> ComponentHandle {
        let (mailbox, mut rx) = Mailbox::channel("component", timeout);
        let mut actor = ComponentActor {
            states: HashMap::new(),
            viewers,
            pipelines,
            bus,
            persist_dir,
            next_viewer: 0,
        };

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                actor.handle(request).await;
            }
            debug!("Component actor stopped");
        });

        ComponentHandle { mailbox }
    }

    async fn handle(&mut self, request: ComponentRequest) {
        match request {
            ComponentRequest::Update { update, reply } => {
                self.update(update).await;
                let _ = reply.send(());
            }
            ComponentRequest::Attach { key, reply } => {
                let result = self.attach(key).await;
                let _ = reply.send(result);
            }
            ComponentRequest::Detach { key, id, reply } => {
                let result = self.viewers.unregister(key, id).await;
                let _ = reply.send(result);
            }
            ComponentRequest::Output { key, reply } => {
                let output = self.states.get(&key).map(|state| ComponentOutput {
                    component_type: state.component_type.clone(),
                    running: state.running,
                    status: state.status,
                    output: Bytes::copy_from_slice(&state.output),
                });
                let _ = reply.send(output);
            }
            ComponentRequest::Forget { experiment, reply } => {
                self.states.retain(|key, _| key.experiment != experiment);
                if let Err(e) = self.viewers.forget(&experiment).await {
                    warn!(experiment = %experiment, error = %e, "Failed to drop output viewers");
                }
                let _ = reply.send(());
            }
        }
    }

    async fn update(&mut self, update: ComponentUpdate) {
        let key = update.key();
        let state = self.states.entry(key.clone()).or_default();

        // a fresh start of the same key (next loop iteration) resets the buffer
        if update.status == ComponentStatus::Start && state.finished {
            state.output.clear();
            state.finished = false;
        }

        let previous = state.status;
        state.component_type = update.component_type.clone();
        state.status = Some(update.status);

        let mut chunk = None;
        if let Some(output) = &update.output {
            if !output.is_empty() {
                state.output.extend_from_slice(output);
                chunk = Some(output.clone());
            }
        }

        let finished = update.status.is_terminal();
        state.running = !finished;
        state.finished = finished;
        let persisted = if finished {
            Some(Bytes::copy_from_slice(&state.output))
        } else {
            None
        };

        if let Some(chunk) = chunk {
            if let Err(e) = self.viewers.publish(key.clone(), chunk).await {
                warn!(%key, error = %e, "Failed to forward component output");
            }
        }

        if previous != Some(update.status) || update.output.is_none() {
            self.bus.emit(Event::ComponentStatus {
                experiment: update.experiment.clone(),
                run: update.run,
                loop_index: update.loop_index,
                count: update.count,
                stage: update.stage,
                name: update.name.clone(),
                status: update.status,
            });

            let mut status_only = update.clone();
            status_only.output = None;
            if let Err(e) = self.pipelines.apply(status_only).await {
                warn!(%key, error = %e, "Failed to apply update to pipeline");
            }
        }

        if let Some(output) = persisted {
            if let Err(e) = self.viewers.finish(key.clone()).await {
                warn!(%key, error = %e, "Failed to finish output viewers");
            }
            self.persist(&key, output).await;
        }
    }

    async fn attach(&mut self, key: ComponentKey) -> Result<OutputSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_viewer;
        self.next_viewer += 1;

        let finished = match self.states.get(&key) {
            Some(state) => {
                if !state.output.is_empty() {
                    let _ = tx.send(OutputFrame::Chunk(Bytes::copy_from_slice(&state.output)));
                }
                state.finished
            }
            None => false,
        };

        if finished {
            let _ = tx.send(OutputFrame::Done);
        } else {
            // no update can interleave between the replay above and this
            // registration: both happen inside one request
            self.viewers.register(key.clone(), id, tx).await?;
        }

        Ok(OutputSubscription { key, id, rx })
    }

    async fn persist(&self, key: &ComponentKey, output: Bytes) {
        let Some(dir) = &self.persist_dir else {
            return;
        };
        let dir = dir
            .join(&key.experiment)
            .join(format!("run-{}", key.run))
            .join(format!("loop-{}", key.loop_index));
        let path = dir.join(format!("{}-{}.log", key.stage, key.name));

        let result = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, &output).await
        }
        .await;

        match result {
            Ok(()) => debug!(path = %path.display(), "Persisted component output"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to persist component output"),
        }
    }
}

#[derive(Clone)]
pub struct ComponentHandle {
    mailbox: Mailbox<ComponentRequest>,
}

impl ComponentHandle {
    /// Apply an update; returns once the actor has processed it.
    pub async fn update(&self, update: ComponentUpdate) -> Result<()> {
        self.mailbox
            .call(|reply| ComponentRequest::Update { update, reply })
            .await
    }

    pub async fn attach(&self, key: ComponentKey) -> Result<OutputSubscription> {
        self.mailbox
            .call(|reply| ComponentRequest::Attach { key, reply })
            .await?
    }

    pub async fn detach(&self, key: ComponentKey, id: ViewerId) -> Result<bool> {
        self.mailbox
            .call(|reply| ComponentRequest::Detach { key, id, reply })
            .await?
    }

    pub async fn output(&self, key: ComponentKey) -> Result<Option<ComponentOutput>> {
        self.mailbox
            .call(|reply| ComponentRequest::Output { key, reply })
            .await
    }

    pub async fn forget(&self, experiment: &str) -> Result<()> {
        let experiment = experiment.to_string();
        self.mailbox
            .call(|reply| ComponentRequest::Forget { experiment, reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{PipelineActor, ViewerActor};
    use crate::store::MemoryExperimentStore;
    use scorch_core::{ComponentSpec, Experiment, Loop, ScorchMetadata, Stage};
    use std::sync::Arc;

    async fn spawn(persist_dir: Option<PathBuf>) -> ComponentHandle {
        let store = Arc::new(MemoryExperimentStore::new());
        store
            .insert(Experiment::new(
                "exp",
                ScorchMetadata {
                    components: vec![ComponentSpec::new("A")],
                    runs: vec![Loop {
                        start: vec!["A".to_string()],
                        ..Default::default()
                    }],
                },
            ))
            .await;
        let bus = EventBus::new();
        let timeout = Duration::from_secs(5);
        let viewers = ViewerActor::spawn(timeout);
        let pipelines = PipelineActor::spawn(store, bus.clone(), timeout);
        ComponentActor::spawn(viewers, pipelines, bus, persist_dir, timeout)
    }

    fn update(status: ComponentStatus, output: Option<&'static str>) -> ComponentUpdate {
        ComponentUpdate {
            experiment: "exp".to_string(),
            name: "A".to_string(),
            component_type: "A".to_string(),
            run: 0,
            loop_index: 0,
            count: 1,
            stage: Stage::Start,
            status,
            output: output.map(|s| Bytes::from_static(s.as_bytes())),
        }
    }

    fn key() -> ComponentKey {
        ComponentKey::new("exp", 0, 0, Stage::Start, "A")
    }

    #[tokio::test]
    async fn test_output_is_buffered() {
        let components = spawn(None).await;
        components.update(update(ComponentStatus::Start, None)).await.unwrap();
        components
            .update(update(ComponentStatus::Running, Some("one ")))
            .await
            .unwrap();
        components
            .update(update(ComponentStatus::Running, Some("two")))
            .await
            .unwrap();

        let output = components.output(key()).await.unwrap().unwrap();
        assert!(output.running);
        assert_eq!(output.output, Bytes::from("one two"));
        assert_eq!(output.status, Some(ComponentStatus::Running));

        assert!(components
            .output(ComponentKey::new("exp", 0, 0, Stage::Stop, "A"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_late_viewer_gets_replay_then_live() {
        let components = spawn(None).await;
        components.update(update(ComponentStatus::Start, None)).await.unwrap();
        components
            .update(update(ComponentStatus::Running, Some("a")))
            .await
            .unwrap();
        components
            .update(update(ComponentStatus::Running, Some("b")))
            .await
            .unwrap();

        let mut sub = components.attach(key()).await.unwrap();
        assert_eq!(sub.recv().await, Some(OutputFrame::Chunk(Bytes::from("ab"))));

        components
            .update(update(ComponentStatus::Running, Some("c")))
            .await
            .unwrap();
        components.update(update(ComponentStatus::Success, None)).await.unwrap();
        assert_eq!(sub.recv().await, Some(OutputFrame::Chunk(Bytes::from("c"))));
        assert_eq!(sub.recv().await, Some(OutputFrame::Done));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_viewer_of_finished_component_is_not_registered() {
        let components = spawn(None).await;
        components
            .update(update(ComponentStatus::Start, Some("all")))
            .await
            .unwrap();
        components.update(update(ComponentStatus::Success, None)).await.unwrap();

        let mut sub = components.attach(key()).await.unwrap();
        assert_eq!(sub.recv().await, Some(OutputFrame::Chunk(Bytes::from("all"))));
        assert_eq!(sub.recv().await, Some(OutputFrame::Done));
        assert_eq!(sub.recv().await, None);
        assert!(!components.detach(key(), sub.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_restart_clears_previous_iteration() {
        let components = spawn(None).await;
        components
            .update(update(ComponentStatus::Start, Some("first")))
            .await
            .unwrap();
        components.update(update(ComponentStatus::Success, None)).await.unwrap();
        components.update(update(ComponentStatus::Start, None)).await.unwrap();

        let output = components.output(key()).await.unwrap().unwrap();
        assert!(output.output.is_empty());
        assert!(output.running);
    }

    #[tokio::test]
    async fn test_finished_output_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let components = spawn(Some(dir.path().to_path_buf())).await;
        components
            .update(update(ComponentStatus::Start, Some("logged")))
            .await
            .unwrap();
        components.update(update(ComponentStatus::Failure, None)).await.unwrap();

        let path = dir.path().join("exp/run-0/loop-0/start-A.log");
        assert_eq!(tokio::fs::read_to_string(path).await.unwrap(), "logged");
    }

    #[tokio::test]
    async fn test_forget_drops_state() {
        let components = spawn(None).await;
        components.update(update(ComponentStatus::Start, None)).await.unwrap();
        components.forget("exp").await.unwrap();
        assert!(components.output(key()).await.unwrap().is_none());
    }
}
