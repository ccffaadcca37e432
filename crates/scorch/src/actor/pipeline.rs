use events::{Event, EventBus};
use scorch_core::{ComponentStatus, ComponentUpdate, Stage};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::Mailbox;
use crate::error::Result;
use crate::pipeline::{NodeStatus, Pipeline};
use crate::store::ExperimentStore;

/// Address of one pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Slot {
    pub experiment: String,
    pub run: usize,
    pub loop_index: usize,
}

impl Slot {
    pub fn new(experiment: impl Into<String>, run: usize, loop_index: usize) -> Self {
        Self {
            experiment: experiment.into(),
            run,
            loop_index,
        }
    }
}

/// Which cached graphs a delete request drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Experiment(String),
    Run(String, usize),
    Loop(Slot),
}

pub(crate) enum PipelineRequest {
    Get {
        slot: Slot,
        reply: oneshot::Sender<Result<String>>,
    },
    Apply {
        update: ComponentUpdate,
        reply: oneshot::Sender<Result<bool>>,
    },
    CompleteStage {
        slot: Slot,
        stage: Stage,
        success: bool,
        reply: oneshot::Sender<Result<bool>>,
    },
    LoopStatus {
        slot: Slot,
        status: NodeStatus,
        reply: oneshot::Sender<Result<bool>>,
    },
    Finish {
        slot: Slot,
        success: bool,
        reply: oneshot::Sender<Result<bool>>,
    },
    Reset {
        slot: Slot,
        count: usize,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        scope: Scope,
        rebuild: bool,
        reply: oneshot::Sender<Result<usize>>,
    },
}

type RunGraphs = BTreeMap<usize, BTreeMap<usize, Pipeline>>;

async fn build(store: &dyn ExperimentStore, slot: &Slot) -> Result<Pipeline> {
    let experiment = store.get(&slot.experiment).await?;
    let spec = experiment.scorch.loop_at(slot.run, slot.loop_index)?;
    Ok(Pipeline::build(&slot.experiment, slot.run, slot.loop_index, spec))
}

fn updated_event(pipeline: &Pipeline) -> Option<Event> {
    match pipeline.to_value() {
        Ok(value) => Some(Event::PipelineUpdated {
            experiment: pipeline.experiment.clone(),
            run: pipeline.run,
            loop_index: pipeline.loop_index,
            pipeline: value,
        }),
        Err(e) => {
            warn!(error = %e, "Failed to serialize pipeline");
            None
        }
    }
}

/// Owns the experiment -> run -> loop -> graph map.
pub struct PipelineActor {
    graphs: HashMap<String, RunGraphs>,
    store: Arc<dyn ExperimentStore>,
    bus: EventBus,
}

impl PipelineActor {
    pub fn spawn(store: Arc<dyn ExperimentStore>, bus: EventBus, timeout: Duration) -> PipelineHandle {
        let (mailbox, mut rx) = Mailbox::channel("pipeline", timeout);
        let mut actor = PipelineActor {
            graphs: HashMap::new(),
            store,
            bus,
        };

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                actor.handle(request).await;
            }
            debug!("Pipeline actor stopped");
        });

        PipelineHandle { mailbox }
    }

    async fn handle(&mut self, request: PipelineRequest) {
        match request {
            PipelineRequest::Get { slot, reply } => {
                let result = self.get(&slot).await;
                let _ = reply.send(result);
            }
            PipelineRequest::Apply { update, reply } => {
                let result = self.apply(update).await;
                let _ = reply.send(result);
            }
            PipelineRequest::CompleteStage {
                slot,
                stage,
                success,
                reply,
            } => {
                let result = self
                    .mutate(&slot, |p| p.complete_stage(stage, success))
                    .await;
                let _ = reply.send(result);
            }
            PipelineRequest::LoopStatus {
                slot,
                status,
                reply,
            } => {
                let result = self.mutate(&slot, |p| p.set_loop_status(status)).await;
                let _ = reply.send(result);
            }
            PipelineRequest::Finish {
                slot,
                success,
                reply,
            } => {
                let result = self.mutate(&slot, |p| p.finish(success)).await;
                let _ = reply.send(result);
            }
            PipelineRequest::Reset { slot, count, reply } => {
                let result = self.reset(&slot, count).await;
                let _ = reply.send(result);
            }
            PipelineRequest::Delete {
                scope,
                rebuild,
                reply,
            } => {
                let result = self.delete(scope, rebuild).await;
                let _ = reply.send(result);
            }
        }
    }

    fn insert(&mut self, slot: &Slot, pipeline: Pipeline) {
        self.graphs
            .entry(slot.experiment.clone())
            .or_default()
            .entry(slot.run)
            .or_default()
            .insert(slot.loop_index, pipeline);
    }

    fn broadcast(&self, pipeline: &Pipeline) {
        if let Some(event) = updated_event(pipeline) {
            self.bus.emit(event);
        }
    }

    async fn ensure(&mut self, slot: &Slot) -> Result<&mut Pipeline> {
        let store = Arc::clone(&self.store);
        let loops = self
            .graphs
            .entry(slot.experiment.clone())
            .or_default()
            .entry(slot.run)
            .or_default();

        match loops.entry(slot.loop_index) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let pipeline = build(store.as_ref(), slot).await?;
                debug!(experiment = %slot.experiment, run = slot.run, loop_index = slot.loop_index, "Built pipeline");
                Ok(entry.insert(pipeline))
            }
        }
    }

    async fn mutate<F>(&mut self, slot: &Slot, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Pipeline) -> bool,
    {
        let pipeline = self.ensure(slot).await?;
        let changed = f(pipeline);
        let event = if changed { updated_event(pipeline) } else { None };
        if let Some(event) = event {
            self.bus.emit(event);
        }
        Ok(changed)
    }

    async fn get(&mut self, slot: &Slot) -> Result<String> {
        let pipeline = self.ensure(slot).await?;
        Ok(pipeline.to_json()?)
    }

    async fn apply(&mut self, update: ComponentUpdate) -> Result<bool> {
        let slot = Slot::new(update.experiment.clone(), update.run, update.loop_index);
        let changed = self.mutate(&slot, |p| p.apply(&update)).await?;

        // a breakpoint marks every enclosing loop anchor while it waits
        if update.component_type == "break" {
            for depth in 0..update.loop_index {
                let outer = Slot::new(update.experiment.clone(), update.run, depth);
                let result = match update.status {
                    ComponentStatus::Running => {
                        self.mutate(&outer, |p| p.set_loop_status(NodeStatus::Unstable))
                            .await
                    }
                    ComponentStatus::Success | ComponentStatus::Failure => {
                        self.mutate(&outer, |p| p.clear_unstable_loop()).await
                    }
                    _ => Ok(false),
                };
                if let Err(e) = result {
                    warn!(experiment = %update.experiment, depth, error = %e, "Failed to update enclosing loop");
                }
            }
        }

        Ok(changed)
    }

    async fn reset(&mut self, slot: &Slot, count: usize) -> Result<()> {
        let mut pipeline = build(self.store.as_ref(), slot).await?;
        pipeline.count = count;
        self.broadcast(&pipeline);
        self.insert(slot, pipeline);
        Ok(())
    }

    async fn delete(&mut self, scope: Scope, rebuild: bool) -> Result<usize> {
        let mut removed = Vec::new();
        match scope {
            Scope::Experiment(experiment) => {
                if let Some(runs) = self.graphs.remove(&experiment) {
                    for (run, loops) in runs {
                        for loop_index in loops.into_keys() {
                            removed.push(Slot::new(experiment.clone(), run, loop_index));
                        }
                    }
                }
            }
            Scope::Run(experiment, run) => {
                if let Some(runs) = self.graphs.get_mut(&experiment) {
                    if let Some(loops) = runs.remove(&run) {
                        for loop_index in loops.into_keys() {
                            removed.push(Slot::new(experiment.clone(), run, loop_index));
                        }
                    }
                }
            }
            Scope::Loop(slot) => {
                if let Some(loops) = self
                    .graphs
                    .get_mut(&slot.experiment)
                    .and_then(|runs| runs.get_mut(&slot.run))
                {
                    if loops.remove(&slot.loop_index).is_some() {
                        removed.push(slot);
                    }
                }
            }
        }

        debug!(count = removed.len(), rebuild, "Deleted cached pipelines");

        if rebuild {
            for slot in &removed {
                match build(self.store.as_ref(), slot).await {
                    Ok(pipeline) => {
                        self.broadcast(&pipeline);
                        self.insert(slot, pipeline);
                    }
                    Err(e) => {
                        debug!(experiment = %slot.experiment, run = slot.run, loop_index = slot.loop_index, error = %e, "Pipeline no longer in metadata");
                    }
                }
            }
        }

        Ok(removed.len())
    }
}

#[derive(Clone)]
pub struct PipelineHandle {
    mailbox: Mailbox<PipelineRequest>,
}

impl PipelineHandle {
    /// Serialized graph for a slot, building it from metadata if absent.
    pub async fn get(&self, slot: Slot) -> Result<String> {
        self.mailbox
            .call(|reply| PipelineRequest::Get { slot, reply })
            .await?
    }

    pub async fn apply(&self, update: ComponentUpdate) -> Result<bool> {
        self.mailbox
            .call(|reply| PipelineRequest::Apply { update, reply })
            .await?
    }

    pub async fn complete_stage(&self, slot: Slot, stage: Stage, success: bool) -> Result<bool> {
        self.mailbox
            .call(|reply| PipelineRequest::CompleteStage {
                slot,
                stage,
                success,
                reply,
            })
            .await?
    }

    pub async fn loop_status(&self, slot: Slot, status: NodeStatus) -> Result<bool> {
        self.mailbox
            .call(|reply| PipelineRequest::LoopStatus {
                slot,
                status,
                reply,
            })
            .await?
    }

    pub async fn finish(&self, slot: Slot, success: bool) -> Result<bool> {
        self.mailbox
            .call(|reply| PipelineRequest::Finish {
                slot,
                success,
                reply,
            })
            .await?
    }

    /// Replace a slot's graph with a fresh one for a new loop iteration.
    pub async fn reset(&self, slot: Slot, count: usize) -> Result<()> {
        self.mailbox
            .call(|reply| PipelineRequest::Reset { slot, count, reply })
            .await?
    }

    /// Drop cached graphs; with `rebuild`, rebuild and rebroadcast the ones
    /// still present in metadata. Returns how many were dropped.
    pub async fn delete(&self, scope: Scope, rebuild: bool) -> Result<usize> {
        self.mailbox
            .call(|reply| PipelineRequest::Delete {
                scope,
                rebuild,
                reply,
            })
            .await?
    }
}
