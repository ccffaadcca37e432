use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use scorch_core::{ComponentStatus, ComponentUpdate, Experiment, Loop, RunProgress, Stage};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::background::{BackgroundHandle, BackgroundKey, BackgroundRegistry};
use crate::actor::pipeline::Slot;
use crate::actor::{ComponentHandle, PipelineHandle};
use crate::component::{invoke, ComponentRegistry};
use crate::context::{Environment, ExecutionContext, Reporter};
use crate::error::{MultiError, Result, ScorchError};
use crate::pipeline::NodeStatus;

/// Drives one run of an experiment through its loop tree.
///
/// ```text
/// configure --failure--> cleanup
/// configure --> start --failure--> stop --> cleanup
/// configure --> start --> [nested loop x count] --> stop --> cleanup
/// ```
///
/// The executor is the sole owner of the run's background registry.
pub struct RunExecutor {
    env: Environment,
    registry: ComponentRegistry,
    components: ComponentHandle,
    pipelines: PipelineHandle,
    experiment: Arc<Experiment>,
    run: usize,
    token: CancellationToken,
    background: BackgroundRegistry,
    started_at: DateTime<Utc>,
}

impl RunExecutor {
    pub fn new(
        env: Environment,
        registry: ComponentRegistry,
        components: ComponentHandle,
        pipelines: PipelineHandle,
        experiment: Arc<Experiment>,
        run: usize,
        token: CancellationToken,
    ) -> Self {
        Self {
            env,
            registry,
            components,
            pipelines,
            experiment,
            run,
            token,
            background: BackgroundRegistry::new(),
            started_at: Utc::now(),
        }
    }

    pub async fn execute(mut self) -> Result<()> {
        let spec = self.experiment.scorch.run(self.run)?.clone();
        info!(experiment = %self.experiment.name, run = self.run, "Executing run");

        let result = self.execute_loop(&spec, 0, 1).await;

        // background work nothing reconciled dies with the run
        for (key, handle) in self.background.drain() {
            debug!(%key, "Cancelling unreconciled background component");
            handle.cancel_and_wait().await;
        }

        if let Err(e) = self.env.store.set_running(&self.experiment.name, None).await {
            warn!(experiment = %self.experiment.name, error = %e, "Failed to clear run progress");
        }
        result
    }

    fn slot(&self, depth: usize) -> Slot {
        Slot::new(self.experiment.name.clone(), self.run, depth)
    }

    fn execute_loop<'a>(&'a mut self, spec: &'a Loop, depth: usize, count: usize) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut errors = MultiError::new();

            if let Err(e) = self.run_stage(spec, Stage::Configure, depth, count).await {
                // nothing was started, so only clean up
                errors.push(e);
                errors.record(self.run_stage(spec, Stage::Cleanup, depth, count).await);
                self.finish(depth, false).await;
                return errors.into_result();
            }

            if let Err(e) = self.run_stage(spec, Stage::Start, depth, count).await {
                errors.push(e);
                errors.record(self.run_stage(spec, Stage::Stop, depth, count).await);
                errors.record(self.run_stage(spec, Stage::Cleanup, depth, count).await);
                self.finish(depth, false).await;
                return errors.into_result();
            }

            if let Some(nested) = spec.nested.as_deref() {
                errors.record(self.execute_nested(nested, depth + 1).await);
            }

            errors.record(self.run_stage(spec, Stage::Stop, depth, count).await);
            errors.record(self.run_stage(spec, Stage::Cleanup, depth, count).await);

            let success = errors.is_empty();
            self.finish(depth, success).await;
            errors.into_result()
        })
    }

    /// Run every iteration of a nested loop. The first failing iteration
    /// ends the level.
    async fn execute_nested(&mut self, nested: &Loop, depth: usize) -> Result<()> {
        let parent = self.slot(depth - 1);
        self.loop_status(&parent, NodeStatus::Running).await;

        let mut result = Ok(());
        for count in 1..=nested.iterations() {
            if self.token.is_cancelled() {
                result = Err(ScorchError::Cancelled);
                break;
            }

            debug!(experiment = %self.experiment.name, run = self.run, depth, count, "Starting loop iteration");
            if let Err(e) = self.pipelines.reset(self.slot(depth), count).await {
                warn!(depth, count, error = %e, "Failed to reset loop pipeline");
            }

            if let Err(e) = self.execute_loop(nested, depth, count).await {
                warn!(experiment = %self.experiment.name, depth, count, error = %e, "Loop iteration failed");
                result = Err(e);
                break;
            }
        }

        let status = if result.is_ok() {
            NodeStatus::Success
        } else {
            NodeStatus::Failure
        };
        self.loop_status(&parent, status).await;
        result
    }

    async fn run_stage(&mut self, spec: &Loop, stage: Stage, depth: usize, count: usize) -> Result<()> {
        self.progress(depth, count, stage).await;

        let result = if stage.is_teardown() {
            // best effort: every component is attempted
            let mut errors = MultiError::new();
            for name in spec.stage(stage) {
                errors.record(self.run_component(name, stage, depth, count).await);
            }
            errors.into_result()
        } else if self.token.is_cancelled() {
            Err(ScorchError::Cancelled)
        } else {
            let mut result = Ok(());
            for name in spec.stage(stage) {
                if let Err(e) = self.run_component(name, stage, depth, count).await {
                    result = Err(e);
                    break;
                }
            }
            result
        };

        if let Err(e) = self
            .pipelines
            .complete_stage(self.slot(depth), stage, result.is_ok())
            .await
        {
            warn!(%stage, depth, error = %e, "Failed to complete pipeline stage");
        }
        result
    }

    async fn run_component(&mut self, name: &str, stage: Stage, depth: usize, count: usize) -> Result<()> {
        let spec = self
            .experiment
            .scorch
            .component(name)
            .cloned()
            .ok_or_else(|| ScorchError::invalid_metadata(name, "component is not declared"))?;
        let component_type = spec.component_type().to_string();

        let reporter = Reporter::new(
            self.components.clone(),
            ComponentUpdate {
                experiment: self.experiment.name.clone(),
                name: name.to_string(),
                component_type: component_type.clone(),
                run: self.run,
                loop_index: depth,
                count,
                stage,
                status: ComponentStatus::Start,
                output: None,
            },
        );

        if let Some(acquired) = stage.counterpart() {
            let key = BackgroundKey::new(self.experiment.name.clone(), acquired, name);
            if let Some(handle) = self.background.take(&key) {
                info!(%key, "Reconciling background component");
                handle.cancel_and_wait().await;
            }
        }

        reporter.status(ComponentStatus::Start).await?;

        let ctx = ExecutionContext {
            experiment: self.experiment.clone(),
            stage,
            component_type: component_type.clone(),
            name: name.to_string(),
            metadata: spec.metadata.clone(),
            run: self.run,
            loop_index: depth,
            count,
            background: spec.background,
            reporter: reporter.clone(),
        };

        let mut component = self.registry.resolve(&component_type, &self.env);
        if let Err(e) = component.init(ctx).await {
            let error = as_component_failure(name, stage, e);
            reporter
                .finish(ComponentStatus::Failure, Some(error.to_string()))
                .await?;
            return Err(error);
        }

        if spec.background && !stage.is_teardown() {
            let key = BackgroundKey::new(self.experiment.name.clone(), stage, name);
            let token = self.token.child_token();
            let task_token = token.clone();
            let task_reporter = reporter.clone();
            let task_key = key.clone();

            // reported before launch so the task's final status lands last
            reporter.status(ComponentStatus::Background).await?;

            let task = tokio::spawn(async move {
                let result = invoke(component.as_ref(), stage, task_token).await;
                let (status, message) = match result {
                    Ok(()) | Err(ScorchError::Cancelled) => (ComponentStatus::Success, None),
                    Err(e) => {
                        warn!(key = %task_key, error = %e, "Background component failed");
                        (ComponentStatus::Failure, Some(e.to_string()))
                    }
                };
                if let Err(e) = task_reporter.finish(status, message).await {
                    warn!(key = %task_key, error = %e, "Failed to report background status");
                }
            });

            info!(%key, "Launched background component");
            if let Some(replaced) = self.background.insert(key, BackgroundHandle::new(token, task)) {
                replaced.cancel();
            }
            return Ok(());
        }

        match invoke(component.as_ref(), stage, self.token.child_token()).await {
            Ok(()) => {
                reporter.status(ComponentStatus::Success).await?;
                Ok(())
            }
            Err(e) => {
                let error = as_component_failure(name, stage, e);
                warn!(experiment = %self.experiment.name, component = name, %stage, error = %error, "Component failed");
                reporter
                    .finish(ComponentStatus::Failure, Some(error.to_string()))
                    .await?;
                Err(error)
            }
        }
    }

    async fn progress(&self, depth: usize, count: usize, stage: Stage) {
        let progress = RunProgress {
            run: self.run,
            loop_index: depth,
            count,
            stage: Some(stage),
            started_at: self.started_at,
        };
        if let Err(e) = self
            .env
            .store
            .set_running(&self.experiment.name, Some(progress))
            .await
        {
            warn!(experiment = %self.experiment.name, error = %e, "Failed to record run progress");
        }
    }

    async fn loop_status(&self, slot: &Slot, status: NodeStatus) {
        if let Err(e) = self.pipelines.loop_status(slot.clone(), status).await {
            warn!(depth = slot.loop_index, error = %e, "Failed to update loop status");
        }
    }

    async fn finish(&self, depth: usize, success: bool) {
        if let Err(e) = self.pipelines.finish(self.slot(depth), success).await {
            warn!(depth, error = %e, "Failed to finish pipeline");
        }
    }
}

/// Tag a bare error with the component and stage it came from.
fn as_component_failure(name: &str, stage: Stage, error: ScorchError) -> ScorchError {
    match error {
        ScorchError::ComponentFailed { .. }
        | ScorchError::InvalidMetadata { .. }
        | ScorchError::Cancelled
        | ScorchError::Aggregate(_) => error,
        other => ScorchError::component_failed(name, stage, other),
    }
}
