//! The engine facade the HTTP and CLI layers call into.

use cluster::{ClusterControl, CommandHealthChecker, HealthChecker, MinimegaCluster};
use events::{Event, EventBus};
use scorch_core::{ComponentKey, RunProgress};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::actor::pipeline::{Scope, Slot};
use crate::actor::viewer::ViewerId;
use crate::actor::{
    ComponentActor, ComponentHandle, ComponentOutput, OutputSubscription, PipelineActor,
    PipelineHandle, ViewerActor,
};
use crate::component::ComponentRegistry;
use crate::config::ScorchConfig;
use crate::context::{Environment, TerminalMode};
use crate::engine::RunExecutor;
use crate::error::{Result, ScorchError};
use crate::store::ExperimentStore;
use crate::terminal::TerminalRegistry;

struct ActiveRun {
    id: u64,
    run: usize,
    token: CancellationToken,
}

struct Inner {
    env: Environment,
    registry: ComponentRegistry,
    bus: EventBus,
    components: ComponentHandle,
    pipelines: PipelineHandle,
    active: Mutex<HashMap<String, ActiveRun>>,
    next_id: AtomicU64,
}

/// Builder for [`Scorch`]. Collaborators left unset fall back to the
/// command-line backed implementations named in the config.
pub struct ScorchBuilder {
    config: ScorchConfig,
    store: Arc<dyn ExperimentStore>,
    bus: Option<EventBus>,
    cluster: Option<Arc<dyn ClusterControl>>,
    health: Option<Arc<dyn HealthChecker>>,
    registry: Option<ComponentRegistry>,
    terminal_mode: TerminalMode,
}

impl ScorchBuilder {
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterControl>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_health(mut self, health: Arc<dyn HealthChecker>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_registry(mut self, registry: ComponentRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_terminal_mode(mut self, mode: TerminalMode) -> Self {
        self.terminal_mode = mode;
        self
    }

    /// Spawn the actors. Must run inside a tokio runtime.
    pub fn build(self) -> Scorch {
        let config = self.config;
        let bus = self.bus.unwrap_or_default();
        let timeout = config.call_timeout();

        let cluster = self.cluster.unwrap_or_else(|| {
            let mut cluster = MinimegaCluster::new(config.minimega_binary.clone());
            if let Some(namespace) = &config.minimega_namespace {
                cluster = cluster.with_namespace(namespace.clone());
            }
            Arc::new(cluster)
        });
        let health = self
            .health
            .unwrap_or_else(|| Arc::new(CommandHealthChecker::new(config.soh_program.clone())));

        let persist_dir = config
            .persist_output
            .then(|| config.base_dir.join("scorch"));

        let pipelines = PipelineActor::spawn(self.store.clone(), bus.clone(), timeout);
        let viewers = ViewerActor::spawn(timeout);
        let components =
            ComponentActor::spawn(viewers, pipelines.clone(), bus.clone(), persist_dir, timeout);

        let terminals = TerminalRegistry::new(
            bus.clone(),
            config.claim_window(),
            config.terminal_history_limit,
        );

        let env = Environment {
            config: Arc::new(config),
            store: self.store,
            cluster,
            health,
            terminals,
            terminal_mode: self.terminal_mode,
        };

        info!(cluster = env.cluster.name(), mode = ?env.terminal_mode, "SCORCH engine ready");

        Scorch {
            inner: Arc::new(Inner {
                env,
                registry: self.registry.unwrap_or_else(ComponentRegistry::with_builtins),
                bus,
                components,
                pipelines,
                active: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

/// Starts and cancels runs and serves their pipelines, output and terminals.
#[derive(Clone)]
pub struct Scorch {
    inner: Arc<Inner>,
}

impl Scorch {
    pub fn builder(config: ScorchConfig, store: Arc<dyn ExperimentStore>) -> ScorchBuilder {
        ScorchBuilder {
            config,
            store,
            bus: None,
            cluster: None,
            health: None,
            registry: None,
            terminal_mode: TerminalMode::default(),
        }
    }

    pub fn config(&self) -> &ScorchConfig {
        &self.inner.env.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn store(&self) -> &Arc<dyn ExperimentStore> {
        &self.inner.env.store
    }

    pub fn terminals(&self) -> &TerminalRegistry {
        &self.inner.env.terminals
    }

    /// Start `run` in the background. Rejected while the experiment already
    /// has an active run.
    pub async fn start_run(&self, experiment: &str, run: usize) -> Result<()> {
        self.launch(experiment, run).await.map(|_| ())
    }

    /// Start `run` and wait for it to finish.
    pub async fn execute(&self, experiment: &str, run: usize) -> Result<()> {
        let task = self.launch(experiment, run).await?;
        task.await
            .map_err(|e| ScorchError::TaskFailed(e.to_string()))?
    }

    async fn launch(&self, experiment: &str, run: usize) -> Result<JoinHandle<Result<()>>> {
        let inner = &self.inner;
        let mut active = inner.active.lock().await;
        if let Some(current) = active.get(experiment) {
            return Err(ScorchError::RunInProgress {
                experiment: experiment.to_string(),
                run: current.run,
            });
        }

        let snapshot = inner.env.store.get(experiment).await?;
        snapshot.scorch.validate()?;
        snapshot.scorch.run(run)?;

        // graphs from a previous execution of this run are stale
        inner
            .pipelines
            .delete(Scope::Run(experiment.to_string(), run), false)
            .await?;
        inner
            .env
            .store
            .set_running(experiment, Some(RunProgress::new(run)))
            .await?;

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        active.insert(
            experiment.to_string(),
            ActiveRun {
                id,
                run,
                token: token.clone(),
            },
        );
        drop(active);

        let executor = RunExecutor::new(
            inner.env.clone(),
            inner.registry.clone(),
            inner.components.clone(),
            inner.pipelines.clone(),
            Arc::new(snapshot),
            run,
            token,
        );

        info!(experiment, run, "Run started");
        inner.bus.emit(Event::RunStarted {
            experiment: experiment.to_string(),
            run,
        });

        let inner = self.inner.clone();
        let experiment = experiment.to_string();
        Ok(tokio::spawn(async move {
            // a panicking component must not leave the experiment marked active
            let result = match tokio::spawn(executor.execute()).await {
                Ok(result) => result,
                Err(e) => {
                    if let Err(e) = inner.env.store.set_running(&experiment, None).await {
                        warn!(experiment = %experiment, error = %e, "Failed to clear run progress");
                    }
                    Err(ScorchError::TaskFailed(e.to_string()))
                }
            };

            {
                let mut active = inner.active.lock().await;
                if active.get(&experiment).is_some_and(|a| a.id == id) {
                    active.remove(&experiment);
                }
            }

            match &result {
                Ok(()) => info!(experiment = %experiment, run, "Run finished"),
                Err(e) => error!(experiment = %experiment, run, error = %e, "Run failed"),
            }
            inner.bus.emit(Event::RunFinished {
                experiment,
                run,
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
            });
            result
        }))
    }

    /// Cancel the experiment's active run; returns its run ID.
    pub async fn cancel_run(&self, experiment: &str) -> Result<usize> {
        let active = self.inner.active.lock().await;
        let current = active
            .get(experiment)
            .ok_or_else(|| ScorchError::NoActiveRun(experiment.to_string()))?;
        info!(experiment, run = current.run, "Cancelling run");
        current.token.cancel();
        Ok(current.run)
    }

    pub async fn active_run(&self, experiment: &str) -> Option<usize> {
        self.inner.active.lock().await.get(experiment).map(|a| a.run)
    }

    /// Serialized pipeline graph for one loop of a run, built on first access.
    pub async fn pipeline(&self, experiment: &str, run: usize, loop_index: usize) -> Result<String> {
        self.inner
            .pipelines
            .get(Slot::new(experiment, run, loop_index))
            .await
    }

    pub async fn component_output(&self, key: ComponentKey) -> Result<Option<ComponentOutput>> {
        self.inner.components.output(key).await
    }

    /// Buffered output so far followed by live chunks until the component
    /// finishes.
    pub async fn subscribe_output(&self, key: ComponentKey) -> Result<OutputSubscription> {
        self.inner.components.attach(key).await
    }

    pub async fn detach_output(&self, key: ComponentKey, id: ViewerId) -> Result<bool> {
        self.inner.components.detach(key, id).await
    }

    /// The experiment's configuration changed: drop every cached graph and
    /// rebuild and rebroadcast the ones still described by its metadata.
    pub async fn experiment_updated(&self, experiment: &str) -> Result<usize> {
        self.inner
            .pipelines
            .delete(Scope::Experiment(experiment.to_string()), true)
            .await
    }

    /// The experiment stopped: cancel its run and forget all engine state.
    pub async fn experiment_stopped(&self, experiment: &str) -> Result<()> {
        match self.cancel_run(experiment).await {
            Ok(_) | Err(ScorchError::NoActiveRun(_)) => {}
            Err(e) => return Err(e),
        }

        let removed = self
            .inner
            .pipelines
            .delete(Scope::Experiment(experiment.to_string()), false)
            .await?;
        self.inner.components.forget(experiment).await?;
        if let Err(e) = self.inner.env.store.set_running(experiment, None).await {
            warn!(experiment, error = %e, "Failed to clear run progress");
        }

        info!(experiment, pipelines = removed, "Dropped engine state for stopped experiment");
        Ok(())
    }
}
