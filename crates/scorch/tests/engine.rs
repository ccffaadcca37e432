//! End-to-end runs against an in-memory store and recording components.

use async_trait::async_trait;
use events::Event;
use scorch::{
    Component, ComponentRegistry, ExecutionContext, ExperimentStore, MemoryExperimentStore,
    OutputFrame, Scorch, ScorchConfig, ScorchError,
};
use scorch_core::{ComponentKey, ComponentSpec, Experiment, Loop, ScorchMetadata, Stage};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Default, Deserialize)]
struct RecordOptions {
    #[serde(default)]
    fail: Vec<Stage>,
    #[serde(default)]
    chunks: Vec<String>,
    /// Stages that block until cancelled
    #[serde(default)]
    wait: Vec<Stage>,
    #[serde(default)]
    panic: Vec<Stage>,
}

struct Recorder {
    log: Log,
    ctx: Option<ExecutionContext>,
    options: RecordOptions,
}

impl Recorder {
    async fn record(&self, stage: Stage, token: CancellationToken) -> scorch::Result<()> {
        let ctx = self.ctx.as_ref().unwrap();
        self.log.lock().unwrap().push(format!("{} {}", stage, ctx.name));

        for chunk in &self.options.chunks {
            ctx.reporter.output(chunk.clone()).await?;
        }

        if self.options.panic.contains(&stage) {
            panic!("{} panicked at {}", ctx.name, stage);
        }

        if self.options.wait.contains(&stage) {
            token.cancelled().await;
            self.log.lock().unwrap().push(format!("{} cancelled", ctx.name));
            return Err(ScorchError::Cancelled);
        }

        if self.options.fail.contains(&stage) {
            return Err(ctx.failed("boom"));
        }
        Ok(())
    }
}

#[async_trait]
impl Component for Recorder {
    async fn init(&mut self, ctx: ExecutionContext) -> scorch::Result<()> {
        self.options = ctx.options()?;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn component_type(&self) -> &str {
        "record"
    }

    async fn configure(&self, token: CancellationToken) -> scorch::Result<()> {
        self.record(Stage::Configure, token).await
    }

    async fn start(&self, token: CancellationToken) -> scorch::Result<()> {
        self.record(Stage::Start, token).await
    }

    async fn stop(&self, token: CancellationToken) -> scorch::Result<()> {
        self.record(Stage::Stop, token).await
    }

    async fn cleanup(&self, token: CancellationToken) -> scorch::Result<()> {
        self.record(Stage::Cleanup, token).await
    }
}

fn component(name: &str, options: Value) -> ComponentSpec {
    let metadata = match options {
        Value::Object(map) => map,
        _ => Default::default(),
    };
    ComponentSpec::new(name)
        .with_type("record")
        .with_metadata(metadata)
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

struct Fixture {
    scorch: Scorch,
    log: Log,
}

impl Fixture {
    async fn new(components: Vec<ComponentSpec>, run: Loop) -> Self {
        let store = Arc::new(MemoryExperimentStore::new());
        store
            .insert(Experiment::new(
                "exp",
                ScorchMetadata {
                    components,
                    runs: vec![run],
                },
            ))
            .await;

        let log: Log = Arc::default();
        let factory_log = log.clone();
        let registry = ComponentRegistry::with_builtins().with("record", move |_env| {
            Box::new(Recorder {
                log: factory_log.clone(),
                ctx: None,
                options: RecordOptions::default(),
            })
        });

        let scorch = Scorch::builder(ScorchConfig::default(), store)
            .with_registry(registry)
            .build();
        Self { scorch, log }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    async fn pipeline(&self, loop_index: usize) -> Value {
        let json = self.scorch.pipeline("exp", 0, loop_index).await.unwrap();
        serde_json::from_str(&json).unwrap()
    }
}

fn node<'a>(pipeline: &'a Value, id: &str) -> &'a Value {
    pipeline["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|n| n["id"] == id)
        .unwrap_or_else(|| panic!("no node {}", id))
}

fn edge_weight(pipeline: &Value, from: &str, to: &str) -> u64 {
    let nodes = pipeline["nodes"].as_array().unwrap();
    let target = nodes.iter().position(|n| n["id"] == to).unwrap();
    node(pipeline, from)["edges"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["target"] == target)
        .map(|e| e["weight"].as_u64().unwrap())
        .unwrap_or_else(|| panic!("no edge {} -> {}", from, to))
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_documented_event_order() {
    let run = Loop {
        configure: names(&["A"]),
        start: names(&["A"]),
        stop: names(&["A"]),
        cleanup: names(&["A"]),
        nested: Some(Box::new(Loop {
            start: names(&["B"]),
            count: 2,
            ..Default::default()
        })),
        count: 0,
    };
    let fixture = Fixture::new(vec![component("A", json!({})), component("B", json!({}))], run).await;

    fixture.scorch.execute("exp", 0).await.unwrap();

    assert_eq!(
        fixture.log(),
        vec!["configure A", "start A", "start B", "start B", "stop A", "cleanup A"]
    );

    let outer = fixture.pipeline(0).await;
    assert_eq!(node(&outer, "done")["status"], "success");
    assert_eq!(node(&outer, "loop")["status"], "success");
    assert_eq!(edge_weight(&outer, "configure", "configure/A"), 2);
    assert_eq!(edge_weight(&outer, "configure/A", "start"), 2);
    assert_eq!(edge_weight(&outer, "start/A", "loop"), 2);
    assert_eq!(edge_weight(&outer, "loop", "stop"), 2);
    assert_eq!(edge_weight(&outer, "cleanup/A", "done"), 2);
    // compensation paths were never taken
    assert_eq!(edge_weight(&outer, "configure", "cleanup"), 0);
    assert_eq!(edge_weight(&outer, "start", "stop"), 0);

    let inner = fixture.pipeline(1).await;
    assert_eq!(inner["count"], 2);
    assert_eq!(node(&inner, "done")["status"], "success");
}

#[tokio::test]
async fn test_configure_failure_skips_start_and_cleans_up() {
    let run = Loop {
        configure: names(&["A", "X"]),
        start: names(&["B"]),
        stop: names(&["S"]),
        cleanup: names(&["C", "D"]),
        ..Default::default()
    };
    let fixture = Fixture::new(
        vec![
            component("A", json!({"fail": ["configure"]})),
            component("X", json!({})),
            component("B", json!({})),
            component("S", json!({})),
            component("C", json!({"fail": ["cleanup"]})),
            component("D", json!({})),
        ],
        run,
    )
    .await;

    let err = fixture.scorch.execute("exp", 0).await.unwrap_err();

    // X is short-circuited; cleanup is best effort
    assert_eq!(fixture.log(), vec!["configure A", "cleanup C", "cleanup D"]);
    match err {
        ScorchError::Aggregate(errors) => {
            assert_eq!(errors.len(), 2);
            let message = errors.to_string();
            assert!(message.find("Component A").unwrap() < message.find("Component C").unwrap());
        }
        other => panic!("expected aggregate, got {}", other),
    }

    let pipeline = fixture.pipeline(0).await;
    assert_eq!(node(&pipeline, "configure")["status"], "failure");
    assert_eq!(node(&pipeline, "start")["status"], "pending");
    assert_eq!(node(&pipeline, "cleanup")["status"], "failure");
    assert_eq!(node(&pipeline, "done")["status"], "failure");
    assert_eq!(edge_weight(&pipeline, "configure", "cleanup"), 2);
    assert_eq!(edge_weight(&pipeline, "configure/A", "start"), 0);
}

#[tokio::test]
async fn test_start_failure_runs_stop_then_cleanup() {
    let run = Loop {
        start: names(&["A", "B"]),
        stop: names(&["S"]),
        cleanup: names(&["C"]),
        nested: Some(Box::new(Loop {
            start: names(&["N"]),
            count: 3,
            ..Default::default()
        })),
        ..Default::default()
    };
    let fixture = Fixture::new(
        vec![
            component("A", json!({"fail": ["start"]})),
            component("B", json!({})),
            component("N", json!({})),
            component("S", json!({})),
            component("C", json!({})),
        ],
        run,
    )
    .await;

    fixture.scorch.execute("exp", 0).await.unwrap_err();

    assert_eq!(fixture.log(), vec!["start A", "stop S", "cleanup C"]);
    let pipeline = fixture.pipeline(0).await;
    assert_eq!(node(&pipeline, "start")["status"], "failure");
    assert_eq!(node(&pipeline, "loop")["status"], "pending");
    assert_eq!(edge_weight(&pipeline, "start", "stop"), 2);
}

#[tokio::test]
async fn test_nested_failure_stops_iterations_and_orders_errors() {
    let run = Loop {
        stop: names(&["S"]),
        nested: Some(Box::new(Loop {
            start: names(&["B"]),
            count: 3,
            ..Default::default()
        })),
        ..Default::default()
    };
    let fixture = Fixture::new(
        vec![
            component("B", json!({"fail": ["start"]})),
            component("S", json!({"fail": ["stop"]})),
        ],
        run,
    )
    .await;

    let err = fixture.scorch.execute("exp", 0).await.unwrap_err();

    assert_eq!(fixture.log(), vec!["start B", "stop S"]);
    let message = err.to_string();
    assert!(message.find("Component B").unwrap() < message.find("Component S").unwrap());

    let outer = fixture.pipeline(0).await;
    assert_eq!(node(&outer, "loop")["status"], "failure");
    assert_eq!(node(&outer, "done")["status"], "failure");
}

#[tokio::test]
async fn test_background_component_reconciled_once_by_stop() {
    let run = Loop {
        start: names(&["M"]),
        stop: names(&["M"]),
        ..Default::default()
    };
    let monitor = ComponentSpec {
        background: true,
        ..component("M", json!({"wait": ["start"]}))
    };
    let fixture = Fixture::new(vec![monitor], run).await;

    // a cancelled background component counts as settled, not failed
    fixture.scorch.execute("exp", 0).await.unwrap();
    assert_eq!(fixture.log(), vec!["start M", "M cancelled", "stop M"]);

    let started = fixture
        .scorch
        .component_output(ComponentKey::new("exp", 0, 0, Stage::Start, "M"))
        .await
        .unwrap()
        .unwrap();
    assert!(!started.running);
    assert_eq!(started.status, Some(scorch_core::ComponentStatus::Success));
}

#[tokio::test]
async fn test_cancel_run_still_tears_down() {
    let run = Loop {
        start: names(&["W"]),
        cleanup: names(&["C"]),
        ..Default::default()
    };
    let fixture = Fixture::new(
        vec![component("W", json!({"wait": ["start"]})), component("C", json!({}))],
        run,
    )
    .await;
    let mut events = fixture.scorch.bus().watch("exp");

    fixture.scorch.start_run("exp", 0).await.unwrap();
    let log = fixture.log.clone();
    wait_for(|| log.lock().unwrap().len() == 1).await;

    assert_eq!(fixture.scorch.active_run("exp").await, Some(0));
    assert!(matches!(
        fixture.scorch.start_run("exp", 0).await,
        Err(ScorchError::RunInProgress { run: 0, .. })
    ));

    assert_eq!(fixture.scorch.cancel_run("exp").await.unwrap(), 0);

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let envelope = events.recv().await.unwrap();
            if let Event::RunFinished { success, .. } = envelope.event {
                return success;
            }
        }
    })
    .await
    .unwrap();

    assert!(!finished);
    assert_eq!(fixture.log(), vec!["start W", "W cancelled", "cleanup C"]);
    assert_eq!(fixture.scorch.active_run("exp").await, None);
    assert!(matches!(
        fixture.scorch.cancel_run("exp").await,
        Err(ScorchError::NoActiveRun(_))
    ));
}

#[tokio::test]
async fn test_pipeline_fetch_is_idempotent() {
    let run = Loop {
        configure: names(&["A"]),
        ..Default::default()
    };
    let fixture = Fixture::new(vec![component("A", json!({}))], run).await;

    let first = fixture.scorch.pipeline("exp", 0, 0).await.unwrap();
    let second = fixture.scorch.pipeline("exp", 0, 0).await.unwrap();
    assert_eq!(first, second);

    fixture.scorch.execute("exp", 0).await.unwrap();
    let first = fixture.scorch.pipeline("exp", 0, 0).await.unwrap();
    let second = fixture.scorch.pipeline("exp", 0, 0).await.unwrap();
    assert_eq!(first, second);

    assert!(fixture.scorch.pipeline("exp", 4, 0).await.is_err());
}

#[tokio::test]
async fn test_late_viewer_gets_buffered_output_then_done() {
    let run = Loop {
        start: names(&["T"]),
        ..Default::default()
    };
    let fixture = Fixture::new(
        vec![component("T", json!({"chunks": ["one ", "two ", "three"], "wait": ["start"]}))],
        run,
    )
    .await;
    let key = ComponentKey::new("exp", 0, 0, Stage::Start, "T");

    fixture.scorch.start_run("exp", 0).await.unwrap();
    let log = fixture.log.clone();
    wait_for(|| log.lock().unwrap().len() == 1).await;

    // the chunks are reported before the component blocks
    let scorch = fixture.scorch.clone();
    let probe = key.clone();
    tokio::time::timeout(Duration::from_secs(10), async move {
        loop {
            if let Ok(Some(output)) = scorch.component_output(probe.clone()).await {
                if output.output.as_ref() == b"one two three" {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let mut viewer = fixture.scorch.subscribe_output(key).await.unwrap();
    assert_eq!(
        viewer.recv().await,
        Some(OutputFrame::Chunk("one two three".into()))
    );

    fixture.scorch.cancel_run("exp").await.unwrap();
    loop {
        match viewer.recv().await {
            Some(OutputFrame::Done) | None => break,
            Some(OutputFrame::Chunk(_)) => continue,
        }
    }
}

#[tokio::test]
async fn test_experiment_lifecycle_hooks() {
    let run = Loop {
        start: names(&["A"]),
        ..Default::default()
    };
    let fixture = Fixture::new(vec![component("A", json!({"chunks": ["hi"]}))], run).await;
    fixture.scorch.execute("exp", 0).await.unwrap();

    let mut events = fixture.scorch.bus().subscribe();
    assert_eq!(fixture.scorch.experiment_updated("exp").await.unwrap(), 1);
    let envelope = events.recv().await.unwrap();
    assert!(matches!(envelope.event, Event::PipelineUpdated { run: 0, .. }));

    // a rebuilt graph starts over
    let pipeline = fixture.pipeline(0).await;
    assert_eq!(node(&pipeline, "done")["status"], "pending");

    let key = ComponentKey::new("exp", 0, 0, Stage::Start, "A");
    assert!(fixture.scorch.component_output(key.clone()).await.unwrap().is_some());
    fixture.scorch.experiment_stopped("exp").await.unwrap();
    assert!(fixture.scorch.component_output(key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_oversized_pause_fails_run_and_releases_experiment() {
    let run = Loop {
        configure: names(&["P"]),
        cleanup: names(&["C"]),
        ..Default::default()
    };
    let mut pause = serde_json::Map::new();
    pause.insert("duration".to_string(), json!("99999999999999999999999h"));
    let fixture = Fixture::new(
        vec![
            ComponentSpec::new("P").with_type("pause").with_metadata(pause),
            component("C", json!({})),
        ],
        run,
    )
    .await;

    let err = fixture.scorch.execute("exp", 0).await.unwrap_err();
    assert!(!matches!(err, ScorchError::TaskFailed(_)), "unexpected {}", err);
    assert!(err.to_string().contains("invalid duration"));
    assert_eq!(fixture.log(), vec!["cleanup C"]);

    assert_eq!(fixture.scorch.active_run("exp").await, None);
    let again = fixture.scorch.execute("exp", 0).await.unwrap_err();
    assert!(!matches!(again, ScorchError::RunInProgress { .. }));
}

#[tokio::test]
async fn test_panicking_component_releases_experiment() {
    let run = Loop {
        start: names(&["A"]),
        ..Default::default()
    };
    let fixture = Fixture::new(vec![component("A", json!({"panic": ["start"]}))], run).await;

    let err = fixture.scorch.execute("exp", 0).await.unwrap_err();
    assert!(matches!(err, ScorchError::TaskFailed(_)), "unexpected {}", err);
    assert_eq!(fixture.scorch.active_run("exp").await, None);

    assert!(fixture.scorch.store().running("exp").await.unwrap().is_none());

    let again = fixture.scorch.execute("exp", 0).await.unwrap_err();
    assert!(matches!(again, ScorchError::TaskFailed(_)), "unexpected {}", again);
}
