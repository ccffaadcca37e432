use async_trait::async_trait;
use cluster::HealthReport;
use scorch_core::Stage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Component;
use crate::context::{Environment, ExecutionContext};
use crate::error::{Result, ScorchError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SohOptions {
    /// Checks to run; empty runs every check
    #[serde(default)]
    checks: Vec<String>,
    #[serde(default)]
    fail_on_error: bool,
}

#[derive(Debug, Serialize)]
struct SohRecord<'a> {
    component: &'a str,
    stage: Stage,
    run: usize,
    #[serde(rename = "loop")]
    loop_index: usize,
    count: usize,
    passed: bool,
    results: &'a HealthReport,
}

/// Runs the experiment's health checks and records the results per run and
/// loop iteration.
pub struct StateOfHealth {
    env: Environment,
    ctx: Option<ExecutionContext>,
    options: SohOptions,
}

impl StateOfHealth {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            ctx: None,
            options: SohOptions::default(),
        }
    }

    fn results_path(&self, ctx: &ExecutionContext) -> PathBuf {
        self.env
            .config
            .experiment_dir(&ctx.experiment.name)
            .join("soh")
            .join(format!("run-{}", ctx.run))
            .join(format!("loop-{}", ctx.loop_index))
            .join(format!("count-{}", ctx.count))
            .join(format!("{}-{}.json", ctx.stage, ctx.name))
    }

    async fn check(&self) -> Result<()> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| ScorchError::invalid_metadata("soh", "component used before init"))?;

        let report = self
            .env
            .health
            .check(&ctx.experiment.name, &self.options.checks)
            .await
            .map_err(|e| ctx.failed(e))?;
        let passed = report.passed();

        let path = self.results_path(ctx);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let record = SohRecord {
            component: &ctx.name,
            stage: ctx.stage,
            run: ctx.run,
            loop_index: ctx.loop_index,
            count: ctx.count,
            passed,
            results: &report,
        };
        tokio::fs::write(&path, serde_json::to_vec_pretty(&record)?).await?;

        let failures = report.failures();
        let summary = if passed {
            format!("{} health checks passed\n", report.results.len())
        } else {
            format!("health checks failed: {}\n", failures.join(", "))
        };
        ctx.reporter.output(summary).await?;

        info!(
            experiment = %ctx.experiment.name,
            component = %ctx.name,
            passed,
            path = %path.display(),
            "State of health recorded"
        );

        if !passed {
            if self.options.fail_on_error {
                return Err(ctx.failed(format!("health checks failed: {}", failures.join(", "))));
            }
            warn!(component = %ctx.name, ?failures, "Health checks failed, continuing");
        }
        Ok(())
    }
}

#[async_trait]
impl Component for StateOfHealth {
    async fn init(&mut self, ctx: ExecutionContext) -> Result<()> {
        self.options = ctx.options()?;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn component_type(&self) -> &str {
        "soh"
    }

    async fn configure(&self, _token: CancellationToken) -> Result<()> {
        self.check().await
    }

    async fn start(&self, _token: CancellationToken) -> Result<()> {
        self.check().await
    }

    async fn stop(&self, _token: CancellationToken) -> Result<()> {
        self.check().await
    }

    async fn cleanup(&self, _token: CancellationToken) -> Result<()> {
        self.check().await
    }
}
