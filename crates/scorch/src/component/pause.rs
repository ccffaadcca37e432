use async_trait::async_trait;
use scorch_core::Stage;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Component;
use crate::context::{Environment, ExecutionContext};
use crate::error::{Result, ScorchError};

#[derive(Debug, Clone, Default, Deserialize)]
struct PauseOptions {
    #[serde(default)]
    duration: Option<String>,
    /// Stages at which the pause fails once it elapses
    #[serde(default)]
    fail: Vec<Stage>,
}

/// Parse `500ms`, `30s`, `5m`, `1h`, or a bare number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }

    let seconds = match unit.trim() {
        "ms" => number / 1000.0,
        "" | "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(seconds).ok()
}

/// Waits for a configured duration at every stage it is listed in.
pub struct Pause {
    env: Environment,
    ctx: Option<ExecutionContext>,
    duration: Duration,
    fail: Vec<Stage>,
}

impl Pause {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            ctx: None,
            duration: Duration::ZERO,
            fail: Vec::new(),
        }
    }

    async fn pause(&self, stage: Stage, token: CancellationToken) -> Result<()> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| ScorchError::invalid_metadata("pause", "component used before init"))?;

        let poll = self.env.config.poll_interval();
        let deadline = Instant::now() + self.duration;
        debug!(component = %ctx.name, %stage, duration = ?self.duration, "Pausing");

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            tokio::select! {
                _ = token.cancelled() => return Err(ScorchError::Cancelled),
                _ = tokio::time::sleep(remaining.min(poll)) => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                ctx.reporter
                    .output(format!(
                        "still pausing, {}s remaining\n",
                        remaining.as_secs_f64().ceil()
                    ))
                    .await?;
            }
        }

        if self.fail.contains(&stage) {
            return Err(ctx.failed(format!("configured to fail at {}", stage)));
        }
        Ok(())
    }
}

#[async_trait]
impl Component for Pause {
    async fn init(&mut self, ctx: ExecutionContext) -> Result<()> {
        let options: PauseOptions = ctx.options()?;
        self.duration = match options.duration.as_deref() {
            Some(value) => parse_duration(value).ok_or_else(|| {
                ScorchError::invalid_metadata(ctx.name.clone(), format!("invalid duration {:?}", value))
            })?,
            None => Duration::ZERO,
        };
        self.fail = options.fail;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn component_type(&self) -> &str {
        "pause"
    }

    async fn configure(&self, token: CancellationToken) -> Result<()> {
        self.pause(Stage::Configure, token).await
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        self.pause(Stage::Start, token).await
    }

    async fn stop(&self, token: CancellationToken) -> Result<()> {
        self.pause(Stage::Stop, token).await
    }

    async fn cleanup(&self, token: CancellationToken) -> Result<()> {
        self.pause(Stage::Cleanup, token).await
    }
}
