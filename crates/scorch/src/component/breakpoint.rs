use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::tap::{create_tap, remove_tap, TapOptions};
use super::Component;
use crate::context::{Environment, ExecutionContext, TerminalMode};
use crate::error::{Result, ScorchError};
use crate::terminal::spawn_terminal;

#[derive(Debug, Clone, Default, Deserialize)]
struct BreakOptions {
    /// Attach the breakpoint's host to the experiment network
    #[serde(default)]
    tap: Option<TapOptions>,
}

/// Suspends the pipeline in a shell until a human exits it.
pub struct Breakpoint {
    env: Environment,
    ctx: Option<ExecutionContext>,
    options: BreakOptions,
}

impl Breakpoint {
    pub fn new(env: Environment) -> Self {
        Self {
            env,
            ctx: None,
            options: BreakOptions::default(),
        }
    }

    fn shell_env(ctx: &ExecutionContext) -> Vec<(&'static str, String)> {
        vec![
            ("SCORCH_EXPERIMENT", ctx.experiment.name.clone()),
            ("SCORCH_RUN", ctx.run.to_string()),
            ("SCORCH_LOOP", ctx.loop_index.to_string()),
            ("SCORCH_COUNT", ctx.count.to_string()),
            ("SCORCH_STAGE", ctx.stage.to_string()),
            ("SCORCH_COMPONENT", ctx.name.clone()),
        ]
    }

    async fn suspend(&self, token: CancellationToken) -> Result<()> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| ScorchError::invalid_metadata("break", "component used before init"))?;

        let tapped = match &self.options.tap {
            Some(options) => {
                create_tap(&self.env, ctx, options)
                    .await
                    .map_err(|e| ctx.failed(e))?;
                true
            }
            None => false,
        };

        let result = match self.env.terminal_mode {
            TerminalMode::Cli => self.shell(ctx, token).await,
            TerminalMode::Web => self.terminal(ctx, token).await,
        };

        if tapped {
            if let Err(e) = remove_tap(&self.env, &ctx.experiment.name, &ctx.name).await {
                warn!(component = %ctx.name, error = %e, "Failed to remove breakpoint tap");
                if result.is_ok() {
                    return Err(ctx.failed(e));
                }
            }
        }
        result
    }

    async fn shell(&self, ctx: &ExecutionContext, token: CancellationToken) -> Result<()> {
        let shell = &self.env.config.break_shell;
        let mut child = Command::new(shell)
            .envs(Self::shell_env(ctx))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ctx.failed(format!("failed to start {}: {}", shell, e)))?;

        eprintln!(
            "\nBreakpoint {} ({} stage). Exit the shell to continue.\n",
            ctx.name, ctx.stage
        );
        ctx.reporter
            .output(format!("breakpoint shell {} waiting\n", shell))
            .await?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                info!(component = %ctx.name, %status, "Breakpoint shell exited");
                Ok(())
            }
            _ = token.cancelled() => Err(ScorchError::Cancelled),
        }
    }

    async fn terminal(&self, ctx: &ExecutionContext, token: CancellationToken) -> Result<()> {
        let env = Self::shell_env(ctx);
        let mut process = spawn_terminal(
            &self.env.terminals,
            ctx.key(),
            &self.env.config.break_shell,
            &env,
        )
        .await
        .map_err(|e| ctx.failed(e))?;

        ctx.reporter
            .output(format!("breakpoint terminal {} waiting\n", process.pid))
            .await?;

        tokio::select! {
            _ = process.wait() => {
                info!(component = %ctx.name, pid = process.pid, "Breakpoint terminal exited");
                Ok(())
            }
            _ = token.cancelled() => {
                process.kill();
                process.wait().await;
                Err(ScorchError::Cancelled)
            }
        }
    }
}

#[async_trait]
impl Component for Breakpoint {
    async fn init(&mut self, ctx: ExecutionContext) -> Result<()> {
        self.options = ctx.options()?;
        self.ctx = Some(ctx);
        Ok(())
    }

    fn component_type(&self) -> &str {
        "break"
    }

    async fn configure(&self, token: CancellationToken) -> Result<()> {
        self.suspend(token).await
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        self.suspend(token).await
    }

    async fn stop(&self, token: CancellationToken) -> Result<()> {
        self.suspend(token).await
    }

    async fn cleanup(&self, token: CancellationToken) -> Result<()> {
        self.suspend(token).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::ScorchConfig;
    use crate::terminal::TerminalFrame;
    use scorch_core::Stage;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_web_breakpoint_runs_until_cancelled_and_removes_tap() {
        let cluster = Arc::new(FakeCluster::default());
        let config = ScorchConfig {
            break_shell: "sh".to_string(),
            ..Default::default()
        };
        let harness = Harness::new(config, cluster.clone()).await;
        let ctx = harness.context(
            Stage::Start,
            "break",
            "bp",
            metadata(json!({"tap": {"name": "bp0", "vlan": "EXP"}})),
        );

        let mut breakpoint = Breakpoint::new(harness.env.clone());
        breakpoint.init(ctx.clone()).await.unwrap();

        let token = CancellationToken::new();
        let task = {
            let token = token.clone();
            tokio::spawn(async move { breakpoint.start(token).await })
        };

        let terminals = harness.env.terminals.clone();
        let pid = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(pid) = terminals.find(&ctx.key()).await {
                    return pid;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        let mut viewer = terminals.attach(pid, "viewer").await.unwrap();

        token.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ScorchError::Cancelled)));

        // the viewer sees any trailing output, then the exit
        loop {
            match viewer.recv().await {
                Some(TerminalFrame::Exited) | None => break,
                Some(TerminalFrame::Output(_)) => continue,
            }
        }
        assert!(terminals.find(&ctx.key()).await.is_none());
        assert_eq!(cluster.calls(), vec!["create bp0 vlan 101 ip -", "delete bp0"]);
    }
}
