use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Component;
use crate::context::{Environment, ExecutionContext};
use crate::error::{Result, ScorchError};

/// Fallback for types without a built-in variant: runs the external program
/// `<prefix><type> <stage>` with the experiment as JSON on stdin and streams
/// its combined stdout and stderr back as component output.
pub struct UserComponent {
    env: Environment,
    ctx: Option<ExecutionContext>,
}

impl UserComponent {
    pub fn new(env: Environment) -> Self {
        Self { env, ctx: None }
    }

    fn program(&self, ctx: &ExecutionContext) -> String {
        format!("{}{}", self.env.config.user_component_prefix, ctx.component_type)
    }

    async fn execute(&self, token: CancellationToken) -> Result<()> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| ScorchError::invalid_metadata("user", "component used before init"))?;

        let program = self.program(ctx);
        let payload = serde_json::to_vec(&json!({
            "experiment": &*ctx.experiment,
            "component": {
                "name": ctx.name,
                "type": ctx.component_type,
                "metadata": ctx.metadata,
                "background": ctx.background,
            },
            "stage": ctx.stage,
            "run": ctx.run,
            "loop": ctx.loop_index,
            "count": ctx.count,
        }))?;

        debug!(program = %program, stage = %ctx.stage, component = %ctx.name, "Running user component");

        let mut child = Command::new(&program)
            .arg(ctx.stage.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ctx.failed(format!("executable {} not found", program))
                } else {
                    ctx.failed(e)
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                // programs that ignore stdin may close it early
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "User component did not read its input");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ctx.failed("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ctx.failed("stderr not captured"))?;
        let mut output = ReaderStream::new(stdout).merge(ReaderStream::new(stderr));

        let run = async {
            while let Some(chunk) = output.next().await {
                ctx.reporter.output(chunk?).await?;
            }
            Ok::<_, ScorchError>(child.wait().await?)
        };

        // child is killed on drop when the token wins
        let status = tokio::select! {
            status = run => status?,
            _ = token.cancelled() => return Err(ScorchError::Cancelled),
        };

        if !status.success() {
            warn!(program = %program, %status, component = %ctx.name, "User component failed");
            return Err(ctx.failed(format!("{} exited with {}", program, status)));
        }
        Ok(())
    }
}

#[async_trait]
impl Component for UserComponent {
    async fn init(&mut self, ctx: ExecutionContext) -> Result<()> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn component_type(&self) -> &str {
        match &self.ctx {
            Some(ctx) => &ctx.component_type,
            None => "user",
        }
    }

    async fn configure(&self, token: CancellationToken) -> Result<()> {
        self.execute(token).await
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        self.execute(token).await
    }

    async fn stop(&self, token: CancellationToken) -> Result<()> {
        self.execute(token).await
    }

    async fn cleanup(&self, token: CancellationToken) -> Result<()> {
        self.execute(token).await
    }
}
