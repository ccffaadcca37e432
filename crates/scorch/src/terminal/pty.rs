use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use scorch_core::ComponentKey;
use std::io::{Read, Write};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::{TerminalIo, TerminalRegistry};
use crate::error::{Result, ScorchError};

const READ_BUFFER: usize = 4096;

/// How long exit handling waits for the last output to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

fn pty_error(e: impl std::fmt::Display) -> ScorchError {
    ScorchError::Terminal(e.to_string())
}

struct PtyIo {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
}

impl TerminalIo for PtyIo {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(pty_error)
    }
}

/// A running terminal process. Dropping it does not kill the process.
pub struct PtyProcess {
    pub pid: u32,
    killer: Box<dyn ChildKiller + Send + Sync>,
    exited: watch::Receiver<bool>,
}

impl PtyProcess {
    pub fn kill(&mut self) {
        if let Err(e) = self.killer.kill() {
            debug!(pid = self.pid, error = %e, "Terminal kill failed, process likely gone");
        }
    }

    /// Resolves once the process exited and its session was torn down.
    pub async fn wait(&mut self) {
        while !*self.exited.borrow() {
            if self.exited.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Spawn `program` on a fresh pseudo-terminal and register it under `key`.
pub async fn spawn_terminal(
    registry: &TerminalRegistry,
    key: ComponentKey,
    program: &str,
    env: &[(&str, String)],
) -> Result<PtyProcess> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(pty_error)?;

    let mut cmd = CommandBuilder::new(program);
    cmd.env("TERM", "xterm-256color");
    for (name, value) in env {
        cmd.env(name, value);
    }

    let mut child = pair.slave.spawn_command(cmd).map_err(pty_error)?;
    drop(pair.slave);

    let pid = child
        .process_id()
        .ok_or_else(|| ScorchError::Terminal(format!("{} started without a pid", program)))?;
    let mut reader = pair.master.try_clone_reader().map_err(pty_error)?;
    let writer = pair.master.take_writer().map_err(pty_error)?;
    let killer = child.clone_killer();

    registry
        .register(
            key,
            pid,
            Box::new(PtyIo {
                master: pair.master,
                writer,
            }),
        )
        .await?;

    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if chunk_tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let forward_registry = registry.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(chunk) = chunk_rx.recv().await {
            forward_registry.push_output(pid, chunk).await;
        }
    });

    let (exit_tx, exit_rx) = watch::channel(false);
    let exit_registry = registry.clone();
    tokio::spawn(async move {
        match tokio::task::spawn_blocking(move || child.wait()).await {
            Ok(Ok(status)) => debug!(pid, ?status, "Terminal process exited"),
            Ok(Err(e)) => warn!(pid, error = %e, "Failed to wait on terminal process"),
            Err(e) => warn!(pid, error = %e, "Terminal wait task panicked"),
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, forwarder).await.is_err() {
            debug!(pid, "Terminal output still open after exit");
        }
        exit_registry.exited(pid).await;
        let _ = exit_tx.send(true);
    });

    Ok(PtyProcess {
        pid,
        killer,
        exited: exit_rx,
    })
}
