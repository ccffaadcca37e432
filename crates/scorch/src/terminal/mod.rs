//! Interactive breakpoint terminals.
//!
//! One pseudo-terminal per breakpoint, registered by process ID and by its
//! component key. The first client to claim a session gets read-write access
//! for a short window in which its websocket must attach; everyone else reads
//! only. Ownership transfer needs an atomic claim-or-reject, so the session
//! maps sit behind a mutex instead of an actor mailbox.

mod pty;

use bytes::Bytes;
use events::{Event, EventBus};
use scorch_core::ComponentKey;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::error::{Result, ScorchError};

pub use pty::{spawn_terminal, PtyProcess};

pub type ClientId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum Access {
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalFrame {
    Output(Bytes),
    /// The process exited; the session is gone.
    Exited,
}

/// Write side of a terminal process.
pub trait TerminalIo: Send {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()>;
    fn resize(&mut self, rows: u16, cols: u16) -> Result<()>;
}

struct Claim {
    client: ClientId,
    claimed_at: Instant,
    attached: bool,
}

struct Session {
    key: ComponentKey,
    io: Box<dyn TerminalIo>,
    history: VecDeque<u8>,
    owner: Option<Claim>,
    viewers: HashMap<ClientId, mpsc::UnboundedSender<TerminalFrame>>,
}

impl Session {
    fn is_attached_owner(&self, client: &str) -> bool {
        matches!(&self.owner, Some(claim) if claim.client == client && claim.attached)
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<u32, Session>,
    keys: HashMap<ComponentKey, u32>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct TerminalInfo {
    pub pid: u32,
    pub experiment: String,
    pub run: usize,
    #[serde(rename = "loop")]
    pub loop_index: usize,
    pub stage: scorch_core::Stage,
    pub name: String,
    pub owner: Option<ClientId>,
    pub viewers: usize,
}

/// A client's attachment to a terminal: the replayed history plus a live feed.
#[derive(Debug)]
pub struct TerminalAttachment {
    pub pid: u32,
    pub access: Access,
    pub history: Bytes,
    rx: mpsc::UnboundedReceiver<TerminalFrame>,
}

impl TerminalAttachment {
    pub async fn recv(&mut self) -> Option<TerminalFrame> {
        self.rx.recv().await
    }
}

#[derive(Clone)]
pub struct TerminalRegistry {
    inner: Arc<Mutex<Inner>>,
    bus: EventBus,
    claim_window: Duration,
    history_limit: usize,
}

impl TerminalRegistry {
    pub fn new(bus: EventBus, claim_window: Duration, history_limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            bus,
            claim_window,
            history_limit,
        }
    }

    pub async fn register(&self, key: ComponentKey, pid: u32, io: Box<dyn TerminalIo>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.keys.get(&key) {
            return Err(ScorchError::Terminal(format!(
                "{} already has terminal {}",
                key, existing
            )));
        }

        inner.keys.insert(key.clone(), pid);
        inner.sessions.insert(
            pid,
            Session {
                key: key.clone(),
                io,
                history: VecDeque::new(),
                owner: None,
                viewers: HashMap::new(),
            },
        );
        drop(inner);

        info!(pid, %key, "Terminal registered");
        self.bus.emit(Event::TerminalCreated {
            experiment: key.experiment,
            run: key.run,
            loop_index: key.loop_index,
            stage: key.stage,
            name: key.name,
            pid,
        });
        Ok(())
    }

    /// Record process output and fan it out to attached clients.
    pub async fn push_output(&self, pid: u32, chunk: Bytes) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get_mut(&pid) else {
            return;
        };

        session.history.extend(chunk.iter().copied());
        let excess = session.history.len().saturating_sub(self.history_limit);
        if excess > 0 {
            session.history.drain(..excess);
        }

        session
            .viewers
            .retain(|_, tx| tx.send(TerminalFrame::Output(chunk.clone())).is_ok());
    }

    /// Tear down a session after its process exited.
    pub async fn exited(&self, pid: u32) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.remove(&pid) else {
            return;
        };
        inner.keys.remove(&session.key);
        drop(inner);

        for (_, tx) in session.viewers {
            let _ = tx.send(TerminalFrame::Exited);
        }

        info!(pid, key = %session.key, "Terminal exited");
        self.bus.emit(Event::TerminalExited {
            experiment: session.key.experiment,
            pid,
        });
    }

    /// Ask for read-write access. The first claimant, or the first after an
    /// unattached claim expired, gets it; everyone else reads only.
    pub async fn claim(&self, pid: u32, client: &str) -> Result<Access> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(&pid)
            .ok_or_else(|| ScorchError::TerminalNotFound(pid.to_string()))?;

        let now = Instant::now();
        let access = match &mut session.owner {
            Some(claim) if claim.client == client => {
                if !claim.attached {
                    claim.claimed_at = now;
                }
                Access::ReadWrite
            }
            Some(claim) if claim.attached || now.duration_since(claim.claimed_at) < self.claim_window => {
                Access::ReadOnly
            }
            _ => {
                session.owner = Some(Claim {
                    client: client.to_string(),
                    claimed_at: now,
                    attached: false,
                });
                Access::ReadWrite
            }
        };

        debug!(pid, client, ?access, "Terminal claim");
        Ok(access)
    }

    pub async fn claim_by_key(&self, key: &ComponentKey, client: &str) -> Result<(u32, Access)> {
        let pid = self
            .find(key)
            .await
            .ok_or_else(|| ScorchError::TerminalNotFound(key.to_string()))?;
        Ok((pid, self.claim(pid, client).await?))
    }

    /// Attach a client's stream. A read-write claimant must attach inside the
    /// claim window or the claim is revoked.
    pub async fn attach(&self, pid: u32, client: &str) -> Result<TerminalAttachment> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(&pid)
            .ok_or_else(|| ScorchError::TerminalNotFound(pid.to_string()))?;

        let access = match &mut session.owner {
            Some(claim) if claim.client == client => {
                if claim.attached {
                    return Err(ScorchError::OwnershipRejected(format!(
                        "{} is already attached to terminal {}",
                        client, pid
                    )));
                }
                if Instant::now().duration_since(claim.claimed_at) >= self.claim_window {
                    session.owner = None;
                    return Err(ScorchError::OwnershipRejected(format!(
                        "claim on terminal {} expired",
                        pid
                    )));
                }
                claim.attached = true;
                Access::ReadWrite
            }
            _ => Access::ReadOnly,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        session.viewers.insert(client.to_string(), tx);
        let (front, back) = session.history.as_slices();
        let mut history = Vec::with_capacity(front.len() + back.len());
        history.extend_from_slice(front);
        history.extend_from_slice(back);

        debug!(pid, client, ?access, "Terminal attached");
        Ok(TerminalAttachment {
            pid,
            access,
            history: Bytes::from(history),
            rx,
        })
    }

    /// Forward client input. Returns false when the client is not the
    /// attached owner and the input was discarded.
    pub async fn write(&self, pid: u32, client: &str, data: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(&pid)
            .ok_or_else(|| ScorchError::TerminalNotFound(pid.to_string()))?;

        if !session.is_attached_owner(client) {
            return Ok(false);
        }
        session.io.write(data)?;
        Ok(true)
    }

    pub async fn resize(&self, pid: u32, client: &str, rows: u16, cols: u16) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(&pid)
            .ok_or_else(|| ScorchError::TerminalNotFound(pid.to_string()))?;

        if !session.is_attached_owner(client) {
            return Ok(false);
        }
        session.io.resize(rows, cols)?;
        Ok(true)
    }

    /// Drop a client's stream. An owner detaching frees ownership.
    pub async fn detach(&self, pid: u32, client: &str) {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.sessions.get_mut(&pid) else {
            return;
        };
        session.viewers.remove(client);
        if matches!(&session.owner, Some(claim) if claim.client == client) {
            session.owner = None;
        }
    }

    pub async fn find(&self, key: &ComponentKey) -> Option<u32> {
        self.inner.lock().await.keys.get(key).copied()
    }

    pub async fn list(&self, experiment: Option<&str>) -> Vec<TerminalInfo> {
        let inner = self.inner.lock().await;
        let mut terminals: Vec<TerminalInfo> = inner
            .sessions
            .iter()
            .filter(|(_, s)| experiment.map_or(true, |e| s.key.experiment == e))
            .map(|(pid, s)| TerminalInfo {
                pid: *pid,
                experiment: s.key.experiment.clone(),
                run: s.key.run,
                loop_index: s.key.loop_index,
                stage: s.key.stage,
                name: s.key.name.clone(),
                owner: s.owner.as_ref().map(|c| c.client.clone()),
                viewers: s.viewers.len(),
            })
            .collect();
        terminals.sort_by_key(|t| t.pid);
        terminals
    }
}

impl std::fmt::Debug for TerminalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalRegistry")
            .field("claim_window", &self.claim_window)
            .field("history_limit", &self.history_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scorch_core::Stage;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Default)]
    struct FakeIo {
        written: Arc<StdMutex<Vec<u8>>>,
        sizes: Arc<StdMutex<Vec<(u16, u16)>>>,
    }

    impl TerminalIo for FakeIo {
        fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
            self.sizes.lock().unwrap().push((rows, cols));
            Ok(())
        }
    }

    fn key() -> ComponentKey {
        ComponentKey::new("exp", 0, 0, Stage::Start, "bp")
    }

    async fn registry_with_session(history_limit: usize) -> (TerminalRegistry, FakeIo) {
        let registry = TerminalRegistry::new(EventBus::new(), Duration::from_secs(5), history_limit);
        let io = FakeIo::default();
        registry.register(key(), 42, Box::new(io.clone())).await.unwrap();
        (registry, io)
    }

    #[tokio::test]
    async fn test_first_claim_owns() {
        let (registry, _io) = registry_with_session(1024).await;
        assert_eq!(registry.claim(42, "alice").await.unwrap(), Access::ReadWrite);
        assert_eq!(registry.claim(42, "bob").await.unwrap(), Access::ReadOnly);
        assert_eq!(registry.claim(42, "alice").await.unwrap(), Access::ReadWrite);
        assert!(matches!(
            registry.claim(7, "alice").await,
            Err(ScorchError::TerminalNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unattached_claim_expires() {
        let (registry, _io) = registry_with_session(1024).await;
        assert_eq!(registry.claim(42, "alice").await.unwrap(), Access::ReadWrite);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(registry.claim(42, "bob").await.unwrap(), Access::ReadWrite);

        // alice's late websocket no longer owns anything
        let attachment = registry.attach(42, "alice").await.unwrap();
        assert_eq!(attachment.access, Access::ReadOnly);
        let attachment = registry.attach(42, "bob").await.unwrap();
        assert_eq!(attachment.access, Access::ReadWrite);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_after_window_is_rejected() {
        let (registry, _io) = registry_with_session(1024).await;
        registry.claim(42, "alice").await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(
            registry.attach(42, "alice").await,
            Err(ScorchError::OwnershipRejected(_))
        ));
        assert_eq!(registry.list(None).await[0].owner, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_owner_survives_window() {
        let (registry, _io) = registry_with_session(1024).await;
        registry.claim(42, "alice").await.unwrap();
        registry.attach(42, "alice").await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(registry.claim(42, "bob").await.unwrap(), Access::ReadOnly);
    }

    #[tokio::test]
    async fn test_only_owner_writes() {
        let (registry, io) = registry_with_session(1024).await;
        registry.claim(42, "alice").await.unwrap();
        registry.attach(42, "alice").await.unwrap();
        registry.attach(42, "bob").await.unwrap();

        assert!(registry.write(42, "alice", b"ls\n").await.unwrap());
        assert!(!registry.write(42, "bob", b"rm -rf /\n").await.unwrap());
        assert!(registry.resize(42, "alice", 40, 120).await.unwrap());
        assert!(!registry.resize(42, "bob", 1, 1).await.unwrap());

        assert_eq!(io.written.lock().unwrap().as_slice(), b"ls\n");
        assert_eq!(io.sizes.lock().unwrap().as_slice(), &[(40, 120)]);
    }

    #[tokio::test]
    async fn test_history_replay_and_live_output() {
        let (registry, _io) = registry_with_session(4).await;
        registry.push_output(42, Bytes::from("abc")).await;
        registry.push_output(42, Bytes::from("def")).await;

        let mut attachment = registry.attach(42, "viewer").await.unwrap();
        // oldest bytes dropped past the limit
        assert_eq!(attachment.history, Bytes::from("cdef"));

        registry.push_output(42, Bytes::from("g")).await;
        assert_eq!(
            attachment.recv().await,
            Some(TerminalFrame::Output(Bytes::from("g")))
        );
    }

    #[tokio::test]
    async fn test_exit_notifies_viewers_and_frees_session() {
        let (registry, _io) = registry_with_session(1024).await;
        let mut viewer = registry.attach(42, "viewer").await.unwrap();

        registry.exited(42).await;
        assert_eq!(viewer.recv().await, Some(TerminalFrame::Exited));
        assert_eq!(viewer.recv().await, None);
        assert!(registry.find(&key()).await.is_none());
        assert!(registry.list(Some("exp")).await.is_empty());
    }

    #[tokio::test]
    async fn test_owner_detach_frees_ownership() {
        let (registry, _io) = registry_with_session(1024).await;
        registry.claim(42, "alice").await.unwrap();
        registry.attach(42, "alice").await.unwrap();
        registry.detach(42, "alice").await;
        assert_eq!(registry.claim(42, "bob").await.unwrap(), Access::ReadWrite);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let (registry, io) = registry_with_session(1024).await;
        let result = registry.register(key(), 43, Box::new(io)).await;
        assert!(matches!(result, Err(ScorchError::Terminal(_))));
        assert_eq!(registry.claim_by_key(&key(), "alice").await.unwrap(), (42, Access::ReadWrite));
    }
}
