use bytes::Bytes;
use scorch_core::ComponentKey;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::Mailbox;
use crate::error::Result;

/// A frame delivered to a live output viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFrame {
    Chunk(Bytes),
    /// The component reached a terminal status; no more frames follow.
    Done,
}

pub type ViewerId = u64;

pub(crate) enum ViewerRequest {
    Register {
        key: ComponentKey,
        id: ViewerId,
        tx: mpsc::UnboundedSender<OutputFrame>,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        key: ComponentKey,
        id: ViewerId,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        key: ComponentKey,
        chunk: Bytes,
        reply: oneshot::Sender<usize>,
    },
    Finish {
        key: ComponentKey,
        reply: oneshot::Sender<()>,
    },
    Forget {
        experiment: String,
        reply: oneshot::Sender<()>,
    },
    Count {
        key: ComponentKey,
        reply: oneshot::Sender<usize>,
    },
}

/// Owns the component key to live viewer set mapping.
pub struct ViewerActor {
    viewers: HashMap<ComponentKey, Vec<(ViewerId, mpsc::UnboundedSender<OutputFrame>)>>,
}

impl ViewerActor {
    pub fn spawn(timeout: Duration) -> ViewerHandle {
        let (mailbox, mut rx) = Mailbox::channel("viewer", timeout);
        let mut actor = ViewerActor {
            viewers: HashMap::new(),
        };

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                actor.handle(request);
            }
            debug!("Viewer actor stopped");
        });

        ViewerHandle { mailbox }
    }

    fn handle(&mut self, request: ViewerRequest) {
        match request {
            ViewerRequest::Register { key, id, tx, reply } => {
                trace!(%key, id, "Registering output viewer");
                self.viewers.entry(key).or_default().push((id, tx));
                let _ = reply.send(());
            }
            ViewerRequest::Unregister { key, id, reply } => {
                let removed = match self.viewers.get_mut(&key) {
                    Some(set) => {
                        let before = set.len();
                        set.retain(|(viewer, _)| *viewer != id);
                        let removed = set.len() != before;
                        if set.is_empty() {
                            self.viewers.remove(&key);
                        }
                        removed
                    }
                    None => false,
                };
                let _ = reply.send(removed);
            }
            ViewerRequest::Publish { key, chunk, reply } => {
                let delivered = match self.viewers.get_mut(&key) {
                    Some(set) => {
                        // viewers whose receiver is gone are pruned here
                        set.retain(|(_, tx)| tx.send(OutputFrame::Chunk(chunk.clone())).is_ok());
                        set.len()
                    }
                    None => 0,
                };
                let _ = reply.send(delivered);
            }
            ViewerRequest::Finish { key, reply } => {
                if let Some(set) = self.viewers.remove(&key) {
                    for (_, tx) in set {
                        let _ = tx.send(OutputFrame::Done);
                    }
                }
                let _ = reply.send(());
            }
            ViewerRequest::Forget { experiment, reply } => {
                self.viewers.retain(|key, set| {
                    if key.experiment != experiment {
                        return true;
                    }
                    for (_, tx) in set.drain(..) {
                        let _ = tx.send(OutputFrame::Done);
                    }
                    false
                });
                let _ = reply.send(());
            }
            ViewerRequest::Count { key, reply } => {
                let _ = reply.send(self.viewers.get(&key).map(|s| s.len()).unwrap_or(0));
            }
        }
    }
}

#[derive(Clone)]
pub struct ViewerHandle {
    mailbox: Mailbox<ViewerRequest>,
}

impl ViewerHandle {
    pub async fn register(
        &self,
        key: ComponentKey,
        id: ViewerId,
        tx: mpsc::UnboundedSender<OutputFrame>,
    ) -> Result<()> {
        self.mailbox
            .call(|reply| ViewerRequest::Register { key, id, tx, reply })
            .await
    }

    /// Returns whether the viewer was still registered.
    pub async fn unregister(&self, key: ComponentKey, id: ViewerId) -> Result<bool> {
        self.mailbox
            .call(|reply| ViewerRequest::Unregister { key, id, reply })
            .await
    }

    /// Fan a chunk out to every viewer of `key`; returns how many received it.
    pub async fn publish(&self, key: ComponentKey, chunk: Bytes) -> Result<usize> {
        self.mailbox
            .call(|reply| ViewerRequest::Publish { key, chunk, reply })
            .await
    }

    /// Send the completion sentinel and detach every viewer of `key`.
    pub async fn finish(&self, key: ComponentKey) -> Result<()> {
        self.mailbox
            .call(|reply| ViewerRequest::Finish { key, reply })
            .await
    }

    pub async fn forget(&self, experiment: &str) -> Result<()> {
        let experiment = experiment.to_string();
        self.mailbox
            .call(|reply| ViewerRequest::Forget { experiment, reply })
            .await
    }

    pub async fn count(&self, key: ComponentKey) -> Result<usize> {
        self.mailbox
            .call(|reply| ViewerRequest::Count { key, reply })
            .await
    }
}
