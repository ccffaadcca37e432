//! Single-worker state owners reached through request/reply mailboxes.
//!
//! Each actor owns one map outright. Callers build a request carrying a
//! oneshot reply slot, push it onto the actor's mailbox and wait on the slot.

pub mod component;
pub mod pipeline;
pub mod viewer;

use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, ScorchError};

pub use component::{ComponentActor, ComponentHandle, ComponentOutput, OutputSubscription};
pub use pipeline::{PipelineActor, PipelineHandle};
pub use viewer::{OutputFrame, ViewerActor, ViewerHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    MailboxClosed,
    Timeout,
    ActorStopped,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CallError::MailboxClosed => "mailbox closed",
            CallError::Timeout => "call timed out",
            CallError::ActorStopped => "actor stopped before replying",
        };
        f.write_str(reason)
    }
}

/// Sending half of an actor's mailbox.
pub(crate) struct Mailbox<R> {
    actor: &'static str,
    tx: mpsc::UnboundedSender<R>,
    timeout: Duration,
}

impl<R> Clone for Mailbox<R> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor,
            tx: self.tx.clone(),
            timeout: self.timeout,
        }
    }
}

impl<R: Send + 'static> Mailbox<R> {
    pub(crate) fn channel(
        actor: &'static str,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<R>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { actor, tx, timeout }, rx)
    }

    fn unavailable(&self, reason: CallError) -> ScorchError {
        ScorchError::ActorUnavailable {
            actor: self.actor,
            reason,
        }
    }

    /// Send a request and block until the actor replies or the call times out.
    pub(crate) async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> R) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(request(reply))
            .map_err(|_| self.unavailable(CallError::MailboxClosed))?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(self.unavailable(CallError::ActorStopped)),
            Err(_) => Err(self.unavailable(CallError::Timeout)),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum Request {
        Double(u32, oneshot::Sender<u32>),
        Ignore(#[allow(dead_code)] oneshot::Sender<u32>),
    }

    fn spawn_doubler() -> Mailbox<Request> {
        let (mailbox, mut rx) = Mailbox::channel("doubler", Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ignored = Vec::new();
            while let Some(request) = rx.recv().await {
                match request {
                    Request::Double(n, reply) => {
                        let _ = reply.send(n * 2);
                    }
                    Request::Ignore(reply) => ignored.push(reply),
                }
            }
        });
        mailbox
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let mailbox = spawn_doubler();
        let value = mailbox.call(|reply| Request::Double(21, reply)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let mailbox = spawn_doubler();
        let result = mailbox.call(Request::Ignore).await;
        assert!(matches!(
            result,
            Err(ScorchError::ActorUnavailable {
                actor: "doubler",
                reason: CallError::Timeout
            })
        ));
    }

    #[tokio::test]
    async fn test_call_on_closed_mailbox() {
        let (mailbox, rx) = Mailbox::<Request>::channel("closed", Duration::from_secs(1));
        drop(rx);
        assert!(mailbox.is_closed());
        let result = mailbox.call(|reply| Request::Double(1, reply)).await;
        assert!(matches!(
            result,
            Err(ScorchError::ActorUnavailable {
                reason: CallError::MailboxClosed,
                ..
            })
        ));
    }
}
