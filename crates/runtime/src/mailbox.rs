//! Receive side of an agent's inbound channel.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use troupe_core::Message;

/// Shared handle to one registration's inbound queue.
///
/// Cloning the handle does not duplicate messages: all clones drain the same
/// queue. Once the agent is unregistered, `recv` returns `None`.
#[derive(Clone)]
pub struct Mailbox {
    agent: String,
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    closed: CancellationToken,
}

impl Mailbox {
    pub(crate) fn new(agent: impl Into<String>, rx: mpsc::Receiver<Message>) -> Self {
        Self {
            agent: agent.into(),
            rx: Arc::new(Mutex::new(rx)),
            closed: CancellationToken::new(),
        }
    }

    /// Agent this mailbox belongs to.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Wait for the next message. `None` once the channel is closed.
    pub async fn recv(&self) -> Option<Message> {
        if self.closed.is_cancelled() {
            return None;
        }
        let mut rx = tokio::select! {
            _ = self.closed.cancelled() => return None,
            guard = self.rx.lock() => guard,
        };
        tokio::select! {
            _ = self.closed.cancelled() => {
                rx.close();
                None
            }
            msg = rx.recv() => msg,
        }
    }

    /// Take a message if one is immediately available.
    pub fn try_recv(&self) -> Option<Message> {
        if self.closed.is_cancelled() {
            return None;
        }
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Resolves once the owning registration is gone.
    pub(crate) async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Number of buffered messages. Reports zero while another handle is
    /// waiting in `recv`.
    pub fn len(&self) -> usize {
        if self.closed.is_cancelled() {
            return 0;
        }
        self.rx.try_lock().map(|rx| rx.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the queue. Pending and future sends fail; buffered messages are
    /// discarded from this handle's point of view. When another handle holds
    /// the receiver, it closes the channel as it wakes.
    pub(crate) fn close(&self) {
        self.closed.cancel();
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("agent", &self.agent)
            .field("closed", &self.is_closed())
            .finish()
    }
}
