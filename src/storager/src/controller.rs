use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use protocol::{Signal, encode};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// What a connection's writer task consumes.
#[derive(Debug)]
pub enum Outbound {
    Frame(Bytes),
    /// Resolves once every frame queued before it has been written
    Flush(oneshot::Sender<()>),
}

/// Outbound side of the most recently connected controller. Job
/// notifications go there, whichever connection the job came from.
#[derive(Default)]
pub struct ControllerLink {
    current: Mutex<Option<(u64, mpsc::UnboundedSender<Outbound>)>>,
    next_id: AtomicU64,
}

impl ControllerLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `sender` the notification target; returns a connection id for
    /// [`ControllerLink::detach`].
    pub fn attach(&self, sender: mpsc::UnboundedSender<Outbound>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut current) = self.current.lock() {
            *current = Some((id, sender));
        }
        id
    }

    /// Forget the connection unless a newer one already took over.
    pub fn detach(&self, connection_id: u64) {
        if let Ok(mut current) = self.current.lock() {
            if matches!(current.as_ref(), Some((id, _)) if *id == connection_id) {
                *current = None;
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.current.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Frame and queue a notification. Returns false when no controller is
    /// connected.
    pub fn send(&self, signal: Signal, payload: &Value) -> bool {
        let Ok(current) = self.current.lock() else {
            return false;
        };
        match current.as_ref() {
            Some((_, sender)) => {
                debug!(%signal, "Notifying controller");
                sender
                    .send(Outbound::Frame(encode(signal, Some(payload))))
                    .is_ok()
            }
            None => {
                warn!(%signal, "No controller connected, notification dropped");
                false
            }
        }
    }
}
