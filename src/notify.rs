//! Fire-and-forget messages to every open client.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 32;

/// Messages posted to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// A drain replayed `count` queued notes
  SyncCompleted { count: usize },
  /// Connectivity came back; `timestamp` is epoch milliseconds
  ConnectivityRestored { timestamp: i64 },
}

/// Broadcast channel to the currently open clients.
///
/// Clients that are not subscribed when a message is posted never see it.
#[derive(Clone)]
pub struct ClientChannel {
  tx: broadcast::Sender<ClientMessage>,
}

impl ClientChannel {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
    Self { tx }
  }

  /// Register a new open client.
  pub fn subscribe(&self) -> ClientHandle {
    ClientHandle {
      rx: self.tx.subscribe(),
    }
  }

  pub fn client_count(&self) -> usize {
    self.tx.receiver_count()
  }

  /// Post to every open client. Returns how many clients it reached.
  pub fn post(&self, message: ClientMessage) -> usize {
    match self.tx.send(message) {
      Ok(reached) => {
        tracing::debug!(clients = reached, "posted client message");
        reached
      }
      // No open clients
      Err(_) => 0,
    }
  }
}

impl Default for ClientChannel {
  fn default() -> Self {
    Self::new()
  }
}

/// One open client's inbox.
pub struct ClientHandle {
  rx: broadcast::Receiver<ClientMessage>,
}

impl ClientHandle {
  /// Next message, or None once the channel is gone.
  pub async fn recv(&mut self) -> Option<ClientMessage> {
    loop {
      match self.rx.recv().await {
        Ok(message) => return Some(message),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          tracing::warn!(skipped, "client fell behind, messages dropped");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// A message that is already waiting, without blocking.
  pub fn try_recv(&mut self) -> Option<ClientMessage> {
    loop {
      match self.rx.try_recv() {
        Ok(message) => return Some(message),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(_) => return None,
      }
    }
  }
}
