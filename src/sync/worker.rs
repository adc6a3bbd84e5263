//! Background execution of sync triggers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::net::{Fetcher, Request};

use super::manager::SyncManager;
use super::trigger::SyncTrigger;

/// Registers deferred sync work with a running [`SyncWorker`].
#[derive(Clone)]
pub struct TriggerSender {
  tx: mpsc::UnboundedSender<SyncTrigger>,
}

impl TriggerSender {
  /// Queue a trigger. Returns false if the worker has stopped.
  pub fn register(&self, trigger: SyncTrigger) -> bool {
    match self.tx.send(trigger) {
      Ok(()) => {
        tracing::debug!(%trigger, "sync registered");
        true
      }
      Err(_) => {
        tracing::debug!(%trigger, "sync worker stopped, trigger dropped");
        false
      }
    }
  }
}

/// Consumes triggers and runs the sync manager for each.
pub struct SyncWorker;

impl SyncWorker {
  /// Start the worker. It stops once every [`TriggerSender`] is dropped.
  pub fn spawn<F: Fetcher + 'static>(manager: Arc<SyncManager<F>>) -> (TriggerSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
      while let Some(first) = rx.recv().await {
        // Registrations of a tag that is already pending collapse into one run
        let mut batch = vec![first];
        while let Ok(trigger) = rx.try_recv() {
          if !batch.contains(&trigger) {
            batch.push(trigger);
          }
        }

        for trigger in batch {
          manager.handle(trigger).await;
        }
      }
      tracing::debug!("sync worker stopped");
    });

    (TriggerSender { tx }, handle)
  }
}

/// Tracks probe results to spot offline→online transitions.
#[derive(Debug, Default)]
pub struct ConnectivityState {
  online: Option<bool>,
}

impl ConnectivityState {
  /// Record a probe result. True when this observation is a reconnect.
  pub fn observe(&mut self, online: bool) -> bool {
    let restored = self.online == Some(false) && online;
    self.online = Some(online);
    restored
  }

  pub fn is_online(&self) -> bool {
    self.online == Some(true)
  }
}

/// Probes the network and raises connectivity and scheduled sync triggers.
pub struct ConnectivityMonitor<F: Fetcher> {
  fetcher: Arc<F>,
  probe_url: Url,
  probe_interval: Duration,
  sync_interval: Duration,
  triggers: TriggerSender,
}

impl<F: Fetcher + 'static> ConnectivityMonitor<F> {
  pub fn new(
    fetcher: Arc<F>,
    probe_url: Url,
    probe_interval: Duration,
    sync_interval: Duration,
    triggers: TriggerSender,
  ) -> Self {
    Self {
      fetcher,
      probe_url,
      probe_interval,
      sync_interval,
      triggers,
    }
  }

  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(self.run())
  }

  async fn run(self) {
    let mut probe_tick = tokio::time::interval(self.probe_interval);
    let mut sync_tick = tokio::time::interval(self.sync_interval);
    // The first tick completes immediately
    sync_tick.tick().await;

    let mut state = ConnectivityState::default();

    loop {
      let registered = tokio::select! {
        _ = probe_tick.tick() => {
          let online = self.probe().await;
          if state.observe(online) {
            tracing::info!("connectivity restored");
            self.triggers.register(SyncTrigger::ConnectivityRestored)
          } else {
            true
          }
        }
        _ = sync_tick.tick() => {
          if state.is_online() {
            self.triggers.register(SyncTrigger::NoteSync)
          } else {
            true
          }
        }
      };

      if !registered {
        break;
      }
    }
    tracing::debug!("connectivity monitor stopped");
  }

  /// Any response counts as online; only a transport failure is offline.
  async fn probe(&self) -> bool {
    let request = Request::get(self.probe_url.clone());
    match self.fetcher.fetch(&request).await {
      Ok(_) => true,
      Err(e) => {
        tracing::debug!(url = %self.probe_url, "probe failed: {}", e);
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::mock::MockFetcher;
  use crate::net::Response;
  use crate::notify::{ClientChannel, ClientMessage};
  use crate::queue::NoteQueue;
  use serde_json::json;

  const ENDPOINT: &str = "https://abc.supabase.co/rest/v1/notes";

  #[test]
  fn test_first_observation_is_not_a_transition() {
    let mut state = ConnectivityState::default();
    assert!(!state.observe(true));
    assert!(state.is_online());

    let mut state = ConnectivityState::default();
    assert!(!state.observe(false));
    assert!(!state.is_online());
  }

  #[test]
  fn test_reconnect_is_reported_once() {
    let mut state = ConnectivityState::default();
    state.observe(true);
    assert!(!state.observe(false));
    assert!(state.observe(true));
    assert!(!state.observe(true));
  }

  #[tokio::test]
  async fn test_worker_runs_registered_triggers() {
    let queue = Arc::new(NoteQueue::in_memory());
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.route(ENDPOINT, Response::new(201));
    let clients = ClientChannel::new();
    let mut tab = clients.subscribe();
    let manager = Arc::new(SyncManager::new(
      Arc::clone(&queue),
      Arc::clone(&fetcher),
      Url::parse(ENDPOINT).unwrap(),
      clients,
    ));
    queue.enqueue(json!({ "id": "n1" }), None).unwrap();

    let (triggers, handle) = SyncWorker::spawn(manager);
    assert!(triggers.register(SyncTrigger::NoteSync));
    drop(triggers);
    handle.await.unwrap();

    assert_eq!(queue.count_unsynced().unwrap(), 0);
    assert_eq!(fetcher.calls_to(ENDPOINT), 1);
    assert_eq!(tab.try_recv(), Some(ClientMessage::SyncCompleted { count: 1 }));
  }

  #[tokio::test]
  async fn test_register_after_worker_stops() {
    let manager = Arc::new(SyncManager::new(
      Arc::new(NoteQueue::in_memory()),
      Arc::new(MockFetcher::new()),
      Url::parse(ENDPOINT).unwrap(),
      ClientChannel::new(),
    ));
    let (triggers, handle) = SyncWorker::spawn(manager);
    handle.abort();
    let _ = handle.await;

    assert!(!triggers.register(SyncTrigger::NoteSync));
  }

  const PROBE: &str = "https://notes.example.com/";

  struct Running {
    queue: Arc<NoteQueue>,
    fetcher: Arc<MockFetcher>,
    tab: crate::notify::ClientHandle,
    triggers: TriggerSender,
    worker: JoinHandle<()>,
    monitor: JoinHandle<()>,
  }

  fn start_monitor(online: bool) -> Running {
    let queue = Arc::new(NoteQueue::in_memory());
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.route(ENDPOINT, Response::new(201));
    fetcher.set_online(online);
    let clients = ClientChannel::new();
    let tab = clients.subscribe();
    let manager = Arc::new(SyncManager::new(
      Arc::clone(&queue),
      Arc::clone(&fetcher),
      Url::parse(ENDPOINT).unwrap(),
      clients,
    ));

    let (triggers, worker) = SyncWorker::spawn(manager);
    let monitor = ConnectivityMonitor::new(
      Arc::clone(&fetcher),
      Url::parse(PROBE).unwrap(),
      Duration::from_secs(10),
      Duration::from_secs(60),
      triggers.clone(),
    )
    .spawn();

    Running {
      queue,
      fetcher,
      tab,
      triggers,
      worker,
      monitor,
    }
  }

  async fn stop(running: Running) {
    running.monitor.abort();
    let _ = running.monitor.await;
    drop(running.triggers);
    running.worker.await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_notifies_clients_then_syncs() {
    let mut r = start_monitor(false);
    r.queue.enqueue(json!({ "id": "n1" }), None).unwrap();

    // First probe sees the outage
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(r.fetcher.calls_to(PROBE), 1);
    assert_eq!(r.tab.try_recv(), None);

    r.fetcher.set_online(true);
    let first = tokio::time::timeout(Duration::from_secs(30), r.tab.recv())
      .await
      .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(30), r.tab.recv())
      .await
      .unwrap();

    assert!(matches!(
      first,
      Some(ClientMessage::ConnectivityRestored { .. })
    ));
    assert_eq!(second, Some(ClientMessage::SyncCompleted { count: 1 }));
    assert_eq!(r.queue.count_unsynced().unwrap(), 0);
    stop(r).await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_scheduled_sync_waits_for_connectivity() {
    let mut r = start_monitor(false);
    r.queue.enqueue(json!({ "id": "n1" }), None).unwrap();

    // Past the sync interval while still offline
    tokio::time::sleep(Duration::from_secs(65)).await;
    assert_eq!(r.fetcher.calls_to(ENDPOINT), 0);
    assert_eq!(r.tab.try_recv(), None);
    assert_eq!(r.queue.count_unsynced().unwrap(), 1);
    stop(r).await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_scheduled_sync_runs_while_online() {
    let mut r = start_monitor(true);
    let start = tokio::time::Instant::now();

    // Online from the first probe, so no reconnect is ever reported
    tokio::time::sleep(Duration::from_secs(1)).await;
    r.queue.enqueue(json!({ "id": "n1" }), None).unwrap();

    let message = tokio::time::timeout(Duration::from_secs(120), r.tab.recv())
      .await
      .unwrap();

    assert_eq!(message, Some(ClientMessage::SyncCompleted { count: 1 }));
    assert!(start.elapsed() >= Duration::from_secs(60));
    assert_eq!(r.fetcher.calls_to(ENDPOINT), 1);
    stop(r).await;
  }
}
