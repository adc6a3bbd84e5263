//! Replays the offline queue against the note endpoint.

use chrono::Utc;
use color_eyre::Result;
use reqwest::Method;
use std::sync::Arc;
use url::Url;

use crate::net::{Fetcher, Request};
use crate::notify::{ClientChannel, ClientMessage};
use crate::queue::{NoteQueue, QueuedNote};

use super::trigger::SyncTrigger;

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  pub attempted: usize,
  pub synced: usize,
  pub failed: usize,
}

/// Drains the offline queue and reports to clients.
///
/// Replays carry no idempotency key: two drains running at once can both
/// submit the same unsynced entry.
pub struct SyncManager<F: Fetcher> {
  queue: Arc<NoteQueue>,
  fetcher: Arc<F>,
  endpoint: Url,
  clients: ClientChannel,
}

impl<F: Fetcher> SyncManager<F> {
  pub fn new(queue: Arc<NoteQueue>, fetcher: Arc<F>, endpoint: Url, clients: ClientChannel) -> Self {
    Self {
      queue,
      fetcher,
      endpoint,
      clients,
    }
  }

  /// Run a trigger to completion. Failures are logged, never returned;
  /// the queue is left for the next trigger.
  pub async fn handle(&self, trigger: SyncTrigger) -> Option<SyncReport> {
    tracing::debug!(%trigger, "sync triggered");

    match trigger {
      SyncTrigger::NoteSync => {}
      SyncTrigger::ConnectivityRestored => {
        self.clients.post(ClientMessage::ConnectivityRestored {
          timestamp: Utc::now().timestamp_millis(),
        });
      }
    }

    match self.drain().await {
      Ok(report) => Some(report),
      Err(e) => {
        tracing::error!(%trigger, "sync failed: {:#}", e);
        None
      }
    }
  }

  /// Replay every unsynced entry in enqueue order, one at a time.
  ///
  /// A failed entry stays queued and does not stop the pass.
  pub async fn drain(&self) -> Result<SyncReport> {
    let entries = self.queue.unsynced()?;
    let mut report = SyncReport::default();

    for mut entry in entries {
      report.attempted += 1;

      if !self.replay(&entry).await {
        report.failed += 1;
        continue;
      }

      match self.queue.mark_synced(&mut entry) {
        Ok(()) => report.synced += 1,
        Err(e) => {
          // Delivered but still flagged unsynced; the next pass resubmits it
          tracing::warn!(entry = entry.id, "replayed but not marked synced: {}", e);
          report.failed += 1;
        }
      }
    }

    if report.synced > 0 {
      self.clients.post(ClientMessage::SyncCompleted {
        count: report.synced,
      });
    }

    if report.attempted > 0 {
      tracing::info!(
        attempted = report.attempted,
        synced = report.synced,
        failed = report.failed,
        "offline queue drained"
      );
    }

    Ok(report)
  }

  /// The save as the page issued it, or a POST to the endpoint when the
  /// entry carries no target.
  fn replay_request(&self, entry: &QueuedNote) -> Request {
    let Some(target) = &entry.target else {
      return Request::new(Method::POST, self.endpoint.clone()).with_json(&entry.payload);
    };

    let mut request = Request::new(target.method.clone(), target.url.clone());
    request.headers = target.headers.clone();
    if request.header("Content-Type").is_none() {
      request = request.with_header("Content-Type", "application/json");
    }
    request.with_body(entry.payload.to_string().into_bytes())
  }

  async fn replay(&self, entry: &QueuedNote) -> bool {
    let request = self.replay_request(entry);

    match self.fetcher.fetch(&request).await {
      Ok(response) if response.is_success() => true,
      Ok(response) => {
        tracing::warn!(entry = entry.id, status = response.status, "replay rejected");
        false
      }
      Err(e) => {
        tracing::debug!(entry = entry.id, "replay failed: {}", e);
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
  use crate::queue::SaveTarget;
  use serde_json::json;

  const ENDPOINT: &str = "https://abc.supabase.co/rest/v1/notes";

  struct Fixture {
    queue: Arc<NoteQueue>,
    fetcher: Arc<MockFetcher>,
    clients: ClientChannel,
    manager: SyncManager<MockFetcher>,
  }

  fn fixture() -> Fixture {
    let queue = Arc::new(NoteQueue::in_memory());
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.route(ENDPOINT, Response::new(201));
    let clients = ClientChannel::new();
    let manager = SyncManager::new(
      Arc::clone(&queue),
      Arc::clone(&fetcher),
      Url::parse(ENDPOINT).unwrap(),
      clients.clone(),
    );
    Fixture {
      queue,
      fetcher,
      clients,
      manager,
    }
  }

  #[tokio::test]
  async fn test_drain_replays_in_order_and_marks_synced() {
    let f = fixture();
    f.queue.enqueue(json!({ "id": "n1", "content": "one" }), None).unwrap();
    f.queue.enqueue(json!({ "id": "n1", "content": "two" }), None).unwrap();

    let report = f.manager.drain().await.unwrap();

    assert_eq!(
      report,
      SyncReport {
        attempted: 2,
        synced: 2,
        failed: 0
      }
    );
    let bodies: Vec<serde_json::Value> = f
      .fetcher
      .calls()
      .iter()
      .map(|r| serde_json::from_slice(r.body.as_deref().unwrap()).unwrap())
      .collect();
    assert_eq!(bodies[0]["content"], "one");
    assert_eq!(bodies[1]["content"], "two");
    assert!(f.fetcher.calls().iter().all(|r| r.method == Method::POST));
    assert_eq!(f.queue.count_unsynced().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_replay_reissues_the_original_save() {
    let f = fixture();
    let target = SaveTarget {
      method: Method::PUT,
      url: Url::parse("https://abc.supabase.co/rest/v1/notes?id=eq.9").unwrap(),
      headers: vec![("Prefer".to_string(), "resolution=merge-duplicates".to_string())],
    };
    f.queue
      .enqueue(json!({ "id": 9, "content": "edited" }), Some(target.clone()))
      .unwrap();

    let report = f.manager.drain().await.unwrap();
    // Unrouted URL answers 404, which leaves the entry queued
    assert_eq!(report.failed, 1);

    let call = f.fetcher.calls().pop().unwrap();
    assert_eq!(call.method, Method::PUT);
    assert_eq!(call.url, target.url);
    assert_eq!(call.header("Prefer"), Some("resolution=merge-duplicates"));
    assert_eq!(call.header("Content-Type"), Some("application/json"));
    let body: serde_json::Value = serde_json::from_slice(call.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["content"], "edited");
    assert_eq!(f.fetcher.calls_to(ENDPOINT), 0);
  }

  #[tokio::test]
  async fn test_partial_failure_does_not_stop_the_pass() {
    let f = fixture();
    f.queue.enqueue(json!({ "id": "n1" }), None).unwrap();
    f.queue.enqueue(json!({ "id": "n2" }), None).unwrap();
    f.queue.enqueue(json!({ "id": "n3" }), None).unwrap();
    f.fetcher.reject_when(|r| {
      r.body
        .as_deref()
        .is_some_and(|b| String::from_utf8_lossy(b).contains("\"n2\""))
    });

    let report = f.manager.drain().await.unwrap();

    assert_eq!(report.attempted, 3);
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(f.fetcher.calls_to(ENDPOINT), 3);

    let all = f.queue.all().unwrap();
    let synced: Vec<bool> = all.iter().map(|e| e.synced).collect();
    assert_eq!(synced, vec![true, false, true]);
  }

  #[tokio::test]
  async fn test_rejected_status_leaves_entry_queued() {
    let f = fixture();
    f.fetcher.route(ENDPOINT, Response::new(500));
    f.queue.enqueue(json!({ "id": "n1" }), None).unwrap();

    let report = f.manager.drain().await.unwrap();

    assert_eq!(report.synced, 0);
    assert_eq!(f.queue.count_unsynced().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_sync_completed_sent_once_to_every_client() {
    let f = fixture();
    let mut tab_a = f.clients.subscribe();
    let mut tab_b = f.clients.subscribe();
    f.queue.enqueue(json!({ "id": "n1" }), None).unwrap();
    f.queue.enqueue(json!({ "id": "n2" }), None).unwrap();

    f.manager.handle(SyncTrigger::NoteSync).await.unwrap();

    for tab in [&mut tab_a, &mut tab_b] {
      assert_eq!(tab.try_recv(), Some(ClientMessage::SyncCompleted { count: 2 }));
      assert_eq!(tab.try_recv(), None);
    }
  }

  #[tokio::test]
  async fn test_nothing_synced_sends_nothing() {
    let f = fixture();
    let mut tab = f.clients.subscribe();
    f.queue.enqueue(json!({ "id": "n1" }), None).unwrap();
    f.fetcher.set_online(false);

    let report = f.manager.handle(SyncTrigger::NoteSync).await.unwrap();

    assert_eq!(report.synced, 0);
    assert_eq!(tab.try_recv(), None);
  }

  #[tokio::test]
  async fn test_connectivity_restored_notifies_then_drains() {
    let f = fixture();
    let mut tab = f.clients.subscribe();
    f.queue.enqueue(json!({ "id": "n1" }), None).unwrap();

    let report = f
      .manager
      .handle(SyncTrigger::ConnectivityRestored)
      .await
      .unwrap();

    assert_eq!(report.synced, 1);
    assert!(matches!(
      tab.try_recv(),
      Some(ClientMessage::ConnectivityRestored { timestamp }) if timestamp > 0
    ));
    assert_eq!(tab.try_recv(), Some(ClientMessage::SyncCompleted { count: 1 }));
  }

  #[tokio::test]
  async fn test_store_failure_is_logged_not_raised() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"file").unwrap();

    let manager = SyncManager::new(
      Arc::new(NoteQueue::new(blocker.join("offline.db"))),
      Arc::new(MockFetcher::new()),
      Url::parse(ENDPOINT).unwrap(),
      ClientChannel::new(),
    );

    assert!(manager.drain().await.is_err());
    assert_eq!(manager.handle(SyncTrigger::NoteSync).await, None);
  }
}
