//! Request interception: routes each request to a caching strategy and owns
//! the partition lifecycle.

use color_eyre::Result;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

use crate::config::Config;
use crate::net::{Fetcher, Request, Response};
use crate::queue::{NoteQueue, SaveTarget};
use crate::sync::{SyncTrigger, TriggerSender};

use super::classify::{Classifier, RequestClass};
use super::layer::CacheLayer;
use super::storage::{CacheStorage, PartitionInfo};
use super::traits::{CacheResult, PartitionPurpose, PartitionSet};

/// Outcome of pre-caching the static manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub cached: usize,
  pub failed: usize,
}

/// Entry point for every outgoing request.
pub struct CacheManager<S: CacheStorage, F: Fetcher> {
  layer: CacheLayer<S, F>,
  partitions: PartitionSet,
  classifier: Classifier,
  origin: Url,
  static_manifest: Vec<String>,
  notes_path: String,
  queue: Arc<NoteQueue>,
  /// Present when deferred background sync is available
  triggers: Option<TriggerSender>,
}

impl<S: CacheStorage, F: Fetcher + 'static> CacheManager<S, F> {
  pub fn new(config: &Config, storage: Arc<S>, fetcher: Arc<F>, queue: Arc<NoteQueue>) -> Self {
    Self {
      layer: CacheLayer::new(storage, fetcher),
      partitions: PartitionSet::from_config(&config.cache),
      classifier: Classifier::new(config),
      origin: config.origin.clone(),
      static_manifest: config.cache.static_manifest.clone(),
      notes_path: config.backend.notes_path.clone(),
      queue,
      triggers: None,
    }
  }

  /// Register a sync trigger whenever a save is deferred.
  pub fn with_triggers(mut self, triggers: TriggerSender) -> Self {
    self.triggers = Some(triggers);
    self
  }

  /// Open the current partitions and pre-cache the static manifest.
  ///
  /// Each manifest entry is best-effort: a failure is logged and counted.
  pub async fn install(&self) -> Result<InstallReport> {
    for purpose in PartitionPurpose::ALL {
      self
        .layer
        .storage()
        .open_partition(self.partitions.name(purpose), purpose)?;
    }

    let mut report = InstallReport::default();
    for path in &self.static_manifest {
      let url = match self.origin.join(path) {
        Ok(url) => url,
        Err(e) => {
          tracing::warn!(path, "invalid manifest path: {}", e);
          report.failed += 1;
          continue;
        }
      };

      let request = Request::get(url);
      match self.layer.fetcher().fetch(&request).await {
        Ok(response) if response.is_success() => {
          self
            .layer
            .store(&self.partitions.static_assets, &request, &response);
          report.cached += 1;
        }
        Ok(response) => {
          tracing::warn!(url = %request.url, status = response.status, "manifest asset not cached");
          report.failed += 1;
        }
        Err(e) => {
          tracing::warn!(url = %request.url, "manifest asset not cached: {}", e);
          report.failed += 1;
        }
      }
    }

    tracing::info!(
      cached = report.cached,
      failed = report.failed,
      partition = %self.partitions.static_assets,
      "static manifest installed"
    );
    Ok(report)
  }

  /// Delete every partition that is not one of the three current ones.
  pub fn activate(&self) -> Result<Vec<String>> {
    let storage = self.layer.storage();
    let mut deleted = Vec::new();

    for partition in storage.partitions()? {
      if self.partitions.is_current(&partition.name) {
        continue;
      }
      if storage.delete_partition(&partition.name)? {
        tracing::info!(partition = %partition.name, "deleted stale partition");
        deleted.push(partition.name);
      }
    }

    Ok(deleted)
  }

  /// Every stored partition, paired with whether it is current.
  pub fn list_partitions(&self) -> Result<Vec<(PartitionInfo, bool)>> {
    Ok(
      self
        .layer
        .storage()
        .partitions()?
        .into_iter()
        .map(|p| {
          let current = self.partitions.is_current(&p.name);
          (p, current)
        })
        .collect(),
    )
  }

  /// Answer a request from cache, network, or a local fallback. Never fails.
  pub async fn handle(&self, request: &Request) -> CacheResult<Response> {
    let class = self.classifier.classify(request);
    tracing::debug!(?class, method = %request.method, url = %request.url, "intercepted");

    match class {
      RequestClass::StaticAsset if request.is_get() => {
        self
          .layer
          .cache_first(request, &self.partitions.static_assets)
          .await
      }
      RequestClass::Api if self.is_note_save(request) => self.save_note(request).await,
      RequestClass::Api if request.is_get() => {
        self
          .layer
          .network_first(request, &self.partitions.note_data)
          .await
      }
      RequestClass::Navigation => self.navigate(request).await,
      RequestClass::Other if request.is_get() => {
        self
          .layer
          .stale_while_revalidate(request, &self.partitions.dynamic)
          .await
      }
      _ => self.layer.network_only(request).await,
    }
  }

  /// Wait for background revalidations to finish.
  pub async fn settle(&self) {
    self.layer.settle().await;
  }

  fn is_note_save(&self, request: &Request) -> bool {
    matches!(request.method, Method::POST | Method::PUT | Method::PATCH)
      && request.url.path().starts_with(self.notes_path.as_str())
  }

  /// Network first; on failure the cached root document, then the offline page.
  async fn navigate(&self, request: &Request) -> CacheResult<Response> {
    let error = match self.layer.fetcher().fetch(request).await {
      Ok(response) => {
        self.layer.store(&self.partitions.dynamic, request, &response);
        return CacheResult::from_network(response);
      }
      Err(e) => e,
    };
    tracing::debug!(url = %request.url, "navigation offline: {}", error);

    if let Ok(root) = self.origin.join("/") {
      let root = Request::get(root);
      for partition in [&self.partitions.static_assets, &self.partitions.dynamic] {
        if let Some(cached) = self.layer.lookup(partition, &root) {
          return CacheResult::offline(cached.response, cached.cached_at);
        }
      }
    }

    CacheResult::synthetic(Response::offline_page())
  }

  /// Send a note save; if the network is unreachable, queue it and answer
  /// with an optimistic success.
  async fn save_note(&self, request: &Request) -> CacheResult<Response> {
    let error = match self.layer.fetcher().fetch(request).await {
      Ok(response) => return CacheResult::from_network(response),
      Err(e) => e,
    };
    tracing::debug!(url = %request.url, "note save offline: {}", error);

    let payload = request
      .body
      .as_deref()
      .and_then(|body| serde_json::from_slice::<Value>(body).ok());
    let Some(payload) = payload else {
      tracing::warn!(url = %request.url, "note save body is not JSON, cannot queue");
      return CacheResult::synthetic(Response::offline_unavailable());
    };

    if let Err(e) = self.queue.enqueue(payload, Some(SaveTarget::from_request(request))) {
      tracing::error!("offline queue unavailable, note not saved: {:#}", e);
      return CacheResult::synthetic(Response::offline_unavailable());
    }

    if let Some(triggers) = &self.triggers {
      triggers.register(SyncTrigger::NoteSync);
    }

    CacheResult::synthetic(Response::deferred_save())
  }
}
