//! Cache layer that orchestrates caching strategies with network fetching.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::net::{Fetcher, Request, Response};

use super::storage::{CacheStorage, CachedResponse};
use super::traits::CacheResult;

/// Applies read strategies over a storage backend and a network client.
///
/// No strategy returns an error: storage failures are logged and treated as
/// misses, network failures fall back to cache or a synthetic response.
pub struct CacheLayer<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  /// Background refreshes started by stale-while-revalidate
  revalidations: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage, F: Fetcher + 'static> CacheLayer<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>) -> Self {
    Self {
      storage,
      fetcher,
      revalidations: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn fetcher(&self) -> &Arc<F> {
    &self.fetcher
  }

  /// Read a cached response; storage errors count as a miss.
  pub fn lookup(&self, partition: &str, request: &Request) -> Option<CachedResponse> {
    match self.storage.get(partition, &request.cache_key()) {
      Ok(hit) => hit,
      Err(e) => {
        tracing::warn!(partition, url = %request.url, "cache read failed: {}", e);
        None
      }
    }
  }

  /// Store a 2xx GET response; anything else is skipped.
  pub fn store(&self, partition: &str, request: &Request, response: &Response) {
    store_response(self.storage.as_ref(), partition, request, response);
  }

  /// Fetch from the network, caching successful GET responses in `partition`.
  async fn fetch_and_store(&self, request: &Request, partition: &str) -> color_eyre::Result<Response> {
    let response = self.fetcher.fetch(request).await?;
    self.store(partition, request, &response);
    Ok(response)
  }

  /// Cache-first strategy.
  ///
  /// 1. Cached response → return it without touching the network
  /// 2. Otherwise fetch, store a 2xx response, return it
  /// 3. Network failure with nothing cached → synthetic 503
  pub async fn cache_first(&self, request: &Request, partition: &str) -> CacheResult<Response> {
    if let Some(cached) = self.lookup(partition, request) {
      return CacheResult::from_cache(cached.response, cached.cached_at, false);
    }

    match self.fetch_and_store(request, partition).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        tracing::debug!(url = %request.url, "cache-first miss while offline: {}", e);
        CacheResult::synthetic(Response::offline_text())
      }
    }
  }

  /// Network-first strategy.
  ///
  /// 1. Fetch; store a 2xx response and return it
  /// 2. Network failure → cached response (offline mode)
  /// 3. Nothing cached → synthetic 503 JSON
  pub async fn network_first(&self, request: &Request, partition: &str) -> CacheResult<Response> {
    match self.fetch_and_store(request, partition).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        tracing::debug!(url = %request.url, "network-first falling back to cache: {}", e);
        match self.lookup(partition, request) {
          Some(cached) => CacheResult::offline(cached.response, cached.cached_at),
          None => CacheResult::synthetic(Response::offline_unavailable()),
        }
      }
    }
  }

  /// Stale-while-revalidate strategy.
  ///
  /// A cached response is returned immediately while a background fetch
  /// refreshes the entry for next time. Without a cached response the
  /// network fetch is awaited.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    partition: &str,
  ) -> CacheResult<Response> {
    if let Some(cached) = self.lookup(partition, request) {
      self.revalidate(request.clone(), partition.to_string()).await;
      return CacheResult::from_cache(cached.response, cached.cached_at, true);
    }

    match self.fetch_and_store(request, partition).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        tracing::debug!(url = %request.url, "revalidate miss while offline: {}", e);
        CacheResult::synthetic(Response::offline_unavailable())
      }
    }
  }

  /// Pass straight to the network; failures become the synthetic 503 JSON.
  pub async fn network_only(&self, request: &Request) -> CacheResult<Response> {
    match self.fetcher.fetch(request).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        tracing::debug!(method = %request.method, url = %request.url, "network-only request failed: {}", e);
        CacheResult::synthetic(Response::offline_unavailable())
      }
    }
  }

  async fn revalidate(&self, request: Request, partition: String) {
    let storage = Arc::clone(&self.storage);
    let fetcher = Arc::clone(&self.fetcher);

    let mut revalidations = self.revalidations.lock().await;
    // Reap finished refreshes so a long-lived layer does not accumulate them
    while let Some(result) = revalidations.try_join_next() {
      if let Err(e) = result {
        tracing::warn!("revalidation task failed: {}", e);
      }
    }

    revalidations.spawn(async move {
      match fetcher.fetch(&request).await {
        Ok(response) => store_response(storage.as_ref(), &partition, &request, &response),
        // Keep serving the stale entry
        Err(e) => tracing::debug!(url = %request.url, "background revalidation failed: {}", e),
      }
    });
  }

  /// Wait for every background revalidation started so far.
  pub async fn settle(&self) {
    // Joined outside the lock so new revalidations are not held up
    let mut revalidations = std::mem::take(&mut *self.revalidations.lock().await);
    while let Some(result) = revalidations.join_next().await {
      if let Err(e) = result {
        tracing::warn!("revalidation task failed: {}", e);
      }
    }
  }
}

#[cfg(test)]
impl<S: CacheStorage, F: Fetcher> CacheLayer<S, F> {
  async fn pending_revalidations(&self) -> usize {
    self.revalidations.lock().await.len()
  }
}

fn store_response<S: CacheStorage>(storage: &S, partition: &str, request: &Request, response: &Response) {
  if !request.is_get() || !response.is_success() {
    return;
  }
  if let Err(e) = storage.put(partition, &request.cache_key(), request.url.as_str(), response) {
    tracing::warn!(partition, url = %request.url, "cache write failed: {}", e);
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for CacheLayer<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      revalidations: Arc::clone(&self.revalidations),
    }
  }
}
