//! Scriptable fetcher for tests.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::client::Fetcher;
use super::types::{Request, Response};

type Rejection = Box<dyn Fn(&Request) -> bool + Send + Sync>;

/// In-memory network: fixed routes, an online switch, per-request failures,
/// and a log of every call that reached it.
pub struct MockFetcher {
  online: AtomicBool,
  routes: Mutex<HashMap<String, Response>>,
  rejections: Mutex<Vec<Rejection>>,
  calls: Mutex<Vec<Request>>,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      routes: Mutex::new(HashMap::new()),
      rejections: Mutex::new(Vec::new()),
      calls: Mutex::new(Vec::new()),
    }
  }

  pub fn route(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Fail any request matching `predicate` with a network error.
  pub fn reject_when(&self, predicate: impl Fn(&Request) -> bool + Send + Sync + 'static) {
    self.rejections.lock().unwrap().push(Box::new(predicate));
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub fn calls_to(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }

  fn respond(&self, request: &Request) -> Result<Response> {
    self.calls.lock().unwrap().push(request.clone());

    if !self.online.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable"));
    }
    if self.rejections.lock().unwrap().iter().any(|reject| reject(request)) {
      return Err(eyre!("connection reset"));
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(request.url.as_str())
        .cloned()
        .unwrap_or_else(|| Response::new(404)),
    )
  }
}

impl Fetcher for MockFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    async move { self.respond(request) }.boxed()
  }
}
