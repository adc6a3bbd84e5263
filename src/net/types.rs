//! Request and response values that flow through the interceptor.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use url::Url;

/// Body sent to callers when a note save was queued instead of delivered.
pub const DEFERRED_SAVE_MESSAGE: &str = "Note saved offline, will sync when online";

const OFFLINE_PAGE: &str = "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>Your notes are safe and will sync when the connection returns.</p></body></html>\n";

/// How the request was issued by the page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Ordinary script-initiated request
  #[default]
  Cors,
  /// Top-level page navigation
  Navigate,
}

/// An outgoing request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      mode: RequestMode::Cors,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A page navigation accepting HTML.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
    .with_header("Accept", "text/html")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_json(self, value: &Value) -> Self {
    self
      .with_header("Content-Type", "application/json")
      .with_body(value.to_string().into_bytes())
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }

  /// Stable lookup key for the cache: hex SHA-256 of method and URL, fragment removed.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);

    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response, either from the network, from a cache partition, or synthesized offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  pub fn json(status: u16, value: &Value) -> Self {
    Self::new(status)
      .with_header("Content-Type", "application/json")
      .with_body(value.to_string())
  }

  /// 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// 503 returned by read strategies when neither network nor cache can answer.
  pub fn offline_unavailable() -> Self {
    Self::json(
      503,
      &json!({ "error": "Network unavailable", "offline": true }),
    )
  }

  /// Plain 503 used for static assets missing from the cache.
  pub fn offline_text() -> Self {
    Self::new(503)
      .with_header("Content-Type", "text/plain")
      .with_body("Offline")
  }

  /// Last-resort page for navigations.
  pub fn offline_page() -> Self {
    Self::new(503)
      .with_header("Content-Type", "text/html; charset=utf-8")
      .with_body(OFFLINE_PAGE)
  }

  /// Optimistic success returned when a note save was queued.
  pub fn deferred_save() -> Self {
    Self::json(
      200,
      &json!({ "success": true, "offline": true, "message": DEFERRED_SAVE_MESSAGE }),
    )
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}
