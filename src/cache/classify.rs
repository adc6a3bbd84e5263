//! Request classification.

use crate::config::Config;
use crate::net::{Request, RequestMode};

/// Which caching policy a request falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  StaticAsset,
  Api,
  Navigation,
  Other,
}

/// Classification rules, derived from configuration.
#[derive(Debug, Clone)]
pub struct Classifier {
  static_dirs: Vec<String>,
  static_extensions: Vec<String>,
  api_prefixes: Vec<String>,
  backend_host: String,
}

impl Classifier {
  pub fn new(config: &Config) -> Self {
    Self {
      static_dirs: config.cache.static_dirs.clone(),
      static_extensions: config.cache.static_extensions.clone(),
      api_prefixes: config.backend.api_prefixes.clone(),
      backend_host: config.backend.host(),
    }
  }

  /// First matching rule wins: static, api, navigation, other.
  pub fn classify(&self, request: &Request) -> RequestClass {
    let path = request.url.path();
    let lower = path.to_ascii_lowercase();

    if self.static_dirs.iter().any(|dir| path.contains(dir.as_str()))
      || self
        .static_extensions
        .iter()
        .any(|ext| lower.ends_with(ext.as_str()))
    {
      return RequestClass::StaticAsset;
    }

    let backend_host = !self.backend_host.is_empty()
      && request
        .url
        .host_str()
        .is_some_and(|host| host.contains(&self.backend_host));
    if backend_host || self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      return RequestClass::Api;
    }

    let accepts_html = request
      .header("Accept")
      .is_some_and(|accept| accept.contains("text/html"));
    if request.mode == RequestMode::Navigate || (request.is_get() && accepts_html) {
      return RequestClass::Navigation;
    }

    RequestClass::Other
  }
}
