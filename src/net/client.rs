use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;

use crate::config::Config;

use super::types::{Request, Response};

/// Anything that can put a request on the wire.
///
/// An `Err` means the request never produced a response (offline, DNS, reset).
/// HTTP error statuses come back as `Ok` responses.
pub trait Fetcher: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>>;
}

/// Network client backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  backend_host: String,
  api_key: Option<String>,
}

impl HttpFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    let mut builder = reqwest::Client::builder().user_agent(concat!("notesync/", env!("CARGO_PKG_VERSION")));
    if let Some(secs) = config.network.timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      backend_host: config.backend.host(),
      api_key: Config::get_api_key(),
    })
  }

  /// The backend host itself or one of its subdomains. Credentials never go
  /// to a host that merely contains the backend name.
  fn is_backend_host(&self, host: &str) -> bool {
    let backend = self.backend_host.trim_start_matches('.').to_ascii_lowercase();
    if backend.is_empty() {
      return false;
    }
    let host = host.to_ascii_lowercase();
    host == backend || host.ends_with(&format!(".{}", backend))
  }

  /// Backend requests carry the project API key unless the caller set auth already.
  fn auth_headers(&self, request: &Request) -> Vec<(String, String)> {
    let Some(key) = &self.api_key else {
      return Vec::new();
    };
    if !request.url.host_str().is_some_and(|host| self.is_backend_host(host)) {
      return Vec::new();
    }

    let mut headers = Vec::new();
    if request.header("apikey").is_none() {
      headers.push(("apikey".to_string(), key.clone()));
    }
    if request.header("Authorization").is_none() {
      headers.push(("Authorization".to_string(), format!("Bearer {}", key)));
    }
    headers
  }

  async fn send(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in request.headers.iter().chain(self.auth_headers(request).iter()) {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    async move {
      tracing::debug!(method = %request.method, url = %request.url, "fetch");
      self.send(request).await
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn fetcher(backend_host: &str) -> HttpFetcher {
    HttpFetcher {
      client: reqwest::Client::new(),
      backend_host: backend_host.to_string(),
      api_key: Some("SECRET".to_string()),
    }
  }

  fn auth_for(fetcher: &HttpFetcher, url: &str) -> Vec<(String, String)> {
    fetcher.auth_headers(&Request::get(Url::parse(url).unwrap()))
  }

  #[test]
  fn test_backend_requests_carry_api_key() {
    let f = fetcher("abc.supabase.co");
    let headers = auth_for(&f, "https://abc.supabase.co/rest/v1/notes");
    assert_eq!(
      headers,
      vec![
        ("apikey".to_string(), "SECRET".to_string()),
        ("Authorization".to_string(), "Bearer SECRET".to_string()),
      ]
    );
  }

  #[test]
  fn test_subdomain_of_configured_host_carries_api_key() {
    let f = fetcher("supabase.co");
    assert_eq!(auth_for(&f, "https://abc.supabase.co/rest/v1/notes").len(), 2);
    assert_eq!(auth_for(&f, "https://supabase.co/").len(), 2);
  }

  #[test]
  fn test_lookalike_hosts_get_no_credentials() {
    let f = fetcher("abc.supabase.co");
    assert!(auth_for(&f, "https://abc.supabase.co.evil.example/steal").is_empty());
    assert!(auth_for(&f, "https://xabc.supabase.co/").is_empty());
    assert!(auth_for(&f, "https://notes.example.com/").is_empty());
  }

  #[test]
  fn test_caller_auth_is_not_overridden() {
    let f = fetcher("abc.supabase.co");
    let request = Request::get(Url::parse("https://abc.supabase.co/rest/v1/notes").unwrap())
      .with_header("Authorization", "Bearer user-token");
    let headers = f.auth_headers(&request);
    assert_eq!(headers, vec![("apikey".to_string(), "SECRET".to_string())]);
  }
}
