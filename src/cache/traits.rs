//! Core types for the caching system.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::config::CacheConfig;

/// What a partition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionPurpose {
  /// App shell and assets fetched on install
  Static,
  /// Pages and other responses cached as they are seen
  Dynamic,
  /// Backend note reads
  NoteData,
}

impl PartitionPurpose {
  pub const ALL: [PartitionPurpose; 3] = [Self::Static, Self::Dynamic, Self::NoteData];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::NoteData => "note-data",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|p| p.as_str() == s)
  }
}

impl fmt::Display for PartitionPurpose {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The three partition names current for one version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSet {
  pub static_assets: String,
  pub dynamic: String,
  pub note_data: String,
}

impl PartitionSet {
  pub fn new(prefix: &str, version: &str) -> Self {
    let name = |purpose: PartitionPurpose| format!("{}-{}-{}", prefix, purpose, version);
    Self {
      static_assets: name(PartitionPurpose::Static),
      dynamic: name(PartitionPurpose::Dynamic),
      note_data: name(PartitionPurpose::NoteData),
    }
  }

  pub fn from_config(config: &CacheConfig) -> Self {
    Self::new(&config.prefix, &config.version)
  }

  pub fn name(&self, purpose: PartitionPurpose) -> &str {
    match purpose {
      PartitionPurpose::Static => &self.static_assets,
      PartitionPurpose::Dynamic => &self.dynamic,
      PartitionPurpose::NoteData => &self.note_data,
    }
  }

  pub fn is_current(&self, name: &str) -> bool {
    PartitionPurpose::ALL
      .into_iter()
      .any(|purpose| self.name(purpose) == name)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, revalidating: bool) -> Self {
    Self {
      data,
      source: if revalidating {
        CacheSource::CacheRevalidating
      } else {
        CacheSource::Cache
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Neither network nor cache could answer; `data` was generated locally.
  pub fn synthetic(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthetic,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from cache without touching the network
  Cache,
  /// Served from cache while a background refresh runs
  CacheRevalidating,
  /// Network unavailable, serving cached data
  Offline,
  /// Generated fallback
  Synthetic,
}
