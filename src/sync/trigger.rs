use std::fmt;
use std::str::FromStr;

use color_eyre::eyre::{eyre, Report};

/// Deferred work requested of the sync manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  /// Replay queued note saves
  NoteSync,
  /// Connectivity came back: tell clients, then replay
  ConnectivityRestored,
}

impl SyncTrigger {
  pub fn tag(self) -> &'static str {
    match self {
      Self::NoteSync => "sync-notes",
      Self::ConnectivityRestored => "connectivity-restored",
    }
  }
}

impl fmt::Display for SyncTrigger {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.tag())
  }
}

impl FromStr for SyncTrigger {
  type Err = Report;

  fn from_str(tag: &str) -> Result<Self, Self::Err> {
    match tag {
      "sync-notes" => Ok(Self::NoteSync),
      "connectivity-restored" => Ok(Self::ConnectivityRestored),
      other => Err(eyre!("Unknown sync trigger tag: {}", other)),
    }
  }
}
