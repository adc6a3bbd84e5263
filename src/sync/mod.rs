//! Background synchronization of queued note saves.
//!
//! - `SyncTrigger`: the kinds of deferred work
//! - `SyncManager`: drains the offline queue against the note endpoint
//! - `SyncWorker` / `ConnectivityMonitor`: run triggers in the background

mod manager;
mod trigger;
mod worker;

pub use manager::SyncManager;
pub use trigger::SyncTrigger;
pub use worker::{ConnectivityMonitor, SyncWorker, TriggerSender};
