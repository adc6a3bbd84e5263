//! Network seam: request/response values and the fetcher trait.

mod client;
#[cfg(test)]
pub mod mock;
mod types;

pub use client::{Fetcher, HttpFetcher};
pub use types::{Request, RequestMode, Response};
