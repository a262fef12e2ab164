//! The network side of the agent: request/response snapshots and the fetch seam.

mod client;
#[cfg(test)]
pub mod scripted;
mod types;

pub use client::{Fetch, HttpFetcher};
pub use types::{Request, RequestMode, Response};
