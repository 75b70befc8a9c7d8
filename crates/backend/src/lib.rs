#![deny(missing_docs)]
//! The rdsys backend: the distribution side of a censorship-resistance
//! bridge directory.
//!
//! The backend ingests bridge descriptors, partitions the resulting
//! resources across the configured distributors, keeps their test state
//! current through external reachability and bandwidth probers, and
//! streams incremental resource diffs to subscribed distributors over
//! HTTP.

mod config;
pub use config::*;

mod metrics;
pub use metrics::*;

mod blocklist;
pub use blocklist::*;

mod test_pool;
pub use test_pool::*;

pub mod kraken;

mod http;
pub use http::*;

mod server;
pub use server::*;
