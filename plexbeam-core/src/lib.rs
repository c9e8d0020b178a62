//! # plexbeam-core
//!
//! The working interior of the plexbeam cartridge: the binary a media server
//! believes is its transcoder. One invocation parses the intercepted argv,
//! spreads the encode across remote GPU workers (or rewrites it for the
//! local GPU when none respond), progressively aggregates the produced DASH
//! segments into the directory the media server watches, and keeps the
//! session alive with forged progress telemetry.
//!
//! Component map:
//!
//! - [`invocation`]: argv parsing and dialect normalization
//! - [`pool`]: worker pool spec, health probing, encoder ranking
//! - [`client`]: typed HTTP client for the worker and pull-proxy contracts
//! - [`beam`]: copy-remux child processes and chunked upload tasks
//! - [`aggregate`]: segment classification, renumbering, manifest gating
//! - [`progress`]: stderr telemetry and progress-callback keep-alive
//! - [`dispatch`]: single-worker and multi-worker dispatch strategies
//! - [`local`]: GPU argv rewrite, self-heal, local fallback execution
//! - [`session`] / [`events`]: per-run state directory and install-global logs

pub mod aggregate;
pub mod beam;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod invocation;
pub mod local;
pub mod pool;
pub mod progress;
pub mod session;

pub use error::{BeamError, Result};

/// Version string stamped into job metadata.
pub const CARTRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");
