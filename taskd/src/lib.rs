//! taskd: accepts signed task dispatches, tracks them on a bounded worker
//! host, persists their lifecycle and reports completion through signed
//! webhooks.

pub mod auth;
pub mod config;
pub mod http_server;
pub mod lifecycle;
pub mod nonce_cache;
pub mod service;

pub use config::{Cli, Settings};
pub use lifecycle::{Lifecycle, ServiceStatus};
pub use service::{Components, RunningService};
