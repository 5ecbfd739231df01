//! Connector framework syncing external knowledge sources (Confluence,
//! SharePoint, Notion, Google Drive) into the unified item model.
//!
//! Each connector translates one vendor API into [`muniknow_models::ConnectorItem`]s
//! and implements full/incremental sync, search and health checks on top of a
//! shared authenticated HTTP layer with per-instance rate limiting.

pub mod base;
pub mod confluence;
pub mod error;
pub mod factory;
pub mod google_drive;
pub mod http;
pub mod manager;
pub mod notion;
pub mod rate_limiter;
pub mod sharepoint;
pub mod util;

pub use base::{Connector, SyncOutput};
pub use error::{ConnectorError, ConnectorResult};
pub use factory::ConnectorFactory;
pub use manager::ConnectorManager;
pub use rate_limiter::RateLimiter;
