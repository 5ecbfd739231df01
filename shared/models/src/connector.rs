use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::sync::SyncStats;

/// External knowledge sources supported by the connector framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorType {
    Confluence,
    Sharepoint,
    Notion,
    GoogleDrive,
}

impl std::fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorType::Confluence => write!(f, "confluence"),
            ConnectorType::Sharepoint => write!(f, "sharepoint"),
            ConnectorType::Notion => write!(f, "notion"),
            ConnectorType::GoogleDrive => write!(f, "google_drive"),
        }
    }
}

/// Lifecycle status of a configured connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorStatus {
    Active,
    Inactive,
    Error,
    Syncing,
    Pending,
}

/// Authentication schemes a connector may be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Oauth2,
    ApiKey,
    Basic,
    Bearer,
    Custom,
}

/// How often a connector is expected to sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFrequency {
    Realtime,
    Hourly,
    Daily,
    Weekly,
    Manual,
}

impl SyncFrequency {
    /// Interval until the next scheduled sync, None for manual/realtime.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            SyncFrequency::Hourly => Some(Duration::hours(1)),
            SyncFrequency::Daily => Some(Duration::days(1)),
            SyncFrequency::Weekly => Some(Duration::weeks(1)),
            SyncFrequency::Realtime | SyncFrequency::Manual => None,
        }
    }
}

/// Credential bag whose populated fields depend on the configured [`AuthType`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthCredentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub tenant_id: Option<String>,
    pub custom_headers: Option<HashMap<String, String>>,
}

impl AuthCredentials {
    /// Fields required by `auth_type` that are not populated.
    ///
    /// Callers must refuse to issue any request while this is non-empty so a
    /// misconfigured connector fails deterministically instead of sending
    /// half-built auth headers.
    pub fn missing_fields(&self, auth_type: AuthType) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match auth_type {
            AuthType::Oauth2 => {
                if self.access_token.is_none() {
                    missing.push("access_token");
                }
            }
            AuthType::Bearer => {
                if self.access_token.is_none() {
                    missing.push("access_token");
                }
            }
            AuthType::ApiKey => {
                if self.api_key.is_none() {
                    missing.push("api_key");
                }
            }
            AuthType::Basic => {
                if self.username.is_none() {
                    missing.push("username");
                }
                if self.password.is_none() {
                    missing.push("password");
                }
            }
            AuthType::Custom => {
                if self.custom_headers.as_ref().map_or(true, |h| h.is_empty()) {
                    missing.push("custom_headers");
                }
            }
        }
        missing
    }
}

/// Durable configuration for one connector instance.
///
/// Created by the admin configuration flow, mutated by sync runs (cursor,
/// stats, timestamps, status), never deleted by the connector itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: String,
    pub organization_id: String,
    pub knowledge_space_id: Option<String>,
    pub name: String,
    pub connector_type: ConnectorType,
    pub status: ConnectorStatus,
    pub auth_type: AuthType,
    pub auth_credentials: AuthCredentials,
    /// Vendor-specific settings: base URL, space/site/folder identifiers,
    /// include/exclude patterns, batch size.
    pub configuration: serde_json::Value,
    pub sync_frequency: SyncFrequency,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub sync_cursor: Option<String>,
    pub sync_stats: Option<SyncStats>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectorConfig {
    pub fn new(
        organization_id: impl Into<String>,
        name: impl Into<String>,
        connector_type: ConnectorType,
        auth_type: AuthType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id: organization_id.into(),
            knowledge_space_id: None,
            name: name.into(),
            connector_type,
            status: ConnectorStatus::Pending,
            auth_type,
            auth_credentials: AuthCredentials::default(),
            configuration: serde_json::json!({}),
            sync_frequency: SyncFrequency::Daily,
            last_sync_at: None,
            next_sync_at: None,
            sync_cursor: None,
            sync_stats: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// String-typed lookup into the vendor configuration bag.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.configuration.get(key).and_then(|v| v.as_str())
    }

    /// String-array lookup into the vendor configuration bag.
    pub fn setting_str_list(&self, key: &str) -> Vec<String> {
        self.configuration
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record the bookkeeping of a finished sync run.
    pub fn record_sync(&mut self, stats: SyncStats, cursor: Option<String>) {
        let now = Utc::now();
        self.last_sync_at = Some(now);
        self.next_sync_at = self.sync_frequency.interval().map(|d| now + d);
        if cursor.is_some() {
            self.sync_cursor = cursor;
        }
        self.sync_stats = Some(stats);
        self.updated_at = now;
    }
}

/// Content formats a normalized item can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Html,
    Markdown,
    Text,
    Pdf,
    Doc,
}

/// Sync state of a single normalized item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemSyncStatus {
    Pending,
    Synced,
    Failed,
    Deleted,
}

/// Normalized representation of one piece of external content.
///
/// Produced transiently by a connector's conversion step; a persistence
/// collaborator diffs `sync_hash`/`external_id` against stored state and
/// decides insert/update/skip. The connector never persists items itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorItem {
    /// Namespaced local id, `<vendor>-<external_id>`.
    pub id: String,
    pub connector_id: String,
    pub external_id: String,
    pub knowledge_item_id: Option<String>,
    pub title: String,
    pub content: String,
    pub content_type: ContentType,
    pub excerpt: Option<String>,
    pub source_url: Option<String>,
    pub source_path: Option<String>,
    pub source_type: Option<String>,
    pub author: Option<String>,
    pub external_created_at: Option<DateTime<Utc>>,
    pub external_updated_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
    /// Deterministic fingerprint of (title, content, external_updated_at,
    /// metadata); unchanged content always re-hashes to the same value.
    pub sync_hash: String,
    pub sync_status: ItemSyncStatus,
    pub sync_error: Option<String>,
    pub metadata: serde_json::Value,
    pub tags: Option<Vec<String>>,
    pub permissions: Option<Vec<String>>,
}

impl ConnectorItem {
    /// Namespaced item id for a vendor/external-id pair.
    pub fn namespaced_id(connector_type: ConnectorType, external_id: &str) -> String {
        format!("{}-{}", connector_type, external_id)
    }
}

/// Static declaration of what a connector type supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorCapabilities {
    pub supports_full_sync: bool,
    pub supports_incremental_sync: bool,
    pub supports_webhooks: bool,
    pub supports_search: bool,
    pub supports_permissions: bool,
    pub supports_attachments: bool,
    pub supports_comments: bool,
    pub supports_versions: bool,
    /// Outbound request budget enforced by the connector's rate limiter.
    pub rate_limit_rpm: u32,
    pub max_batch_size: u32,
}

/// Overall verdict of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Verdict of one probe within a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckEntry {
    pub status: CheckStatus,
    pub message: Option<String>,
    pub latency_ms: Option<u64>,
}

impl HealthCheckEntry {
    pub fn pass() -> Self {
        Self { status: CheckStatus::Pass, message: None, latency_ms: None }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { status: CheckStatus::Fail, message: Some(message.into()), latency_ms: None }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self { status: CheckStatus::Warn, message: Some(message.into()), latency_ms: None }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Point-in-time diagnostic for one connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorHealthCheck {
    pub status: HealthStatus,
    pub authentication: HealthCheckEntry,
    pub connectivity: HealthCheckEntry,
    pub permissions: HealthCheckEntry,
    pub quota: HealthCheckEntry,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl ConnectorHealthCheck {
    /// Derive the overall status from the four probe entries: any fail is
    /// unhealthy, any warn is degraded, otherwise healthy.
    pub fn from_checks(
        authentication: HealthCheckEntry,
        connectivity: HealthCheckEntry,
        permissions: HealthCheckEntry,
        quota: HealthCheckEntry,
        recommendations: Vec<String>,
    ) -> Self {
        let entries = [&authentication, &connectivity, &permissions, &quota];
        let status = if entries.iter().any(|e| e.status == CheckStatus::Fail) {
            HealthStatus::Unhealthy
        } else if entries.iter().any(|e| e.status == CheckStatus::Warn) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self {
            status,
            authentication,
            connectivity,
            permissions,
            quota,
            recommendations,
            checked_at: Utc::now(),
        }
    }
}

/// Generic search parameters translated into each vendor's query language.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorSearchParams {
    pub query: String,
    pub content_types: Option<Vec<ContentType>>,
    pub modified_after: Option<DateTime<Utc>>,
    pub modified_before: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub path_prefix: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Push notification from a vendor, assembled by the webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorWebhookEvent {
    pub id: String,
    pub connector_id: String,
    pub event_type: String,
    pub external_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Input control type for a configuration field in the admin UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigFieldType {
    Text,
    Password,
    Url,
    Select,
}

/// One field the configuration UI must collect for a connector type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigField {
    pub key: String,
    pub label: String,
    pub field_type: ConfigFieldType,
    pub required: bool,
    pub placeholder: Option<String>,
    pub help_text: Option<String>,
    pub options: Option<Vec<String>>,
}

impl ConfigField {
    pub fn new(
        key: impl Into<String>,
        label: impl Into<String>,
        field_type: ConfigFieldType,
        required: bool,
    ) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            field_type,
            required,
            placeholder: None,
            help_text: None,
            options: None,
        }
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }

    pub fn with_help(mut self, help_text: impl Into<String>) -> Self {
        self.help_text = Some(help_text.into());
        self
    }
}

/// Registration metadata for a connector type, consumed by configuration UIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorRegistration {
    pub connector_type: ConnectorType,
    pub display_name: String,
    pub description: String,
    pub capabilities: ConnectorCapabilities,
    pub config_fields: Vec<ConfigField>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_basic_auth() {
        let creds = AuthCredentials {
            username: Some("admin@example.org".into()),
            ..Default::default()
        };
        assert_eq!(creds.missing_fields(AuthType::Basic), vec!["password"]);
    }

    #[test]
    fn missing_fields_complete_oauth() {
        let creds = AuthCredentials {
            access_token: Some("tok".into()),
            ..Default::default()
        };
        assert!(creds.missing_fields(AuthType::Oauth2).is_empty());
        assert!(creds.missing_fields(AuthType::Bearer).is_empty());
    }

    #[test]
    fn namespaced_id_uses_vendor_prefix() {
        assert_eq!(
            ConnectorItem::namespaced_id(ConnectorType::Notion, "abc123"),
            "notion-abc123"
        );
        assert_eq!(
            ConnectorItem::namespaced_id(ConnectorType::GoogleDrive, "f1"),
            "google_drive-f1"
        );
    }

    #[test]
    fn record_sync_schedules_next_run() {
        let mut config = ConnectorConfig::new(
            "org-1",
            "HR wiki",
            ConnectorType::Confluence,
            AuthType::Basic,
        );
        config.sync_frequency = SyncFrequency::Hourly;
        config.record_sync(SyncStats::default(), Some("cursor-1".into()));
        assert!(config.last_sync_at.is_some());
        assert!(config.next_sync_at.unwrap() > config.last_sync_at.unwrap());
        assert_eq!(config.sync_cursor.as_deref(), Some("cursor-1"));
    }

    #[test]
    fn health_check_overall_status() {
        let check = ConnectorHealthCheck::from_checks(
            HealthCheckEntry::pass(),
            HealthCheckEntry::pass(),
            HealthCheckEntry::warn("limited scope"),
            HealthCheckEntry::pass(),
            vec![],
        );
        assert_eq!(check.status, HealthStatus::Degraded);

        let check = ConnectorHealthCheck::from_checks(
            HealthCheckEntry::fail("401"),
            HealthCheckEntry::pass(),
            HealthCheckEntry::pass(),
            HealthCheckEntry::pass(),
            vec!["check your token".into()],
        );
        assert_eq!(check.status, HealthStatus::Unhealthy);
    }
}
