use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use muniknow_models::{
    AuthCredentials, ConnectorCapabilities, ConnectorHealthCheck, ConnectorItem,
    ConnectorSearchParams, ConnectorStatus, ConnectorType, ConnectorWebhookEvent, SyncError,
    SyncResult, SyncStats,
};

use crate::error::{ConnectorError, ConnectorResult};

/// Items discovered by a sync plus the run's bookkeeping.
///
/// The framework never persists items itself: the caller hands `items` and
/// `result` to the persistence collaborator, which diffs on
/// `sync_hash`/`external_id` and upserts into the knowledge store.
#[derive(Debug)]
pub struct SyncOutput {
    pub result: SyncResult,
    pub items: Vec<ConnectorItem>,
}

/// Capability surface every knowledge-source connector implements.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Id of the [`muniknow_models::ConnectorConfig`] this instance was built from.
    fn connector_id(&self) -> &str;

    fn connector_type(&self) -> ConnectorType;

    /// Lifecycle status from the owning config; the manager skips syncs for
    /// anything not `Active`.
    fn status(&self) -> ConnectorStatus;

    /// Static vendor capabilities. Pure, no I/O.
    fn capabilities(&self) -> ConnectorCapabilities;

    /// Probe auth, connectivity, permissions and quota. Total: every failure
    /// mode resolves into the check entries, this never errors out.
    async fn test_connection(&self) -> ConnectorHealthCheck;

    /// Enumerate all current vendor content. One item's conversion error is
    /// recorded and does not abort the remaining items.
    async fn full_sync(&self, cancel: &CancellationToken) -> SyncOutput;

    /// Sync only content changed since `cursor` (falling back to the config's
    /// `last_sync_at`, then epoch), using the vendor's native delta mechanism.
    async fn incremental_sync(
        &self,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> SyncOutput;

    /// Fetch a single item; `Ok(None)` specifically on a not-found response,
    /// other errors propagate.
    async fn fetch_item(&self, external_id: &str) -> ConnectorResult<Option<ConnectorItem>>;

    /// Translate generic search parameters into the vendor's query language.
    async fn search(
        &self,
        params: &ConnectorSearchParams,
        cancel: &CancellationToken,
    ) -> ConnectorResult<Vec<ConnectorItem>>;

    /// Refresh the auth token bundle. Default: no refresh supported.
    async fn refresh_tokens(&self) -> ConnectorResult<Option<AuthCredentials>> {
        Ok(None)
    }

    /// Process a vendor push notification. Default no-op; overridden by
    /// webhook-capable connectors.
    async fn handle_webhook(&self, _event: &ConnectorWebhookEvent) -> ConnectorResult<()> {
        Ok(())
    }
}

/// Accumulator for one sync run, keeping the stats invariant
/// (`total_discovered` == sum of the outcome counters) by construction.
pub struct SyncRun {
    started_at: DateTime<Utc>,
    stats: SyncStats,
    errors: Vec<SyncError>,
    items: Vec<ConnectorItem>,
}

impl SyncRun {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            stats: SyncStats::default(),
            errors: Vec::new(),
            items: Vec::new(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn push_new(&mut self, item: ConnectorItem) {
        self.stats.total_discovered += 1;
        self.stats.new_items += 1;
        self.items.push(item);
    }

    pub fn push_updated(&mut self, item: ConnectorItem) {
        self.stats.total_discovered += 1;
        self.stats.updated_items += 1;
        self.items.push(item);
    }

    pub fn push_deleted(&mut self, item: ConnectorItem) {
        self.stats.total_discovered += 1;
        self.stats.deleted_items += 1;
        self.items.push(item);
    }

    pub fn push_unchanged(&mut self) {
        self.stats.total_discovered += 1;
        self.stats.unchanged_items += 1;
    }

    pub fn push_failed(
        &mut self,
        external_id: impl Into<String>,
        title: Option<String>,
        error: &ConnectorError,
    ) {
        self.stats.total_discovered += 1;
        self.stats.failed_items += 1;
        self.errors.push(SyncError {
            external_id: external_id.into(),
            title,
            error: error.to_string(),
            code: error.code().to_string(),
        });
    }

    /// Complete the run: `success` iff no item errors, else `partial`.
    pub fn finish(self, cursor: Option<String>, has_more: bool) -> SyncOutput {
        let result = SyncResult::completed(self.started_at, self.stats, self.errors)
            .with_cursor(cursor)
            .with_has_more(has_more);
        SyncOutput {
            result,
            items: self.items,
        }
    }

    /// Abort the run on a top-level failure (vendor unreachable, site/space
    /// unresolvable). Discovered items are discarded and a single synthetic
    /// error describes the failure.
    pub fn fail(self, error: &ConnectorError) -> SyncOutput {
        let result = SyncResult::failed(
            self.started_at,
            SyncError {
                external_id: String::new(),
                title: None,
                error: error.to_string(),
                code: error.code().to_string(),
            },
        );
        SyncOutput {
            result,
            items: Vec::new(),
        }
    }
}

impl Default for SyncRun {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muniknow_models::{ContentType, ItemSyncStatus, SyncResultStatus};

    fn item(external_id: &str) -> ConnectorItem {
        ConnectorItem {
            id: format!("notion-{}", external_id),
            connector_id: "c1".into(),
            external_id: external_id.into(),
            knowledge_item_id: None,
            title: "t".into(),
            content: "c".into(),
            content_type: ContentType::Text,
            excerpt: None,
            source_url: None,
            source_path: None,
            source_type: None,
            author: None,
            external_created_at: None,
            external_updated_at: None,
            synced_at: Utc::now(),
            sync_hash: "h".into(),
            sync_status: ItemSyncStatus::Pending,
            sync_error: None,
            metadata: serde_json::json!({}),
            tags: None,
            permissions: None,
        }
    }

    #[test]
    fn run_keeps_stats_consistent() {
        let mut run = SyncRun::new();
        run.push_new(item("a"));
        run.push_updated(item("b"));
        run.push_deleted(item("c"));
        run.push_unchanged();
        run.push_failed("d", None, &ConnectorError::RequestFailed {
            status: 500,
            message: "boom".into(),
        });
        let output = run.finish(Some("cur".into()), false);
        assert!(output.result.stats.is_consistent());
        assert_eq!(output.result.stats.total_discovered, 5);
        assert_eq!(output.result.status, SyncResultStatus::Partial);
        assert_eq!(output.result.errors.len(), 1);
        assert_eq!(output.result.errors[0].code, "REQUEST_FAILED");
        assert_eq!(output.items.len(), 3);
        assert_eq!(output.result.cursor.as_deref(), Some("cur"));
    }

    #[test]
    fn clean_run_is_success() {
        let mut run = SyncRun::new();
        run.push_new(item("a"));
        let output = run.finish(None, false);
        assert_eq!(output.result.status, SyncResultStatus::Success);
    }

    #[test]
    fn failed_run_has_single_synthetic_error() {
        let mut run = SyncRun::new();
        run.push_new(item("a"));
        let output = run.fail(&ConnectorError::RequestFailed {
            status: 503,
            message: "unreachable".into(),
        });
        assert_eq!(output.result.status, SyncResultStatus::Failed);
        assert_eq!(output.result.errors.len(), 1);
        assert!(output.items.is_empty());
    }
}
