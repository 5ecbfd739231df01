use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall outcome of one sync invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncResultStatus {
    Success,
    Partial,
    Failed,
}

/// Aggregate counters for one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_discovered: u64,
    pub new_items: u64,
    pub updated_items: u64,
    pub deleted_items: u64,
    pub failed_items: u64,
    pub unchanged_items: u64,
}

impl SyncStats {
    /// A well-formed result accounts for every discovered item exactly once.
    pub fn is_consistent(&self) -> bool {
        self.total_discovered
            == self.new_items
                + self.updated_items
                + self.deleted_items
                + self.failed_items
                + self.unchanged_items
    }
}

/// One item-level failure recorded during a sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncError {
    pub external_id: String,
    pub title: Option<String>,
    pub error: String,
    pub code: String,
}

/// Outcome of one `full_sync`/`incremental_sync` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub status: SyncResultStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stats: SyncStats,
    pub errors: Vec<SyncError>,
    /// Opaque vendor cursor for resuming the next incremental sync. Only
    /// committed after every item of the current page has been processed.
    pub cursor: Option<String>,
    pub has_more: bool,
}

impl SyncResult {
    /// Finished run: success iff no item errors were recorded.
    pub fn completed(started_at: DateTime<Utc>, stats: SyncStats, errors: Vec<SyncError>) -> Self {
        let completed_at = Utc::now();
        let status = if errors.is_empty() {
            SyncResultStatus::Success
        } else {
            SyncResultStatus::Partial
        };
        Self {
            status,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
            stats,
            errors,
            cursor: None,
            has_more: false,
        }
    }

    /// Aborted run: a single synthetic error describes the top-level failure.
    pub fn failed(started_at: DateTime<Utc>, error: SyncError) -> Self {
        let completed_at = Utc::now();
        Self {
            status: SyncResultStatus::Failed,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
            stats: SyncStats::default(),
            errors: vec![error],
            cursor: None,
            has_more: false,
        }
    }

    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn with_has_more(mut self, has_more: bool) -> Self {
        self.has_more = has_more;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_consistency() {
        let stats = SyncStats {
            total_discovered: 5,
            new_items: 2,
            updated_items: 1,
            deleted_items: 1,
            failed_items: 0,
            unchanged_items: 1,
        };
        assert!(stats.is_consistent());

        let bad = SyncStats { total_discovered: 4, ..stats };
        assert!(!bad.is_consistent());
    }

    #[test]
    fn completed_status_depends_on_errors() {
        let started = Utc::now();
        let ok = SyncResult::completed(started, SyncStats::default(), vec![]);
        assert_eq!(ok.status, SyncResultStatus::Success);

        let partial = SyncResult::completed(
            started,
            SyncStats::default(),
            vec![SyncError {
                external_id: "x".into(),
                title: None,
                error: "conversion failed".into(),
                code: "REQUEST_FAILED".into(),
            }],
        );
        assert_eq!(partial.status, SyncResultStatus::Partial);
    }
}
