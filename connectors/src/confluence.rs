use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use muniknow_models::{
    ConfigField, ConfigFieldType, ConnectorCapabilities, ConnectorConfig, ConnectorHealthCheck,
    ConnectorItem, ConnectorRegistration, ConnectorSearchParams, ConnectorStatus, ConnectorType,
    ContentType, HealthCheckEntry, ItemSyncStatus,
};

use crate::base::{Connector, SyncOutput, SyncRun};
use crate::error::{ConnectorError, ConnectorResult};
use crate::http::AuthorizedClient;
use crate::util::{extract_excerpt, html_to_text, sync_hash};

const PAGE_EXPAND: &str = "body.storage,version,history,space";

/// Confluence Cloud connector. Basic auth with account email + API token,
/// page bodies arrive as storage-format HTML.
pub struct ConfluenceConnector {
    config: ConnectorConfig,
    client: AuthorizedClient,
    base_url: String,
    space_keys: Vec<String>,
    batch_size: u32,
}

impl ConfluenceConnector {
    pub fn new(config: ConnectorConfig) -> ConnectorResult<Self> {
        let base_url = config
            .setting_str("base_url")
            .ok_or_else(|| {
                ConnectorError::Configuration("confluence connector requires base_url".into())
            })?
            .trim_end_matches('/')
            .to_string();
        let space_keys = config.setting_str_list("space_keys");
        let batch_size = config
            .configuration
            .get("batch_size")
            .and_then(|v| v.as_u64())
            .unwrap_or(25)
            .clamp(1, Self::static_capabilities().max_batch_size as u64) as u32;
        let client = AuthorizedClient::new(
            config.auth_type,
            config.auth_credentials.clone(),
            Self::static_capabilities().rate_limit_rpm,
        );
        Ok(Self {
            config,
            client,
            base_url,
            space_keys,
            batch_size,
        })
    }

    fn static_capabilities() -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_full_sync: true,
            supports_incremental_sync: true,
            supports_webhooks: false,
            supports_search: true,
            supports_permissions: false,
            supports_attachments: false,
            supports_comments: false,
            supports_versions: true,
            rate_limit_rpm: 60,
            max_batch_size: 50,
        }
    }

    pub fn registration() -> ConnectorRegistration {
        ConnectorRegistration {
            connector_type: ConnectorType::Confluence,
            display_name: "Confluence".to_string(),
            description: "Syncs pages from Confluence Cloud spaces".to_string(),
            capabilities: Self::static_capabilities(),
            config_fields: vec![
                ConfigField::new("base_url", "Base URL", ConfigFieldType::Url, true)
                    .with_placeholder("https://your-org.atlassian.net/wiki"),
                ConfigField::new("username", "Account email", ConfigFieldType::Text, true),
                ConfigField::new("api_token", "API token", ConfigFieldType::Password, true)
                    .with_help("Create one under Atlassian account settings, API tokens"),
                ConfigField::new("space_keys", "Space keys", ConfigFieldType::Text, false)
                    .with_help("Restrict the sync to these space keys; leave empty for all spaces"),
            ],
        }
    }

    async fn get_json(&self, path_and_query: &str) -> ConnectorResult<Value> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let response = self.client.send(|http| http.get(&url)).await?;
        response.json::<Value>().await.map_err(ConnectorError::from)
    }

    async fn list_space_keys(&self) -> ConnectorResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut start = 0u32;
        loop {
            let body = self
                .get_json(&format!("/rest/api/space?limit=50&start={}", start))
                .await?;
            let results = body
                .get("results")
                .and_then(|r| r.as_array())
                .cloned()
                .unwrap_or_default();
            for space in &results {
                if let Some(key) = space.get("key").and_then(|k| k.as_str()) {
                    keys.push(key.to_string());
                }
            }
            if results.len() < 50 {
                return Ok(keys);
            }
            start += 50;
        }
    }

    fn convert_page(&self, page: &Value) -> ConnectorResult<ConnectorItem> {
        let external_id = page
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::RequestFailed {
                status: 0,
                message: "page without id in Confluence response".into(),
            })?
            .to_string();
        let title = page
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Untitled")
            .to_string();
        let body_html = page
            .pointer("/body/storage/value")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let space_key = page
            .pointer("/space/key")
            .and_then(|v| v.as_str())
            .map(String::from);
        let author = page
            .pointer("/history/createdBy/displayName")
            .and_then(|v| v.as_str())
            .map(String::from);
        let created_at = page
            .pointer("/history/createdDate")
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp);
        let updated_at = page
            .pointer("/version/when")
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp);
        let web_link = page
            .pointer("/_links/webui")
            .and_then(|v| v.as_str())
            .map(|p| format!("{}{}", self.base_url, p));

        let metadata = serde_json::json!({
            "space_key": space_key,
            "version": page.pointer("/version/number").and_then(|v| v.as_u64()),
        });
        let hash = sync_hash(&title, &body_html, updated_at.as_ref(), &metadata);
        let excerpt = extract_excerpt(&html_to_text(&body_html), 300);

        Ok(ConnectorItem {
            id: ConnectorItem::namespaced_id(ConnectorType::Confluence, &external_id),
            connector_id: self.config.id.clone(),
            external_id,
            knowledge_item_id: None,
            title,
            content: body_html,
            content_type: ContentType::Html,
            excerpt: Some(excerpt),
            source_url: web_link,
            source_path: space_key.clone(),
            source_type: Some("page".to_string()),
            author,
            external_created_at: created_at,
            external_updated_at: updated_at,
            synced_at: Utc::now(),
            sync_hash: hash,
            sync_status: ItemSyncStatus::Pending,
            sync_error: None,
            metadata,
            tags: None,
            permissions: None,
        })
    }

    /// Boundary for incremental classification: explicit cursor wins, then
    /// the cursor stored on the config, then last sync, then epoch.
    fn sync_boundary(&self, cursor: Option<&str>) -> DateTime<Utc> {
        cursor
            .or(self.config.sync_cursor.as_deref())
            .and_then(parse_timestamp_str)
            .or(self.config.last_sync_at)
            .unwrap_or_default()
    }

    fn cql_escape(raw: &str) -> String {
        raw.replace('\\', "\\\\").replace('"', "\\\"")
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    parse_timestamp_str(raw)
}

fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[async_trait]
impl Connector for ConfluenceConnector {
    fn connector_id(&self) -> &str {
        &self.config.id
    }

    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Confluence
    }

    fn status(&self) -> ConnectorStatus {
        self.config.status
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        Self::static_capabilities()
    }

    async fn test_connection(&self) -> ConnectorHealthCheck {
        let mut recommendations = Vec::new();

        let started = std::time::Instant::now();
        let auth_probe = self.get_json("/rest/api/user/current").await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (authentication, connectivity) = match &auth_probe {
            Ok(_) => (
                HealthCheckEntry::pass(),
                HealthCheckEntry::pass().with_latency(latency_ms),
            ),
            Err(ConnectorError::AuthFailed { .. }) => {
                recommendations.push(
                    "Invalid Confluence credentials: check the account email and API token"
                        .to_string(),
                );
                // The 401 came back from the server, so the endpoint is reachable.
                (
                    HealthCheckEntry::fail("authentication rejected (401)"),
                    HealthCheckEntry::pass().with_latency(latency_ms),
                )
            }
            Err(e) => {
                recommendations
                    .push(format!("Confluence is unreachable at {}: {}", self.base_url, e));
                (
                    HealthCheckEntry::warn("could not verify credentials"),
                    HealthCheckEntry::fail(e.to_string()),
                )
            }
        };

        let permissions = match self.get_json("/rest/api/space?limit=1").await {
            Ok(_) => HealthCheckEntry::pass(),
            Err(e) => {
                recommendations.push(
                    "The account cannot list spaces: grant it read access to the spaces to sync"
                        .to_string(),
                );
                HealthCheckEntry::fail(e.to_string())
            }
        };

        ConnectorHealthCheck::from_checks(
            authentication,
            connectivity,
            permissions,
            HealthCheckEntry::pass(),
            recommendations,
        )
    }

    async fn full_sync(&self, cancel: &CancellationToken) -> SyncOutput {
        let mut run = SyncRun::new();
        info!(connector_id = %self.config.id, "starting confluence full sync");

        let spaces = if self.space_keys.is_empty() {
            match self.list_space_keys().await {
                Ok(keys) => keys,
                Err(e) => return run.fail(&e),
            }
        } else {
            self.space_keys.clone()
        };

        for key in &spaces {
            let mut start = 0u32;
            loop {
                if cancel.is_cancelled() {
                    info!(connector_id = %self.config.id, "full sync cancelled");
                    return run.finish(None, true);
                }
                let query = format!(
                    "/rest/api/content?spaceKey={}&type=page&expand={}&limit={}&start={}",
                    urlencoding::encode(key),
                    PAGE_EXPAND,
                    self.batch_size,
                    start
                );
                let batch = match self.get_json(&query).await {
                    Ok(body) => body,
                    Err(e) => return run.fail(&e),
                };
                let results = batch
                    .get("results")
                    .and_then(|r| r.as_array())
                    .cloned()
                    .unwrap_or_default();
                for page in &results {
                    let external_id = page
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    match self.convert_page(page) {
                        Ok(item) => run.push_new(item),
                        Err(e) => {
                            warn!(connector_id = %self.config.id, external_id = %external_id,
                                error = %e, "skipping page that failed to convert");
                            let title = page
                                .get("title")
                                .and_then(|v| v.as_str())
                                .map(String::from);
                            run.push_failed(external_id, title, &e);
                        }
                    }
                }
                if (results.len() as u32) < self.batch_size {
                    break;
                }
                start += self.batch_size;
            }
        }
        run.finish(None, false)
    }

    async fn incremental_sync(
        &self,
        cursor: Option<String>,
        cancel: &CancellationToken,
    ) -> SyncOutput {
        let mut run = SyncRun::new();
        let boundary = self.sync_boundary(cursor.as_deref());
        let next_cursor = run.started_at().to_rfc3339();
        info!(connector_id = %self.config.id, since = %boundary, "starting confluence incremental sync");

        let mut cql = format!(
            "type=page and lastmodified >= \"{}\"",
            boundary.format("%Y/%m/%d %H:%M")
        );
        if !self.space_keys.is_empty() {
            cql.push_str(&format!(" and space in ({})", self.space_keys.join(",")));
        }
        cql.push_str(" order by lastmodified asc");

        let mut start = 0u32;
        loop {
            if cancel.is_cancelled() {
                return run.finish(None, true);
            }
            let query = format!(
                "/rest/api/content/search?cql={}&expand={}&limit={}&start={}",
                urlencoding::encode(&cql),
                PAGE_EXPAND,
                self.batch_size,
                start
            );
            let batch = match self.get_json(&query).await {
                Ok(body) => body,
                Err(e) => return run.fail(&e),
            };
            let results = batch
                .get("results")
                .and_then(|r| r.as_array())
                .cloned()
                .unwrap_or_default();
            for page in &results {
                let external_id = page
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                match self.convert_page(page) {
                    Ok(item) => {
                        // Pages created after the boundary are new; anything
                        // modified but older is an update to known content.
                        let created_after = item
                            .external_created_at
                            .map_or(false, |created| created > boundary);
                        if created_after {
                            run.push_new(item);
                        } else {
                            run.push_updated(item);
                        }
                    }
                    Err(e) => {
                        let title = page.get("title").and_then(|v| v.as_str()).map(String::from);
                        run.push_failed(external_id, title, &e);
                    }
                }
            }
            if (results.len() as u32) < self.batch_size {
                break;
            }
            start += self.batch_size;
        }
        run.finish(Some(next_cursor), false)
    }

    async fn fetch_item(&self, external_id: &str) -> ConnectorResult<Option<ConnectorItem>> {
        let query = format!(
            "/rest/api/content/{}?expand={}",
            urlencoding::encode(external_id),
            PAGE_EXPAND
        );
        match self.get_json(&query).await {
            Ok(page) => Ok(Some(self.convert_page(&page)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn search(
        &self,
        params: &ConnectorSearchParams,
        cancel: &CancellationToken,
    ) -> ConnectorResult<Vec<ConnectorItem>> {
        let mut cql = format!("type=page and text ~ \"{}\"", Self::cql_escape(&params.query));
        if let Some(after) = params.modified_after {
            cql.push_str(&format!(
                " and lastmodified >= \"{}\"",
                after.format("%Y/%m/%d %H:%M")
            ));
        }
        if let Some(before) = params.modified_before {
            cql.push_str(&format!(
                " and lastmodified <= \"{}\"",
                before.format("%Y/%m/%d %H:%M")
            ));
        }
        if let Some(author) = &params.author {
            cql.push_str(&format!(" and creator = \"{}\"", Self::cql_escape(author)));
        }
        if let Some(space) = &params.path_prefix {
            cql.push_str(&format!(" and space = \"{}\"", Self::cql_escape(space)));
        }

        let limit = params.limit.unwrap_or(25).min(self.batch_size.max(25));
        let offset = params.offset.unwrap_or(0);
        debug!(connector_id = %self.config.id, cql = %cql, "confluence search");

        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        let query = format!(
            "/rest/api/content/search?cql={}&expand={}&limit={}&start={}",
            urlencoding::encode(&cql),
            PAGE_EXPAND,
            limit,
            offset
        );
        let body = self.get_json(&query).await?;
        let mut items = Vec::new();
        if let Some(results) = body.get("results").and_then(|r| r.as_array()) {
            for page in results {
                items.push(self.convert_page(page)?);
            }
        }
        Ok(items)
    }
}
