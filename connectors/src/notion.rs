use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
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
use crate::util::{extract_excerpt, sync_hash};

const DEFAULT_API_BASE: &str = "https://api.notion.com";
const NOTION_VERSION: &str = "2022-06-28";

/// Notion connector. Integration bearer token, no refresh: a 401 fails
/// immediately instead of retrying. Page block trees are flattened into a
/// Markdown rendering.
pub struct NotionConnector {
    config: ConnectorConfig,
    client: AuthorizedClient,
    api_base: String,
    batch_size: u32,
}

impl NotionConnector {
    pub fn new(config: ConnectorConfig) -> ConnectorResult<Self> {
        let api_base = config
            .setting_str("base_url")
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/')
            .to_string();
        let batch_size = config
            .configuration
            .get("batch_size")
            .and_then(|v| v.as_u64())
            .unwrap_or(50)
            .clamp(1, Self::static_capabilities().max_batch_size as u64) as u32;
        let client = AuthorizedClient::new(
            config.auth_type,
            config.auth_credentials.clone(),
            Self::static_capabilities().rate_limit_rpm,
        );
        Ok(Self {
            config,
            client,
            api_base,
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
            supports_comments: true,
            supports_versions: false,
            rate_limit_rpm: 180,
            max_batch_size: 100,
        }
    }

    pub fn registration() -> ConnectorRegistration {
        ConnectorRegistration {
            connector_type: ConnectorType::Notion,
            display_name: "Notion".to_string(),
            description: "Syncs pages shared with a Notion internal integration".to_string(),
            capabilities: Self::static_capabilities(),
            config_fields: vec![ConfigField::new(
                "access_token",
                "Integration token",
                ConfigFieldType::Password,
                true,
            )
            .with_placeholder("secret_...")
            .with_help("Share the pages to sync with the integration in Notion")],
        }
    }

    async fn get_json(&self, path_and_query: &str) -> ConnectorResult<Value> {
        let url = format!("{}{}", self.api_base, path_and_query);
        let response = self
            .client
            .send(|http| http.get(&url).header("Notion-Version", NOTION_VERSION))
            .await?;
        response.json::<Value>().await.map_err(ConnectorError::from)
    }

    async fn post_json(&self, path: &str, body: Value) -> ConnectorResult<Value> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .client
            .send(|http| {
                http.post(&url)
                    .header("Notion-Version", NOTION_VERSION)
                    .json(&body)
            })
            .await?;
        response.json::<Value>().await.map_err(ConnectorError::from)
    }

    /// Flatten a page's block tree into Markdown.
    ///
    /// Blocks are walked with an explicit queue rather than recursion; nested
    /// children are appended after their parent's siblings, which is a
    /// deliberate flattening of the hierarchy.
    async fn page_markdown(&self, page_id: &str) -> ConnectorResult<String> {
        let mut lines: Vec<String> = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::from([page_id.to_string()]);

        while let Some(block_id) = queue.pop_front() {
            let mut cursor: Option<String> = None;
            loop {
                let mut path = format!("/v1/blocks/{}/children?page_size=100", block_id);
                if let Some(c) = &cursor {
                    path.push_str(&format!("&start_cursor={}", urlencoding::encode(c)));
                }
                let body = self.get_json(&path).await?;
                if let Some(blocks) = body.get("results").and_then(|r| r.as_array()) {
                    for block in blocks {
                        if let Some(line) = render_block(block) {
                            lines.push(line);
                        }
                        let block_type =
                            block.get("type").and_then(|t| t.as_str()).unwrap_or_default();
                        let has_children = block
                            .get("has_children")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                        if has_children && block_type != "child_page" {
                            if let Some(id) = block.get("id").and_then(|v| v.as_str()) {
                                queue.push_back(id.to_string());
                            }
                        }
                    }
                }
                let more = body.get("has_more").and_then(|v| v.as_bool()).unwrap_or(false);
                if !more {
                    break;
                }
                cursor = body
                    .get("next_cursor")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                if cursor.is_none() {
                    break;
                }
            }
        }
        Ok(lines.join("\n"))
    }

    async fn convert_page(&self, page: &Value) -> ConnectorResult<ConnectorItem> {
        let external_id = page
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::RequestFailed {
                status: 0,
                message: "page without id in Notion response".into(),
            })?
            .to_string();
        let title = page_title(page).unwrap_or_else(|| "Untitled".to_string());
        let content = self.page_markdown(&external_id).await?;
        let created_at = page
            .get("created_time")
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp);
        let updated_at = page
            .get("last_edited_time")
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp);
        let url = page.get("url").and_then(|v| v.as_str()).map(String::from);

        let metadata = json!({
            "object": page.get("object"),
            "archived": page.get("archived"),
        });
        let hash = sync_hash(&title, &content, updated_at.as_ref(), &metadata);
        let excerpt = extract_excerpt(&content, 300);

        Ok(ConnectorItem {
            id: ConnectorItem::namespaced_id(ConnectorType::Notion, &external_id),
            connector_id: self.config.id.clone(),
            external_id,
            knowledge_item_id: None,
            title,
            content,
            content_type: ContentType::Markdown,
            excerpt: Some(excerpt),
            source_url: url,
            source_path: None,
            source_type: Some("page".to_string()),
            author: None,
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
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Pull the title out of a page's properties: the property whose type is
/// `title`, regardless of its display name.
fn page_title(page: &Value) -> Option<String> {
    let properties = page.get("properties")?.as_object()?;
    for property in properties.values() {
        if property.get("type").and_then(|t| t.as_str()) != Some("title") {
            continue;
        }
        let fragments = property.get("title")?.as_array()?;
        let title: String = fragments
            .iter()
            .filter_map(|f| f.get("plain_text").and_then(|t| t.as_str()))
            .collect();
        if !title.is_empty() {
            return Some(title);
        }
    }
    None
}

fn rich_text_plain(block: &Value, block_type: &str) -> String {
    block
        .get(block_type)
        .and_then(|b| b.get("rich_text"))
        .and_then(|rt| rt.as_array())
        .map(|fragments| {
            fragments
                .iter()
                .filter_map(|f| f.get("plain_text").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Render one block as a line of Markdown; None for unsupported types.
fn render_block(block: &Value) -> Option<String> {
    let block_type = block.get("type").and_then(|t| t.as_str())?;
    let text = rich_text_plain(block, block_type);
    match block_type {
        "paragraph" => (!text.is_empty()).then_some(text),
        "heading_1" => Some(format!("# {}", text)),
        "heading_2" => Some(format!("## {}", text)),
        "heading_3" => Some(format!("### {}", text)),
        "bulleted_list_item" => Some(format!("- {}", text)),
        "numbered_list_item" => Some(format!("1. {}", text)),
        "to_do" => {
            let checked = block
                .pointer("/to_do/checked")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Some(format!("- [{}] {}", if checked { "x" } else { " " }, text))
        }
        "toggle" => Some(text),
        "code" => {
            let language = block
                .pointer("/code/language")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            Some(format!("```{}\n{}\n```", language, text))
        }
        "quote" | "callout" => Some(format!("> {}", text)),
        "divider" => Some("---".to_string()),
        _ => None,
    }
}

#[async_trait]
impl Connector for NotionConnector {
    fn connector_id(&self) -> &str {
        &self.config.id
    }

    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Notion
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
        let auth_probe = self.get_json("/v1/users/me").await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (authentication, connectivity) = match &auth_probe {
            Ok(_) => (
                HealthCheckEntry::pass(),
                HealthCheckEntry::pass().with_latency(latency_ms),
            ),
            Err(ConnectorError::AuthFailed { .. }) => {
                recommendations
                    .push("Invalid API token: check your Notion integration token".to_string());
                (
                    HealthCheckEntry::fail("authentication rejected (401)"),
                    HealthCheckEntry::pass().with_latency(latency_ms),
                )
            }
            Err(e) => {
                recommendations.push(format!("Notion is unreachable: {}", e));
                (
                    HealthCheckEntry::warn("could not verify credentials"),
                    HealthCheckEntry::fail(e.to_string()),
                )
            }
        };

        let permissions = match self
            .post_json(
                "/v1/search",
                json!({
                    "filter": {"value": "page", "property": "object"},
                    "page_size": 1
                }),
            )
            .await
        {
            Ok(body) => {
                let empty = body
                    .get("results")
                    .and_then(|r| r.as_array())
                    .map_or(true, |r| r.is_empty());
                if empty {
                    recommendations.push(
                        "The integration can see no pages: share the pages to sync with it in Notion"
                            .to_string(),
                    );
                    HealthCheckEntry::warn("no pages are shared with the integration")
                } else {
                    HealthCheckEntry::pass()
                }
            }
            Err(e) => HealthCheckEntry::fail(e.to_string()),
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
        info!(connector_id = %self.config.id, "starting notion full sync");

        let mut cursor: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                info!(connector_id = %self.config.id, "full sync cancelled");
                return run.finish(None, true);
            }
            let mut body = json!({
                "filter": {"value": "page", "property": "object"},
                "page_size": self.batch_size,
            });
            if let Some(c) = &cursor {
                body["start_cursor"] = json!(c);
            }
            let batch = match self.post_json("/v1/search", body).await {
                Ok(batch) => batch,
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
                match self.convert_page(page).await {
                    Ok(item) => run.push_new(item),
                    Err(e) => {
                        warn!(connector_id = %self.config.id, external_id = %external_id,
                            error = %e, "skipping page that failed to convert");
                        run.push_failed(external_id, page_title(page), &e);
                    }
                }
            }
            let more = batch.get("has_more").and_then(|v| v.as_bool()).unwrap_or(false);
            if !more {
                break;
            }
            cursor = batch
                .get("next_cursor")
                .and_then(|v| v.as_str())
                .map(String::from);
            if cursor.is_none() {
                break;
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
        let boundary = cursor
            .as_deref()
            .or(self.config.sync_cursor.as_deref())
            .and_then(parse_timestamp)
            .or(self.config.last_sync_at)
            .unwrap_or_default();
        let next_cursor = run.started_at().to_rfc3339();
        info!(connector_id = %self.config.id, since = %boundary, "starting notion incremental sync");

        // Search sorted by last edit, newest first; consuming stops at the
        // boundary so an incremental run never scans the whole corpus.
        let mut search_cursor: Option<String> = None;
        'pages: loop {
            if cancel.is_cancelled() {
                return run.finish(None, true);
            }
            let mut body = json!({
                "filter": {"value": "page", "property": "object"},
                "sort": {"direction": "descending", "timestamp": "last_edited_time"},
                "page_size": self.batch_size,
            });
            if let Some(c) = &search_cursor {
                body["start_cursor"] = json!(c);
            }
            let batch = match self.post_json("/v1/search", body).await {
                Ok(batch) => batch,
                Err(e) => return run.fail(&e),
            };
            let results = batch
                .get("results")
                .and_then(|r| r.as_array())
                .cloned()
                .unwrap_or_default();
            for page in &results {
                let edited = page
                    .get("last_edited_time")
                    .and_then(|v| v.as_str())
                    .and_then(parse_timestamp);
                if edited.map_or(false, |e| e <= boundary) {
                    debug!(connector_id = %self.config.id, "crossed last-sync boundary, stopping");
                    break 'pages;
                }
                let external_id = page
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                match self.convert_page(page).await {
                    Ok(item) => {
                        let created_after = item
                            .external_created_at
                            .map_or(false, |created| created > boundary);
                        if created_after {
                            run.push_new(item);
                        } else {
                            run.push_updated(item);
                        }
                    }
                    Err(e) => run.push_failed(external_id, page_title(page), &e),
                }
            }
            let more = batch.get("has_more").and_then(|v| v.as_bool()).unwrap_or(false);
            if !more {
                break;
            }
            search_cursor = batch
                .get("next_cursor")
                .and_then(|v| v.as_str())
                .map(String::from);
            if search_cursor.is_none() {
                break;
            }
        }
        run.finish(Some(next_cursor), false)
    }

    async fn fetch_item(&self, external_id: &str) -> ConnectorResult<Option<ConnectorItem>> {
        let path = format!("/v1/pages/{}", urlencoding::encode(external_id));
        match self.get_json(&path).await {
            Ok(page) => Ok(Some(self.convert_page(&page).await?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn search(
        &self,
        params: &ConnectorSearchParams,
        cancel: &CancellationToken,
    ) -> ConnectorResult<Vec<ConnectorItem>> {
        if cancel.is_cancelled() {
            return Ok(Vec::new());
        }
        let limit = params.limit.unwrap_or(25) as usize;
        let offset = params.offset.unwrap_or(0) as usize;
        let body = json!({
            "query": params.query,
            "filter": {"value": "page", "property": "object"},
            "page_size": (limit + offset).min(self.batch_size as usize),
        });
        let batch = self.post_json("/v1/search", body).await?;

        let mut items = Vec::new();
        if let Some(results) = batch.get("results").and_then(|r| r.as_array()) {
            for page in results {
                let edited = page
                    .get("last_edited_time")
                    .and_then(|v| v.as_str())
                    .and_then(parse_timestamp);
                let in_window = params
                    .modified_after
                    .map_or(true, |after| edited.map_or(false, |e| e >= after))
                    && params
                        .modified_before
                        .map_or(true, |before| edited.map_or(false, |e| e <= before));
                if !in_window {
                    continue;
                }
                items.push(self.convert_page(page).await?);
            }
        }
        Ok(items.into_iter().skip(offset).take(limit).collect())
    }
}
