use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use muniknow_models::{
    AuthCredentials, ConfigField, ConfigFieldType, ConnectorCapabilities, ConnectorConfig,
    ConnectorHealthCheck, ConnectorItem, ConnectorRegistration, ConnectorSearchParams,
    ConnectorStatus, ConnectorType, ConnectorWebhookEvent, ContentType, HealthCheckEntry,
    ItemSyncStatus,
};

use crate::base::{Connector, SyncOutput, SyncRun};
use crate::error::{ConnectorError, ConnectorResult};
use crate::http::{AuthorizedClient, TokenRefresher};
use crate::util::{extract_excerpt, sync_hash};

const DEFAULT_GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

/// SharePoint connector over Microsoft Graph. OAuth2 with refresh-token
/// support; files are walked per drive, folders themselves are not emitted.
pub struct SharepointConnector {
    config: ConnectorConfig,
    client: AuthorizedClient,
    graph_base: String,
    site_id: String,
}

/// Exchanges the refresh token at the Microsoft identity platform.
struct GraphTokenRefresher {
    http: reqwest::Client,
    token_url: String,
}

#[async_trait]
impl TokenRefresher for GraphTokenRefresher {
    async fn refresh(&self, credentials: &AuthCredentials) -> ConnectorResult<AuthCredentials> {
        let refresh_token = credentials
            .refresh_token
            .as_deref()
            .ok_or_else(|| ConnectorError::TokenRefreshFailed("no refresh token held".into()))?;
        let client_id = credentials.client_id.as_deref().unwrap_or_default();
        let client_secret = credentials.client_secret.as_deref().unwrap_or_default();

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("scope", "https://graph.microsoft.com/.default offline_access"),
            ])
            .send()
            .await
            .map_err(|e| ConnectorError::TokenRefreshFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::TokenRefreshFailed(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ConnectorError::TokenRefreshFailed(e.to_string()))?;
        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ConnectorError::TokenRefreshFailed("token response without access_token".into())
            })?;

        let mut fresh = credentials.clone();
        fresh.access_token = Some(access_token.to_string());
        if let Some(rt) = body.get("refresh_token").and_then(|v| v.as_str()) {
            fresh.refresh_token = Some(rt.to_string());
        }
        if let Some(expires_in) = body.get("expires_in").and_then(|v| v.as_i64()) {
            fresh.token_expires_at = Some(Utc::now() + Duration::seconds(expires_in));
        }
        Ok(fresh)
    }
}

impl SharepointConnector {
    pub fn new(config: ConnectorConfig) -> ConnectorResult<Self> {
        let site_id = config
            .setting_str("site_id")
            .ok_or_else(|| {
                ConnectorError::Configuration("sharepoint connector requires site_id".into())
            })?
            .to_string();
        let graph_base = config
            .setting_str("graph_base_url")
            .unwrap_or(DEFAULT_GRAPH_BASE)
            .trim_end_matches('/')
            .to_string();

        let mut client = AuthorizedClient::new(
            config.auth_type,
            config.auth_credentials.clone(),
            Self::static_capabilities().rate_limit_rpm,
        );
        if let Some(token_url) = Self::token_url(&config) {
            client = client.with_refresher(Arc::new(GraphTokenRefresher {
                http: reqwest::Client::new(),
                token_url,
            }));
        }

        Ok(Self {
            config,
            client,
            graph_base,
            site_id,
        })
    }

    fn token_url(config: &ConnectorConfig) -> Option<String> {
        if let Some(url) = config.setting_str("token_url") {
            return Some(url.to_string());
        }
        config.auth_credentials.tenant_id.as_ref().map(|tenant| {
            format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                tenant
            )
        })
    }

    fn static_capabilities() -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_full_sync: true,
            supports_incremental_sync: true,
            supports_webhooks: true,
            supports_search: true,
            supports_permissions: true,
            supports_attachments: true,
            supports_comments: false,
            supports_versions: true,
            rate_limit_rpm: 120,
            max_batch_size: 200,
        }
    }

    pub fn registration() -> ConnectorRegistration {
        ConnectorRegistration {
            connector_type: ConnectorType::Sharepoint,
            display_name: "SharePoint".to_string(),
            description: "Syncs files from SharePoint document libraries via Microsoft Graph"
                .to_string(),
            capabilities: Self::static_capabilities(),
            config_fields: vec![
                ConfigField::new("site_id", "Site", ConfigFieldType::Text, true)
                    .with_placeholder("contoso.sharepoint.com:/sites/intranet:")
                    .with_help("Graph site id or hostname:/sites/name: path"),
                ConfigField::new("tenant_id", "Tenant ID", ConfigFieldType::Text, true),
                ConfigField::new("client_id", "Client ID", ConfigFieldType::Text, true),
                ConfigField::new("client_secret", "Client secret", ConfigFieldType::Password, true),
            ],
        }
    }

    async fn get_json_abs(&self, url: &str) -> ConnectorResult<Value> {
        let response = self.client.send(|http| http.get(url)).await?;
        response.json::<Value>().await.map_err(ConnectorError::from)
    }

    async fn get_json(&self, path_and_query: &str) -> ConnectorResult<Value> {
        self.get_json_abs(&format!("{}{}", self.graph_base, path_and_query))
            .await
    }

    async fn resolve_site_id(&self) -> ConnectorResult<String> {
        let site = self
            .get_json(&format!("/sites/{}", urlencoding::encode(&self.site_id)))
            .await?;
        site.get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| ConnectorError::RequestFailed {
                status: 0,
                message: format!("could not resolve SharePoint site '{}'", self.site_id),
            })
    }

    async fn list_drives(&self, site_id: &str) -> ConnectorResult<Vec<String>> {
        let body = self.get_json(&format!("/sites/{}/drives", site_id)).await?;
        Ok(body
            .get("value")
            .and_then(|v| v.as_array())
            .map(|drives| {
                drives
                    .iter()
                    .filter_map(|d| d.get("id").and_then(|v| v.as_str()).map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn download_text(&self, drive_id: &str, item_id: &str) -> ConnectorResult<String> {
        let url = format!(
            "{}/drives/{}/items/{}/content",
            self.graph_base, drive_id, item_id
        );
        let response = self
            .client
            .send(|http| http.get(&url))
            .await
            .map_err(|e| ConnectorError::DownloadFailed {
                external_id: format!("{}:{}", drive_id, item_id),
                message: e.to_string(),
            })?;
        response
            .text()
            .await
            .map_err(|e| ConnectorError::DownloadFailed {
                external_id: format!("{}:{}", drive_id, item_id),
                message: e.to_string(),
            })
    }

    /// Convert one Graph driveItem into the common item shape.
    ///
    /// Text-like files are downloaded; everything else gets a placeholder
    /// body so the item is still indexed by name and metadata.
    async fn convert_drive_item(
        &self,
        drive_id: &str,
        item: &Value,
        download: bool,
    ) -> ConnectorResult<ConnectorItem> {
        let item_id = item
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ConnectorError::RequestFailed {
                status: 0,
                message: "driveItem without id in Graph response".into(),
            })?;
        let external_id = format!("{}:{}", drive_id, item_id);
        let name = item
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("Unnamed")
            .to_string();
        let mime = item
            .pointer("/file/mimeType")
            .and_then(|v| v.as_str())
            .unwrap_or("application/octet-stream")
            .to_string();
        let created_at = item
            .get("createdDateTime")
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp);
        let updated_at = item
            .get("lastModifiedDateTime")
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp);
        let author = item
            .pointer("/createdBy/user/displayName")
            .and_then(|v| v.as_str())
            .map(String::from);
        let parent_path = item
            .pointer("/parentReference/path")
            .and_then(|v| v.as_str())
            .map(String::from);
        let web_url = item
            .get("webUrl")
            .and_then(|v| v.as_str())
            .map(String::from);

        let content = if download && is_text_mime(&mime) {
            self.download_text(drive_id, item_id).await?
        } else {
            format!("[file: {} ({})]", name, mime)
        };

        let metadata = serde_json::json!({
            "drive_id": drive_id,
            "mime_type": mime,
            "size": item.get("size").and_then(|v| v.as_u64()),
        });
        let hash = sync_hash(&name, &content, updated_at.as_ref(), &metadata);
        let excerpt = extract_excerpt(&content, 300);

        Ok(ConnectorItem {
            id: ConnectorItem::namespaced_id(ConnectorType::Sharepoint, &external_id),
            connector_id: self.config.id.clone(),
            external_id,
            knowledge_item_id: None,
            title: name,
            content,
            content_type: content_type_for_mime(&mime),
            excerpt: Some(excerpt),
            source_url: web_url,
            source_path: parent_path,
            source_type: Some("file".to_string()),
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

    fn deleted_item(&self, drive_id: &str, item: &Value) -> ConnectorItem {
        let item_id = item.get("id").and_then(|v| v.as_str()).unwrap_or("");
        let external_id = format!("{}:{}", drive_id, item_id);
        let name = item
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("Deleted file")
            .to_string();
        ConnectorItem {
            id: ConnectorItem::namespaced_id(ConnectorType::Sharepoint, &external_id),
            connector_id: self.config.id.clone(),
            external_id,
            knowledge_item_id: None,
            title: name,
            content: String::new(),
            content_type: ContentType::Text,
            excerpt: None,
            source_url: None,
            source_path: None,
            source_type: Some("file".to_string()),
            author: None,
            external_created_at: None,
            external_updated_at: None,
            synced_at: Utc::now(),
            sync_hash: String::new(),
            sync_status: ItemSyncStatus::Deleted,
            sync_error: None,
            metadata: serde_json::json!({"drive_id": drive_id}),
            tags: None,
            permissions: None,
        }
    }

    fn parse_delta_cursor(cursor: Option<&str>) -> HashMap<String, String> {
        cursor
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn is_text_mime(mime: &str) -> bool {
    mime.starts_with("text/") || mime == "application/json"
}

fn content_type_for_mime(mime: &str) -> ContentType {
    match mime {
        "text/html" => ContentType::Html,
        "text/markdown" => ContentType::Markdown,
        "application/pdf" => ContentType::Pdf,
        m if m.contains("wordprocessingml") || m == "application/msword" => ContentType::Doc,
        _ => ContentType::Text,
    }
}

#[async_trait]
impl Connector for SharepointConnector {
    fn connector_id(&self) -> &str {
        &self.config.id
    }

    fn connector_type(&self) -> ConnectorType {
        ConnectorType::Sharepoint
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
        let auth_probe = self.resolve_site_id().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (authentication, connectivity, site_id) = match auth_probe {
            Ok(id) => (
                HealthCheckEntry::pass(),
                HealthCheckEntry::pass().with_latency(latency_ms),
                Some(id),
            ),
            Err(ConnectorError::AuthFailed { .. }) => {
                recommendations.push(
                    "Microsoft Graph rejected the token: re-consent the app registration or renew the client secret"
                        .to_string(),
                );
                (
                    HealthCheckEntry::fail("authentication rejected (401)"),
                    HealthCheckEntry::pass().with_latency(latency_ms),
                    None,
                )
            }
            Err(e) => {
                recommendations.push(format!("Microsoft Graph is unreachable: {}", e));
                (
                    HealthCheckEntry::warn("could not verify credentials"),
                    HealthCheckEntry::fail(e.to_string()),
                    None,
                )
            }
        };

        let permissions = match &site_id {
            Some(id) => match self.list_drives(id).await {
                Ok(_) => HealthCheckEntry::pass(),
                Err(e) => {
                    recommendations.push(
                        "The app cannot list drives: grant it Sites.Read.All or Files.Read.All"
                            .to_string(),
                    );
                    HealthCheckEntry::fail(e.to_string())
                }
            },
            None => HealthCheckEntry::warn("skipped, site could not be resolved"),
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
        info!(connector_id = %self.config.id, site = %self.site_id, "starting sharepoint full sync");

        let site_id = match self.resolve_site_id().await {
            Ok(id) => id,
            Err(e) => return run.fail(&e),
        };
        let drives = match self.list_drives(&site_id).await {
            Ok(drives) => drives,
            Err(e) => return run.fail(&e),
        };

        for drive_id in &drives {
            // Explicit work queue instead of recursion: bounded stack depth on
            // deep folder trees, and the walk stays cancellable per folder.
            let mut folders: VecDeque<String> = VecDeque::from(["root".to_string()]);
            while let Some(folder_id) = folders.pop_front() {
                if cancel.is_cancelled() {
                    info!(connector_id = %self.config.id, "full sync cancelled");
                    return run.finish(None, true);
                }
                let mut next_url = Some(format!(
                    "{}/drives/{}/items/{}/children",
                    self.graph_base, drive_id, folder_id
                ));
                while let Some(url) = next_url.take() {
                    let body = match self.get_json_abs(&url).await {
                        Ok(body) => body,
                        Err(e) => return run.fail(&e),
                    };
                    if let Some(children) = body.get("value").and_then(|v| v.as_array()) {
                        for child in children {
                            if child.get("folder").is_some() {
                                if let Some(id) = child.get("id").and_then(|v| v.as_str()) {
                                    folders.push_back(id.to_string());
                                }
                                continue;
                            }
                            if child.get("file").is_none() {
                                continue;
                            }
                            let external_id = format!(
                                "{}:{}",
                                drive_id,
                                child.get("id").and_then(|v| v.as_str()).unwrap_or("")
                            );
                            match self.convert_drive_item(drive_id, child, true).await {
                                Ok(item) => run.push_new(item),
                                Err(e) => {
                                    warn!(connector_id = %self.config.id, external_id = %external_id,
                                        error = %e, "skipping file that failed to convert");
                                    let title = child
                                        .get("name")
                                        .and_then(|v| v.as_str())
                                        .map(String::from);
                                    run.push_failed(external_id, title, &e);
                                }
                            }
                        }
                    }
                    next_url = body
                        .get("@odata.nextLink")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                }
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
        let boundary = self.config.last_sync_at.unwrap_or_default();
        let mut delta_links =
            Self::parse_delta_cursor(cursor.as_deref().or(self.config.sync_cursor.as_deref()));
        info!(connector_id = %self.config.id, "starting sharepoint incremental sync");

        let site_id = match self.resolve_site_id().await {
            Ok(id) => id,
            Err(e) => return run.fail(&e),
        };
        let drives = match self.list_drives(&site_id).await {
            Ok(drives) => drives,
            Err(e) => return run.fail(&e),
        };

        let mut next_links: HashMap<String, String> = HashMap::new();
        for drive_id in &drives {
            let mut url = delta_links.remove(drive_id).unwrap_or_else(|| {
                format!("{}/drives/{}/root/delta", self.graph_base, drive_id)
            });
            loop {
                if cancel.is_cancelled() {
                    return run.finish(None, true);
                }
                let body = match self.get_json_abs(&url).await {
                    Ok(body) => body,
                    Err(e) => return run.fail(&e),
                };
                if let Some(changes) = body.get("value").and_then(|v| v.as_array()) {
                    for change in changes {
                        if change.get("deleted").is_some() {
                            run.push_deleted(self.deleted_item(drive_id, change));
                            continue;
                        }
                        if change.get("file").is_none() {
                            continue;
                        }
                        let external_id = format!(
                            "{}:{}",
                            drive_id,
                            change.get("id").and_then(|v| v.as_str()).unwrap_or("")
                        );
                        match self.convert_drive_item(drive_id, change, true).await {
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
                            Err(e) => {
                                let title = change
                                    .get("name")
                                    .and_then(|v| v.as_str())
                                    .map(String::from);
                                run.push_failed(external_id, title, &e);
                            }
                        }
                    }
                }
                if let Some(next) = body.get("@odata.nextLink").and_then(|v| v.as_str()) {
                    url = next.to_string();
                    continue;
                }
                if let Some(delta) = body.get("@odata.deltaLink").and_then(|v| v.as_str()) {
                    next_links.insert(drive_id.clone(), delta.to_string());
                }
                break;
            }
        }

        // The fresh delta links only become the cursor after every change in
        // this round has been processed.
        let cursor = serde_json::to_string(&next_links).ok();
        run.finish(cursor, false)
    }

    async fn fetch_item(&self, external_id: &str) -> ConnectorResult<Option<ConnectorItem>> {
        let (drive_id, item_id) = external_id.split_once(':').ok_or_else(|| {
            ConnectorError::Configuration(format!(
                "sharepoint external id must be '<drive>:<item>', got '{}'",
                external_id
            ))
        })?;
        match self
            .get_json(&format!("/drives/{}/items/{}", drive_id, item_id))
            .await
        {
            Ok(item) => Ok(Some(self.convert_drive_item(drive_id, &item, true).await?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn search(
        &self,
        params: &ConnectorSearchParams,
        cancel: &CancellationToken,
    ) -> ConnectorResult<Vec<ConnectorItem>> {
        let site_id = self.resolve_site_id().await?;
        let drives = self.list_drives(&site_id).await?;
        let limit = params.limit.unwrap_or(25) as usize;
        let offset = params.offset.unwrap_or(0) as usize;

        let mut items = Vec::new();
        for drive_id in &drives {
            if cancel.is_cancelled() {
                break;
            }
            let query = format!(
                "/drives/{}/root/search(q='{}')?$top={}",
                drive_id,
                urlencoding::encode(&params.query.replace('\'', "''")),
                limit + offset
            );
            let body = self.get_json(&query).await?;
            if let Some(results) = body.get("value").and_then(|v| v.as_array()) {
                for result in results {
                    if result.get("file").is_none() {
                        continue;
                    }
                    // Metadata-only conversion; search results are previews,
                    // callers fetch the full body via fetch_item.
                    let item = self.convert_drive_item(drive_id, result, false).await?;
                    let matches_window = params
                        .modified_after
                        .map_or(true, |after| item.external_updated_at.map_or(false, |u| u >= after))
                        && params
                            .modified_before
                            .map_or(true, |before| item.external_updated_at.map_or(false, |u| u <= before));
                    if matches_window {
                        items.push(item);
                    }
                }
            }
        }
        debug!(connector_id = %self.config.id, hits = items.len(), "sharepoint search finished");
        Ok(items.into_iter().skip(offset).take(limit).collect())
    }

    async fn refresh_tokens(&self) -> ConnectorResult<Option<AuthCredentials>> {
        self.client.refresh_credentials().await
    }

    async fn handle_webhook(&self, event: &ConnectorWebhookEvent) -> ConnectorResult<()> {
        // Graph change notifications carry no payload body; the event marks
        // the drive as dirty and the next incremental sync picks up the delta.
        info!(connector_id = %self.config.id, event_type = %event.event_type,
            external_id = %event.external_id, "received sharepoint webhook");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muniknow_models::AuthType;

    fn config() -> ConnectorConfig {
        let mut config = ConnectorConfig::new(
            "org-1",
            "intranet",
            ConnectorType::Sharepoint,
            AuthType::Oauth2,
        );
        config.configuration = serde_json::json!({
            "site_id": "contoso.sharepoint.com:/sites/intranet:",
        });
        config.auth_credentials.access_token = Some("tok".into());
        config.auth_credentials.refresh_token = Some("refresh".into());
        config.auth_credentials.tenant_id = Some("tenant-1".into());
        config
    }

    #[test]
    fn token_url_derived_from_tenant() {
        let url = SharepointConnector::token_url(&config()).unwrap();
        assert_eq!(
            url,
            "https://login.microsoftonline.com/tenant-1/oauth2/v2.0/token"
        );
    }

    #[test]
    fn delta_cursor_roundtrip() {
        let mut links = HashMap::new();
        links.insert("d1".to_string(), "https://graph/delta?token=x".to_string());
        let raw = serde_json::to_string(&links).unwrap();
        let parsed = SharepointConnector::parse_delta_cursor(Some(&raw));
        assert_eq!(parsed, links);
        assert!(SharepointConnector::parse_delta_cursor(None).is_empty());
        assert!(SharepointConnector::parse_delta_cursor(Some("not json")).is_empty());
    }

    #[test]
    fn mime_mapping() {
        assert_eq!(content_type_for_mime("application/pdf"), ContentType::Pdf);
        assert_eq!(content_type_for_mime("text/html"), ContentType::Html);
        assert_eq!(
            content_type_for_mime(
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            ),
            ContentType::Doc
        );
        assert_eq!(content_type_for_mime("image/png"), ContentType::Text);
        assert!(is_text_mime("text/plain"));
        assert!(!is_text_mime("application/pdf"));
    }
}
