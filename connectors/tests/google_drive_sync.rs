use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use muniknow_connectors::google_drive::GoogleDriveConnector;
use muniknow_connectors::Connector;
use muniknow_models::{
    AuthType, ConnectorConfig, ConnectorStatus, ConnectorType, ContentType, HealthStatus,
    ItemSyncStatus, SyncResultStatus,
};

fn config(server: &MockServer) -> ConnectorConfig {
    let mut config = ConnectorConfig::new(
        "org-1",
        "shared drive",
        ConnectorType::GoogleDrive,
        AuthType::Oauth2,
    );
    config.status = ConnectorStatus::Active;
    config.configuration = json!({
        "api_base_url": server.uri(),
        "token_url": format!("{}/token", server.uri()),
    });
    config.auth_credentials.access_token = Some("tok".into());
    config.auth_credentials.refresh_token = Some("rt-1".into());
    config
}

#[tokio::test]
async fn fetching_a_google_doc_exports_its_text() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/doc-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "doc-1",
            "name": "Quarterly plan",
            "mimeType": "application/vnd.google-apps.document",
            "webViewLink": "https://docs.google.com/document/d/doc-1",
            "createdTime": "2024-01-10T08:00:00Z",
            "modifiedTime": "2024-02-20T16:30:00Z",
            "owners": [{"displayName": "Kari Holm"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/doc-1/export"))
        .and(query_param("mimeType", "text/plain"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Q2 goals and milestones."))
        .mount(&server)
        .await;

    let connector = GoogleDriveConnector::new(config(&server)).unwrap();
    let item = connector.fetch_item("doc-1").await.unwrap().unwrap();

    assert_eq!(item.id, "google_drive-doc-1");
    assert_eq!(item.content_type, ContentType::Doc);
    assert_eq!(item.content, "Q2 goals and milestones.");
    assert_eq!(item.author.as_deref(), Some("Kari Holm"));
}

#[tokio::test]
async fn fetch_item_maps_not_found_to_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let connector = GoogleDriveConnector::new(config(&server)).unwrap();
    assert!(connector.fetch_item("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn change_feed_yields_deletions_and_a_new_start_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/changes"))
        .and(query_param("pageToken", "t0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [
                {"fileId": "gone", "removed": true},
                {
                    "fileId": "f2",
                    "removed": false,
                    "file": {
                        "id": "f2",
                        "name": "notes.txt",
                        "mimeType": "text/plain",
                        "trashed": false,
                        "createdTime": "2024-02-15T08:00:00Z",
                        "modifiedTime": "2024-02-16T08:00:00Z"
                    }
                },
                {
                    // Outside the MIME allow-list, silently skipped.
                    "fileId": "img",
                    "removed": false,
                    "file": {"id": "img", "name": "logo.png", "mimeType": "image/png"}
                }
            ],
            "newStartPageToken": "t1"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/f2"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_string("meeting notes"))
        .mount(&server)
        .await;

    let connector = GoogleDriveConnector::new(config(&server)).unwrap();
    let output = connector
        .incremental_sync(Some("t0".into()), &CancellationToken::new())
        .await;

    assert_eq!(output.result.status, SyncResultStatus::Success);
    assert_eq!(output.result.stats.deleted_items, 1);
    assert_eq!(output.result.stats.new_items, 1);
    assert!(output.result.stats.is_consistent());
    assert_eq!(output.result.cursor.as_deref(), Some("t1"));

    let deleted = output
        .items
        .iter()
        .find(|i| i.sync_status == ItemSyncStatus::Deleted)
        .unwrap();
    assert_eq!(deleted.external_id, "gone");
}

#[tokio::test]
async fn first_incremental_run_establishes_a_change_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/changes/startPageToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"startPageToken": "t0"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/changes"))
        .and(query_param("pageToken", "t0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [],
            "newStartPageToken": "t0"
        })))
        .mount(&server)
        .await;

    let connector = GoogleDriveConnector::new(config(&server)).unwrap();
    let output = connector
        .incremental_sync(None, &CancellationToken::new())
        .await;

    assert_eq!(output.result.status, SyncResultStatus::Success);
    assert_eq!(output.result.stats.total_discovered, 0);
    assert_eq!(output.result.cursor.as_deref(), Some("t0"));
}

#[tokio::test]
async fn expired_token_is_refreshed_and_the_request_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/about"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/about"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user": {"displayName": "svc"},
            "storageQuota": {"usage": "10", "limit": "1000"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"files": []})))
        .mount(&server)
        .await;

    let mut config = config(&server);
    config.auth_credentials.access_token = Some("stale".into());
    let connector = GoogleDriveConnector::new(config).unwrap();

    let check = connector.test_connection().await;
    assert_eq!(check.status, HealthStatus::Healthy);
}

#[tokio::test]
async fn near_full_storage_degrades_the_health_check() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/about"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user": {"displayName": "svc"},
            "storageQuota": {"usage": "95", "limit": "100"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"files": []})))
        .mount(&server)
        .await;

    let connector = GoogleDriveConnector::new(config(&server)).unwrap();
    let check = connector.test_connection().await;

    assert_eq!(check.status, HealthStatus::Degraded);
    assert!(check
        .recommendations
        .iter()
        .any(|r| r.contains("storage")));
}
