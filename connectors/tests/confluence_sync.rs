use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use muniknow_connectors::confluence::ConfluenceConnector;
use muniknow_connectors::Connector;
use muniknow_models::{
    AuthType, ConnectorConfig, ConnectorStatus, ConnectorType, ContentType, HealthStatus,
    SyncResultStatus,
};

fn config(base_url: &str) -> ConnectorConfig {
    let mut config = ConnectorConfig::new("org-1", "wiki", ConnectorType::Confluence, AuthType::Basic);
    config.status = ConnectorStatus::Active;
    config.configuration = json!({
        "base_url": base_url,
        "space_keys": ["HR"],
    });
    config.auth_credentials.username = Some("svc@example.org".into());
    config.auth_credentials.password = Some("api-token".into());
    config
}

fn page(id: &str, title: &str, body: &str) -> serde_json::Value {
    json!({
        "id": id,
        "title": title,
        "body": {"storage": {"value": body}},
        "space": {"key": "HR"},
        "version": {"when": "2024-04-02T08:30:00Z", "number": 2},
        "history": {
            "createdDate": "2023-11-20T09:00:00Z",
            "createdBy": {"displayName": "Anna Berg"}
        },
        "_links": {"webui": format!("/spaces/HR/pages/{}", id)}
    })
}

#[tokio::test]
async fn full_sync_of_one_space_discovers_every_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/api/content"))
        .and(query_param("spaceKey", "HR"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                page("1", "Parental leave", "<p>Apply via the HR portal.</p>"),
                page("2", "Onboarding", "<p>Checklist for new hires.</p>"),
                page("3", "Travel policy", "<p>Book through the agency.</p>"),
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let connector = ConfluenceConnector::new(config(&server.uri())).unwrap();
    let output = connector.full_sync(&CancellationToken::new()).await;

    assert_eq!(output.result.status, SyncResultStatus::Success);
    assert_eq!(output.result.stats.total_discovered, 3);
    assert_eq!(output.result.stats.new_items, 3);
    assert!(output.result.stats.is_consistent());
    assert_eq!(output.items.len(), 3);
    assert_eq!(output.items[0].id, "confluence-1");
    assert_eq!(output.items[0].content_type, ContentType::Html);
    assert_eq!(
        output.items[0].excerpt.as_deref(),
        Some("Apply via the HR portal.")
    );
}

#[tokio::test]
async fn one_broken_page_does_not_abort_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/api/content"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                page("1", "Parental leave", "<p>ok</p>"),
                // No id: conversion fails, the item is recorded as failed.
                json!({"title": "Corrupt page"}),
                page("3", "Travel policy", "<p>ok</p>"),
            ]
        })))
        .mount(&server)
        .await;

    let connector = ConfluenceConnector::new(config(&server.uri())).unwrap();
    let output = connector.full_sync(&CancellationToken::new()).await;

    assert_eq!(output.result.status, SyncResultStatus::Partial);
    assert_eq!(output.result.stats.new_items, 2);
    assert_eq!(output.result.stats.failed_items, 1);
    assert!(output.result.stats.is_consistent());
    assert_eq!(output.result.errors.len(), 1);
    assert_eq!(output.result.errors[0].title.as_deref(), Some("Corrupt page"));
    assert_eq!(output.items.len(), 2);
}

#[tokio::test]
async fn rejected_credentials_make_the_health_check_unhealthy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let connector = ConfluenceConnector::new(config(&server.uri())).unwrap();
    let check = connector.test_connection().await;

    assert_eq!(check.status, HealthStatus::Unhealthy);
    assert_eq!(
        check.authentication.status,
        muniknow_models::CheckStatus::Fail
    );
    assert!(!check.recommendations.is_empty());
}

#[tokio::test]
async fn fetch_item_maps_not_found_to_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/api/content/99999"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let connector = ConfluenceConnector::new(config(&server.uri())).unwrap();
    let item = connector.fetch_item("99999").await.unwrap();
    assert!(item.is_none());
}

#[tokio::test]
async fn cancelled_sync_reports_more_work_remaining() {
    let server = MockServer::start().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let connector = ConfluenceConnector::new(config(&server.uri())).unwrap();
    let output = connector.full_sync(&cancel).await;

    assert_eq!(output.result.status, SyncResultStatus::Success);
    assert!(output.result.has_more);
    assert_eq!(output.result.stats.total_discovered, 0);
    // Nothing was requested from the server.
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn incremental_sync_classifies_new_against_the_boundary() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/api/content/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                // Created before the cursor boundary: an update.
                page("1", "Parental leave", "<p>revised</p>"),
                // Created after the boundary: new.
                json!({
                    "id": "7",
                    "title": "Remote work",
                    "body": {"storage": {"value": "<p>new policy</p>"}},
                    "space": {"key": "HR"},
                    "version": {"when": "2024-04-03T10:00:00Z", "number": 1},
                    "history": {"createdDate": "2024-04-03T09:00:00Z"}
                }),
            ]
        })))
        .mount(&server)
        .await;

    let connector = ConfluenceConnector::new(config(&server.uri())).unwrap();
    let output = connector
        .incremental_sync(Some("2024-01-01T00:00:00Z".into()), &CancellationToken::new())
        .await;

    assert_eq!(output.result.status, SyncResultStatus::Success);
    assert_eq!(output.result.stats.updated_items, 1);
    assert_eq!(output.result.stats.new_items, 1);
    assert!(output.result.cursor.is_some());
}
