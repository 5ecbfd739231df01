use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use muniknow_models::{ConnectorConfig, ConnectorStatus, HealthStatus, SyncResultStatus};

use crate::base::Connector;
use crate::error::ConnectorResult;
use crate::factory::ConnectorFactory;

/// Live set of initialized connector instances for one organization.
///
/// Orchestrates health checks and bulk syncs across all of them; one
/// connector's failure never aborts the others, and no ordering is guaranteed
/// across connectors.
pub struct ConnectorManager {
    factory: ConnectorFactory,
    connectors: RwLock<HashMap<String, Arc<dyn Connector>>>,
}

impl ConnectorManager {
    pub fn new() -> Self {
        Self::with_factory(ConnectorFactory::new())
    }

    pub fn with_factory(factory: ConnectorFactory) -> Self {
        Self {
            factory,
            connectors: RwLock::new(HashMap::new()),
        }
    }

    /// Construct a connector from its config via the factory and register it.
    pub async fn initialize_connector(&self, config: ConnectorConfig) -> ConnectorResult<()> {
        let id = config.id.clone();
        let connector = self.factory.create(config)?;
        self.connectors.write().await.insert(id.clone(), connector);
        info!(connector_id = %id, "connector initialized");
        Ok(())
    }

    pub async fn remove_connector(&self, connector_id: &str) -> bool {
        self.connectors.write().await.remove(connector_id).is_some()
    }

    pub async fn get(&self, connector_id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.read().await.get(connector_id).cloned()
    }

    pub async fn list_ids(&self) -> Vec<String> {
        self.connectors.read().await.keys().cloned().collect()
    }

    /// Run `test_connection` across all registered connectors and map each to
    /// a healthy/unhealthy flag. Health checks are total, so nothing here can
    /// propagate an error.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let connectors: Vec<(String, Arc<dyn Connector>)> = {
            let guard = self.connectors.read().await;
            guard
                .iter()
                .map(|(id, c)| (id.clone(), Arc::clone(c)))
                .collect()
        };

        let checks = join_all(connectors.into_iter().map(|(id, connector)| async move {
            let check = connector.test_connection().await;
            (id, check.status != HealthStatus::Unhealthy)
        }))
        .await;

        checks.into_iter().collect()
    }

    /// Sync every `Active` connector, incrementally or fully. Returns a map
    /// of connector id to success; a failed sync is recorded and the loop
    /// moves on to the next connector.
    pub async fn sync_all(
        &self,
        incremental: bool,
        cancel: &CancellationToken,
    ) -> HashMap<String, bool> {
        let connectors: Vec<(String, Arc<dyn Connector>)> = {
            let guard = self.connectors.read().await;
            guard
                .iter()
                .map(|(id, c)| (id.clone(), Arc::clone(c)))
                .collect()
        };

        let mut results = HashMap::new();
        for (id, connector) in connectors {
            if connector.status() != ConnectorStatus::Active {
                info!(connector_id = %id, status = ?connector.status(), "skipping inactive connector");
                continue;
            }
            let output = if incremental {
                connector.incremental_sync(None, cancel).await
            } else {
                connector.full_sync(cancel).await
            };
            let succeeded = output.result.status != SyncResultStatus::Failed;
            if succeeded {
                info!(connector_id = %id, discovered = output.result.stats.total_discovered,
                    status = ?output.result.status, "connector sync finished");
            } else {
                warn!(connector_id = %id, errors = output.result.errors.len(),
                    "connector sync failed");
            }
            results.insert(id, succeeded);
        }
        results
    }
}

impl Default for ConnectorManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{SyncOutput, SyncRun};
    use crate::error::ConnectorError;
    use async_trait::async_trait;
    use muniknow_models::{
        AuthType, ConnectorCapabilities, ConnectorHealthCheck, ConnectorItem,
        ConnectorRegistration, ConnectorSearchParams, ConnectorType, HealthCheckEntry,
    };

    struct FakeConnector {
        id: String,
        status: ConnectorStatus,
        healthy: bool,
        sync_fails: bool,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        fn connector_id(&self) -> &str {
            &self.id
        }

        fn connector_type(&self) -> ConnectorType {
            ConnectorType::Notion
        }

        fn status(&self) -> ConnectorStatus {
            self.status
        }

        fn capabilities(&self) -> ConnectorCapabilities {
            NotionRegistration::capabilities()
        }

        async fn test_connection(&self) -> ConnectorHealthCheck {
            let auth = if self.healthy {
                HealthCheckEntry::pass()
            } else {
                HealthCheckEntry::fail("boom")
            };
            ConnectorHealthCheck::from_checks(
                auth,
                HealthCheckEntry::pass(),
                HealthCheckEntry::pass(),
                HealthCheckEntry::pass(),
                vec![],
            )
        }

        async fn full_sync(&self, _cancel: &CancellationToken) -> SyncOutput {
            let run = SyncRun::new();
            if self.sync_fails {
                run.fail(&ConnectorError::RequestFailed {
                    status: 503,
                    message: "down".into(),
                })
            } else {
                run.finish(None, false)
            }
        }

        async fn incremental_sync(
            &self,
            _cursor: Option<String>,
            cancel: &CancellationToken,
        ) -> SyncOutput {
            self.full_sync(cancel).await
        }

        async fn fetch_item(
            &self,
            _external_id: &str,
        ) -> crate::error::ConnectorResult<Option<ConnectorItem>> {
            Ok(None)
        }

        async fn search(
            &self,
            _params: &ConnectorSearchParams,
            _cancel: &CancellationToken,
        ) -> crate::error::ConnectorResult<Vec<ConnectorItem>> {
            Ok(Vec::new())
        }
    }

    struct NotionRegistration;

    impl NotionRegistration {
        fn capabilities() -> ConnectorCapabilities {
            ConnectorCapabilities {
                supports_full_sync: true,
                supports_incremental_sync: true,
                supports_webhooks: false,
                supports_search: true,
                supports_permissions: false,
                supports_attachments: false,
                supports_comments: false,
                supports_versions: false,
                rate_limit_rpm: 60,
                max_batch_size: 50,
            }
        }

        fn registration() -> ConnectorRegistration {
            ConnectorRegistration {
                connector_type: ConnectorType::Notion,
                display_name: "Fake".into(),
                description: "test double".into(),
                capabilities: Self::capabilities(),
                config_fields: vec![],
            }
        }
    }

    async fn manager_with(fakes: Vec<FakeConnector>) -> ConnectorManager {
        let manager = ConnectorManager::with_factory(ConnectorFactory::empty());
        for fake in fakes {
            let id = fake.id.clone();
            manager
                .connectors
                .write()
                .await
                .insert(id, Arc::new(fake) as Arc<dyn Connector>);
        }
        manager
    }

    #[tokio::test]
    async fn health_check_all_maps_ids_to_health() {
        let manager = manager_with(vec![
            FakeConnector {
                id: "good".into(),
                status: ConnectorStatus::Active,
                healthy: true,
                sync_fails: false,
            },
            FakeConnector {
                id: "bad".into(),
                status: ConnectorStatus::Active,
                healthy: false,
                sync_fails: false,
            },
        ])
        .await;

        let results = manager.health_check_all().await;
        assert_eq!(results.get("good"), Some(&true));
        assert_eq!(results.get("bad"), Some(&false));
    }

    #[tokio::test]
    async fn sync_all_skips_inactive_and_isolates_failures() {
        let manager = manager_with(vec![
            FakeConnector {
                id: "active-ok".into(),
                status: ConnectorStatus::Active,
                healthy: true,
                sync_fails: false,
            },
            FakeConnector {
                id: "active-broken".into(),
                status: ConnectorStatus::Active,
                healthy: true,
                sync_fails: true,
            },
            FakeConnector {
                id: "paused".into(),
                status: ConnectorStatus::Inactive,
                healthy: true,
                sync_fails: false,
            },
        ])
        .await;

        let cancel = CancellationToken::new();
        let results = manager.sync_all(false, &cancel).await;
        assert_eq!(results.get("active-ok"), Some(&true));
        assert_eq!(results.get("active-broken"), Some(&false));
        assert!(!results.contains_key("paused"));
    }

    #[tokio::test]
    async fn initialize_registers_instance() {
        let mut factory = ConnectorFactory::empty();
        factory.register_connector(
            NotionRegistration::registration(),
            Box::new(|config| {
                Ok(Arc::new(FakeConnector {
                    id: config.id,
                    status: ConnectorStatus::Active,
                    healthy: true,
                    sync_fails: false,
                }) as Arc<dyn Connector>)
            }),
        );
        let manager = ConnectorManager::with_factory(factory);
        let config = ConnectorConfig::new("org-1", "notes", ConnectorType::Notion, AuthType::Bearer);
        let id = config.id.clone();
        manager.initialize_connector(config).await.unwrap();
        assert!(manager.get(&id).await.is_some());
        assert_eq!(manager.list_ids().await, vec![id.clone()]);
        assert!(manager.remove_connector(&id).await);
        assert!(manager.get(&id).await.is_none());
    }
}
