use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use muniknow_models::{ConnectorConfig, ConnectorRegistration, ConnectorType};

use crate::base::Connector;
use crate::confluence::ConfluenceConnector;
use crate::error::{ConnectorError, ConnectorResult};
use crate::google_drive::GoogleDriveConnector;
use crate::notion::NotionConnector;
use crate::sharepoint::SharepointConnector;

/// Builds a connector instance from its durable configuration.
pub type ConnectorConstructor =
    Box<dyn Fn(ConnectorConfig) -> ConnectorResult<Arc<dyn Connector>> + Send + Sync>;

struct FactoryEntry {
    registration: ConnectorRegistration,
    constructor: ConnectorConstructor,
}

/// Registration table mapping each connector type to its constructor and the
/// metadata configuration UIs need. Seeded with the built-in vendors;
/// [`ConnectorFactory::register_connector`] extends the set without touching
/// the factory itself.
pub struct ConnectorFactory {
    entries: HashMap<ConnectorType, FactoryEntry>,
}

impl ConnectorFactory {
    /// Factory with the four built-in vendors registered.
    pub fn new() -> Self {
        let mut factory = Self::empty();
        factory.register_connector(
            ConfluenceConnector::registration(),
            Box::new(|config| {
                let connector = ConfluenceConnector::new(config)?;
                Ok(Arc::new(connector) as Arc<dyn Connector>)
            }),
        );
        factory.register_connector(
            SharepointConnector::registration(),
            Box::new(|config| {
                let connector = SharepointConnector::new(config)?;
                Ok(Arc::new(connector) as Arc<dyn Connector>)
            }),
        );
        factory.register_connector(
            NotionConnector::registration(),
            Box::new(|config| {
                let connector = NotionConnector::new(config)?;
                Ok(Arc::new(connector) as Arc<dyn Connector>)
            }),
        );
        factory.register_connector(
            GoogleDriveConnector::registration(),
            Box::new(|config| {
                let connector = GoogleDriveConnector::new(config)?;
                Ok(Arc::new(connector) as Arc<dyn Connector>)
            }),
        );
        factory
    }

    /// Factory with no registrations, for callers assembling a custom set.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register (or replace) the implementation for a connector type.
    pub fn register_connector(
        &mut self,
        registration: ConnectorRegistration,
        constructor: ConnectorConstructor,
    ) {
        debug!(connector_type = %registration.connector_type, "registering connector type");
        self.entries.insert(
            registration.connector_type,
            FactoryEntry {
                registration,
                constructor,
            },
        );
    }

    /// Construct a connector instance for the config's declared type.
    pub fn create(&self, config: ConnectorConfig) -> ConnectorResult<Arc<dyn Connector>> {
        let entry = self.entries.get(&config.connector_type).ok_or_else(|| {
            ConnectorError::UnknownConnectorType(config.connector_type.to_string())
        })?;
        (entry.constructor)(config)
    }

    pub fn registration(&self, connector_type: ConnectorType) -> Option<&ConnectorRegistration> {
        self.entries.get(&connector_type).map(|e| &e.registration)
    }

    /// All registrations, for configuration UIs listing available vendors.
    pub fn registrations(&self) -> Vec<&ConnectorRegistration> {
        self.entries.values().map(|e| &e.registration).collect()
    }
}

impl Default for ConnectorFactory {
    fn default() -> Self {
        Self::new()
    }
}
