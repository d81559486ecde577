//! Named connectors owned by whatever composes the system.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::{connector::Connector, error::ConnectorError};

/// Map of connector name to connector.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<String, Connector>>,
}

impl ConnectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the connector's own name, returning any connector it
    /// replaced. The replaced connector is not disconnected.
    pub async fn insert(&self, connector: Connector) -> Option<Connector> {
        let name = connector.name().to_string();
        let previous = self.connectors.write().await.insert(name.clone(), connector);
        if previous.is_some() {
            tracing::debug!(connector = %name, "replaced registered connector");
        }
        previous
    }

    pub async fn get(&self, name: &str) -> Option<Connector> {
        self.connectors.read().await.get(name).cloned()
    }

    pub async fn remove(&self, name: &str) -> Option<Connector> {
        self.connectors.write().await.remove(name)
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.connectors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connectors.read().await.is_empty()
    }

    /// Disconnect every registered connector, collecting failures.
    /// Connectors stay registered.
    pub async fn disconnect_all(&self) -> Vec<(String, ConnectorError)> {
        let connectors: Vec<Connector> = self.connectors.read().await.values().cloned().collect();
        let results = futures::future::join_all(connectors.iter().map(Connector::disconnect)).await;

        connectors
            .iter()
            .zip(results)
            .filter_map(|(connector, result)| {
                result.err().map(|e| {
                    tracing::warn!(connector = %connector.name(), error = %e, "disconnect failed");
                    (connector.name().to_string(), e)
                })
            })
            .collect()
    }
}
