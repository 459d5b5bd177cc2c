// SPDX-License-Identifier: Apache-2.0

//! Connector Registry
//!
//! Central registry for all reachable physical sources.
//! Fan-out instances look their connector up here by source id.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::SourceConnector;

/// Registry that holds one connector per physical source
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn SourceConnector>>,
}

impl ConnectorRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    /// Registers a new connector
    ///
    /// The connector's `source_id()` is used as the key.
    pub fn register(&mut self, connector: Arc<dyn SourceConnector>) {
        let id = connector.source_id().to_string();
        self.connectors.insert(id, connector);
    }

    /// Gets a connector by its source id
    pub fn get(&self, source_id: &str) -> Option<Arc<dyn SourceConnector>> {
        self.connectors.get(source_id).cloned()
    }

    /// Gets a connector or fails with `ConnectorNotFound`
    pub fn require(&self, source_id: &str) -> EngineResult<Arc<dyn SourceConnector>> {
        self.get(source_id)
            .ok_or_else(|| EngineError::connector_not_found(source_id))
    }

    /// Lists all registered source ids, sorted
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.connectors.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the number of registered connectors
    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    /// Returns true if no connectors are registered
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
