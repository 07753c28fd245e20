//! The `Engine` (spec §9 Design Notes): consolidates the Instance
//! Registry, Hash Index, and Statistics table that the original scattered
//! across process-wide mutable globals into one value passed by reference
//! to handlers. The distinction from the original is hygienic, not
//! semantic — nothing here changes the concurrency discipline of §5.

use std::sync::Arc;

use crate::config::Config;
use crate::hash_index::HashIndex;
use crate::instance::{BackendInstance, OutboundRequest};
use crate::maindata::Statistics;
use crate::registry::InstanceRegistry;

pub struct Engine {
    pub config: Config,
    pub registry: InstanceRegistry,
    pub hash_index: HashIndex,
    pub stats: Statistics,
}

impl Engine {
    pub fn from_config(config: Config) -> crate::error::Result<Self> {
        let mut instances = Vec::with_capacity(config.backends.len());
        for backend in &config.backends {
            instances.push(Arc::new(BackendInstance::from_config(backend)?));
        }

        Ok(Self {
            registry: InstanceRegistry::new(instances),
            hash_index: HashIndex::new(),
            stats: Statistics::new(),
            config,
        })
    }

    /// Startup priming (spec §4.9): issues one synthetic
    /// `/api/v2/torrents/info` request to populate the Hash Index before
    /// serving traffic. Failures are logged, never fatal — matching
    /// `main.go` only logging `conf.Prime()` errors.
    pub async fn prime(&self) {
        let request = OutboundRequest::synthetic("/api/v2/torrents/info");
        let remove_fields = &self.config.multiplexer.format.info.remove_fields;
        match crate::dispatcher::torrents_info(self, &request, remove_fields).await {
            Ok(_) => tracing::info!("torrent list primed"),
            Err(e) => tracing::warn!(error = %e, "priming failed, continuing startup"),
        }
    }
}
