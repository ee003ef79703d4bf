//! Destination service
//!
//! Owns the running proxies, routes events to them by token and rebuilds
//! destinations whose configuration changed.

use super::registry::{CreateDeps, DestinationRegistry};
use super::SetupError;
use crate::config::DestinationConfig;
use crate::delivery::{ConsumeError, ConsumeOutcome, StorageProxy};
use crate::event::RawEvent;
use crate::outcome::OutcomeCache;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

struct RunningDestination {
    config: DestinationConfig,
    proxy: Arc<StorageProxy>,
}

pub type ConsumeResults = Vec<(String, Result<ConsumeOutcome, ConsumeError>)>;

pub struct DestinationService {
    registry: DestinationRegistry,
    deps: CreateDeps,
    destinations: RwLock<BTreeMap<String, RunningDestination>>,
}

impl DestinationService {
    pub fn new(registry: DestinationRegistry, deps: CreateDeps) -> Self {
        DestinationService {
            registry,
            deps,
            destinations: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn outcomes(&self) -> &Arc<OutcomeCache> {
        &self.deps.outcomes
    }

    /// Create every destination. A failing destination is reported and
    /// skipped; the others keep running.
    pub fn init(&self, configs: &BTreeMap<String, DestinationConfig>) -> Vec<(String, SetupError)> {
        let mut errors = Vec::new();
        for (name, config) in configs {
            if self.destinations.read().contains_key(name) {
                warn!(destination = %name, "destination already running, skipping");
                continue;
            }
            match self.registry.create(name, config, &self.deps) {
                Ok((proxy, _queue)) => {
                    self.destinations.write().insert(
                        name.clone(),
                        RunningDestination {
                            config: config.clone(),
                            proxy,
                        },
                    );
                }
                Err(e) => {
                    error!(destination = %name, error = %e, "failed to initialize destination");
                    errors.push((name.clone(), e));
                }
            }
        }
        info!(
            running = self.destinations.read().len(),
            failed = errors.len(),
            "destinations initialized"
        );
        errors
    }

    /// Hand an event to every destination accepting its token
    pub fn consume(&self, event: &RawEvent) -> ConsumeResults {
        self.destinations
            .read()
            .iter()
            .filter(|(_, running)| running.config.accepts_token(event.token()))
            .map(|(name, running)| (name.clone(), running.proxy.consume(event)))
            .collect()
    }

    pub fn proxy(&self, name: &str) -> Option<Arc<StorageProxy>> {
        self.destinations.read().get(name).map(|r| r.proxy.clone())
    }

    /// Running destinations, sorted
    pub fn names(&self) -> Vec<String> {
        self.destinations.read().keys().cloned().collect()
    }

    /// Apply a new configuration set: changed and removed destinations are
    /// closed, changed and added ones are created.
    pub async fn reload(
        &self,
        configs: &BTreeMap<String, DestinationConfig>,
    ) -> Vec<(String, SetupError)> {
        let stale: Vec<(String, Arc<StorageProxy>)> = {
            let mut destinations = self.destinations.write();
            let names: Vec<String> = destinations
                .iter()
                .filter(|(name, running)| configs.get(*name) != Some(&running.config))
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| destinations.remove(&name).map(|r| (name, r.proxy)))
                .collect()
        };

        for (name, _) in &stale {
            info!(destination = %name, "configuration changed or removed, closing destination");
        }
        join_all(stale.iter().map(|(_, proxy)| proxy.close())).await;

        self.init(configs)
    }

    /// Close every destination
    pub async fn close(&self) {
        let running: Vec<Arc<StorageProxy>> = std::mem::take(&mut *self.destinations.write())
            .into_values()
            .map(|r| r.proxy)
            .collect();
        join_all(running.iter().map(|proxy| proxy.close())).await;
        info!(closed = running.len(), "destination service closed");
    }
}
