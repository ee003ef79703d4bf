//! Destination registry
//!
//! Maps a destination type to the constructor of its adapter and builds a
//! ready-to-use `StorageProxy` from a `DestinationConfig`. New destination
//! types are added with `register`; nothing else changes.

use super::adapter::{AdapterContext, AdapterError, DestinationAdapter};
use super::file::{FileAdapter, FILE_TYPE};
use super::lock::{MonitorKeeper, NoopMonitorKeeper};
use super::log::{LogAdapter, LOG_TYPE};
use super::SetupError;
use crate::clock::{DeliveryClock, ProductionClock};
use crate::config::{DeliveryConfig, DeliveryMode, DestinationConfig, BATCH_MODE};
use crate::delivery::{DeliveryContext, ProxySink, StorageProxy};
use crate::outcome::OutcomeCache;
use crate::queue::{PersistentQueue, QueueStore};
use crate::transform::{
    EnrichmentRule, FieldMapper, GeoResolver, MappingStep, NoopGeoResolver, TableNameTemplate,
    DEFAULT_TABLE_NAME,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type AdapterConstructor = Arc<
    dyn Fn(&AdapterContext) -> Result<Arc<dyn DestinationAdapter>, AdapterError> + Send + Sync,
>;

/// Shared collaborators handed to every destination
#[derive(Clone)]
pub struct CreateDeps {
    pub queue_store: Arc<dyn QueueStore>,
    pub outcomes: Arc<OutcomeCache>,
    pub monitor: Arc<dyn MonitorKeeper>,
    pub geo: Arc<dyn GeoResolver>,
    pub clock: Arc<dyn DeliveryClock>,
    pub delivery: DeliveryConfig,
}

impl CreateDeps {
    /// Defaults: no locking, no geolocation, system clock
    pub fn new(queue_store: Arc<dyn QueueStore>, delivery: DeliveryConfig) -> Self {
        CreateDeps {
            queue_store,
            outcomes: Arc::new(OutcomeCache::new(delivery.outcome_cache_capacity)),
            monitor: Arc::new(NoopMonitorKeeper),
            geo: Arc::new(NoopGeoResolver),
            clock: Arc::new(ProductionClock::new()),
            delivery,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn MonitorKeeper>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_geo(mut self, geo: Arc<dyn GeoResolver>) -> Self {
        self.geo = geo;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn DeliveryClock>) -> Self {
        self.clock = clock;
        self
    }
}

#[derive(Clone, Default)]
pub struct DestinationRegistry {
    constructors: HashMap<String, AdapterConstructor>,
}

impl std::fmt::Debug for DestinationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl DestinationRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `file` and `log` adapters
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(FILE_TYPE, |ctx| {
            let adapter: Arc<dyn DestinationAdapter> = Arc::new(FileAdapter::from_context(ctx)?);
            Ok(adapter)
        });
        registry.register(LOG_TYPE, |ctx| {
            let adapter: Arc<dyn DestinationAdapter> = Arc::new(LogAdapter::from_context(ctx));
            Ok(adapter)
        });
        registry
    }

    /// Register (or replace) the constructor for a type
    pub fn register<F>(&mut self, destination_type: impl Into<String>, constructor: F)
    where
        F: Fn(&AdapterContext) -> Result<Arc<dyn DestinationAdapter>, AdapterError>
            + Send
            + Sync
            + 'static,
    {
        let destination_type = destination_type.into();
        if self
            .constructors
            .insert(destination_type.clone(), Arc::new(constructor))
            .is_some()
        {
            debug!(destination_type = %destination_type, "replaced adapter constructor");
        }
    }

    pub fn contains(&self, destination_type: &str) -> bool {
        self.constructors.contains_key(destination_type)
    }

    /// Registered types, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.constructors.keys().cloned().collect();
        types.sort();
        types
    }

    /// Build a destination and start its worker.
    ///
    /// The queue is only opened for stream destinations and is closed again
    /// when adapter construction fails.
    pub fn create(
        &self,
        name: &str,
        config: &DestinationConfig,
        deps: &CreateDeps,
    ) -> Result<(Arc<StorageProxy>, Option<Arc<PersistentQueue>>), SetupError> {
        debug_assert!(!name.is_empty(), "Precondition: destination name must not be empty");

        let destination_type = non_empty(config.destination_type.as_deref()).unwrap_or(name);
        let mode_name = non_empty(config.mode.as_deref()).unwrap_or(BATCH_MODE);
        info!(
            destination = %name,
            destination_type = %destination_type,
            mode = %mode_name,
            "Initializing destination of type: {} in mode: {}",
            destination_type,
            mode_name
        );

        let layout = config.data_layout.as_ref();
        let table = match non_empty(layout.and_then(|l| l.table_name_template.as_deref())) {
            Some(template) => TableNameTemplate::parse(template)?,
            None => {
                info!(destination = %name, "[{}] uses default table name: {}", name, DEFAULT_TABLE_NAME);
                TableNameTemplate::default()
            }
        };

        let mode = DeliveryMode::parse(mode_name)
            .ok_or_else(|| SetupError::UnknownMode(mode_name.to_string()))?;
        deps.delivery.validate()?;

        let mut enrichment = EnrichmentRule::default_rules();
        if config.enrichment.is_empty() {
            warn!(destination = %name, "[{}] doesn't have enrichment rules", name);
        } else {
            info!(destination = %name, "[{}] Configured enrichment rules:", name);
        }
        for rule_config in &config.enrichment {
            let rule = EnrichmentRule::from_config(rule_config)?;
            info!(destination = %name, "[{}] {}", name, rule);
            enrichment.push(rule);
        }

        let (mapper, sql_type_casts) = FieldMapper::from_layout(layout)?;
        log_mapping(name, &mapper, config);

        let mut seen = BTreeSet::new();
        let primary_key_fields: Vec<String> = layout
            .map(|l| l.primary_key_fields.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty() && seen.insert(f.clone()))
            .collect();

        let step = MappingStep::new(
            name,
            table,
            mapper,
            enrichment,
            primary_key_fields.clone(),
            config.break_on_error,
            deps.geo.clone(),
        );

        let queue = match mode {
            DeliveryMode::Stream => Some(Arc::new(PersistentQueue::open(
                name,
                deps.queue_store.clone(),
                deps.delivery.queue.clone(),
            )?)),
            DeliveryMode::Batch => None,
        };

        let built = self.build_adapter(
            name,
            destination_type,
            mode,
            config,
            primary_key_fields,
            sql_type_casts,
        );
        let adapter = match built {
            Ok(adapter) => adapter,
            Err(e) => {
                if let Some(queue) = &queue {
                    if let Err(close_err) = queue.close() {
                        warn!(destination = %name, error = %close_err, "failed to close queue");
                    }
                }
                return Err(e);
            }
        };

        let ctx = DeliveryContext::new(
            name,
            adapter,
            deps.monitor.clone(),
            deps.outcomes.clone(),
            deps.clock.clone(),
        );
        let sink = match &queue {
            Some(queue) => ProxySink::Stream(queue.clone()),
            None => ProxySink::Batch,
        };
        let proxy = Arc::new(StorageProxy::start(ctx, step, sink, &deps.delivery));

        info!(destination = %name, mode = %mode, "destination initialized");
        Ok((proxy, queue))
    }

    fn build_adapter(
        &self,
        name: &str,
        destination_type: &str,
        mode: DeliveryMode,
        config: &DestinationConfig,
        primary_key_fields: Vec<String>,
        sql_type_casts: BTreeMap<String, String>,
    ) -> Result<Arc<dyn DestinationAdapter>, SetupError> {
        let constructor = self
            .constructors
            .get(destination_type)
            .ok_or_else(|| SetupError::UnknownType {
                destination: name.to_string(),
                destination_type: destination_type.to_string(),
            })?;

        let ctx = AdapterContext {
            name: name.to_string(),
            destination_type: destination_type.to_string(),
            mode,
            config: config.clone(),
            primary_key_fields: primary_key_fields.into_iter().collect(),
            sql_type_casts,
        };
        constructor(&ctx).map_err(|source| SetupError::Adapter {
            destination: name.to_string(),
            source,
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn log_mapping(name: &str, mapper: &FieldMapper, config: &DestinationConfig) {
    let layout = config.data_layout.as_ref();
    match mapper {
        FieldMapper::Passthrough => {
            warn!(destination = %name, "[{}] doesn't have mapping rules", name);
        }
        FieldMapper::Legacy { .. } => {
            info!(
                destination = %name,
                "[{}] Configured field mapping rules with [{}] mode:",
                name,
                mapper.mode_description()
            );
            for rule in layout.map(|l| l.mapping.as_slice()).unwrap_or_default() {
                info!(destination = %name, "[{}] {}", name, rule);
            }
        }
        FieldMapper::Structured { .. } => {
            info!(
                destination = %name,
                "[{}] Configured field mapping rules with [{}] mode:",
                name,
                mapper.mode_description()
            );
            let rules = layout
                .and_then(|l| l.mappings.as_ref())
                .map(|m| m.fields.as_slice())
                .unwrap_or_default();
            for rule in rules {
                info!(destination = %name, "[{}] {}", name, rule);
            }
        }
    }
}
