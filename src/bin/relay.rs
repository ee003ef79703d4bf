//! Event relay
//!
//! Reads newline-delimited JSON events from stdin and delivers them to the
//! configured destinations. Each line is either a bare event object or
//! `{"token": "...", "event": {...}}`.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | EVENT_RELAY_CONFIG | - | TOML config file (or first argument) |
//! | EVENT_RELAY_LOG_EVENT_PATH | /tmp/event-relay/events | Queue directory |
//! | EVENT_RELAY_OUTCOME_CAPACITY | 1000 | Outcomes kept per destination |
//! | EVENT_RELAY_MAX_QUEUE_BYTES | 1 GiB | Disk limit per queue |
//! | EVENT_RELAY_LOG_FORMAT | compact | `json` for structured logs |
//! | RUST_LOG | info | Log filter |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use event_relay::config::DestinationConfig;
use event_relay::destination::{InProcessMonitorKeeper, LOG_TYPE};
use event_relay::observability::{init_tracing, LogConfig};
use event_relay::queue::LocalQueueStore;
use event_relay::{CreateDeps, DestinationRegistry, DestinationService, RawEvent, ServiceConfig};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};

const DEFAULT_TOKEN: &str = "default";

fn load_config() -> Result<ServiceConfig, Box<dyn std::error::Error + Send + Sync>> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("EVENT_RELAY_CONFIG").ok())
        .map(PathBuf::from);

    let mut config = match path {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            ServiceConfig::from_file(&path)?
        }
        None => {
            warn!("no configuration given, delivering to the log only");
            let mut config = ServiceConfig::default();
            config.destinations.insert(
                LOG_TYPE.to_string(),
                DestinationConfig {
                    destination_type: Some(LOG_TYPE.to_string()),
                    ..DestinationConfig::default()
                },
            );
            config
        }
    };
    config.apply_env_overrides()?;
    config.delivery.validate()?;
    Ok(config)
}

/// Parse one input line into an event
fn parse_line(line: &str) -> Option<RawEvent> {
    let value: Value = serde_json::from_str(line).ok()?;
    match value {
        Value::Object(mut object) if object.contains_key("event") => {
            let token = object
                .remove("token")
                .and_then(|t| t.as_str().map(str::to_string))
                .unwrap_or_else(|| DEFAULT_TOKEN.to_string());
            RawEvent::from_value(token, object.remove("event")?)
        }
        other => RawEvent::from_value(DEFAULT_TOKEN, other),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing(&LogConfig::from_env())?;

    let config = load_config()?;
    let store = LocalQueueStore::new(config.log_event_path.clone())?;
    let deps = CreateDeps::new(Arc::new(store), config.delivery.clone())
        .with_monitor(Arc::new(InProcessMonitorKeeper::new()));
    let service = DestinationService::new(DestinationRegistry::with_builtin(), deps);

    let failures = service.init(&config.destinations);
    if service.names().is_empty() {
        error!(failed = failures.len(), "no destination could be started");
        return Err("no destination could be started".into());
    }
    info!(destinations = ?service.names(), "event relay running");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number: u64 = 0;
    loop {
        let line = tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        line_number = line_number.saturating_add(1);
        if line.trim().is_empty() {
            continue;
        }

        let Some(event) = parse_line(&line) else {
            warn!(line = line_number, "skipping line that is not a JSON object");
            continue;
        };
        for (destination, result) in service.consume(&event) {
            match result {
                Ok(outcome) => debug!(destination = %destination, event_id = event.event_id(), ?outcome, "consumed"),
                Err(e) => warn!(destination = %destination, event_id = event.event_id(), error = %e, "not accepted"),
            }
        }
    }

    service.close().await;
    let outcomes = service.outcomes();
    for destination in outcomes.destinations() {
        let stats = outcomes.stats(&destination);
        info!(
            destination = %destination,
            success = stats.success,
            retryable_error = stats.retryable_error,
            permanent_error = stats.permanent_error,
            skipped = stats.skipped,
            "delivery summary"
        );
    }
    Ok(())
}
