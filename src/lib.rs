pub mod clock;
pub mod config;
pub mod delivery;
pub mod destination;
pub mod event;
pub mod observability;
pub mod outcome;
pub mod queue;
pub mod transform;

pub use config::{DeliveryConfig, DestinationConfig, ServiceConfig};
pub use delivery::{ConsumeError, ConsumeOutcome, StorageProxy};
pub use destination::{CreateDeps, DestinationRegistry, DestinationService, SetupError};
pub use event::{ProcessedRow, RawEvent};
pub use outcome::{DeliveryOutcome, DeliveryStatus, OutcomeCache};
pub use queue::PersistentQueue;
