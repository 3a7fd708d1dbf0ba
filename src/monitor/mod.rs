//! Alerting, event delivery and statistics.

mod alert;
mod events;
mod stats;

pub use alert::{Alert, AlertAction, AlertEmitter, AlertId, ReputationCheck, Severity};
pub use events::{
    spawn_alert_forwarder, AlertSink, EngineEvent, EventBus, EventHandler, EventKind,
    SubscriptionId,
};
pub use stats::{EngineStats, StatsSnapshot, TopEntry, TOP_N};
