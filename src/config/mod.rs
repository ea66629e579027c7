mod loader;
mod types;

pub use loader::ConfigLoader;
pub use types::{
    AggregatorConfig, AggregatorTransport, HealthConfig, LogFormatConfig, LogRotationConfig,
    LoggingConfig, MusterConfig, ReconciliationConfig, StoreConfig, StoreKind,
};
