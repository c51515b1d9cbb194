pub mod account;
pub mod config;

pub use account::Account;
pub use config::{
    FallbackModelsConfig, FeaturesConfig, GatewayConfig, LoggingConfig, RetryConfig,
    ServerConfig, StreamConfig, UpstreamConfig,
};
