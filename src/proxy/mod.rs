// Proxy service module

pub mod common;
pub mod config;
pub mod forward;
pub mod handlers;
pub mod mappers;
pub mod middleware;
pub mod rate_limit;
pub mod relay;
pub mod server;
pub mod session_manager;
pub mod sink;
pub mod token_manager;
pub mod upstream;

pub use config::{SettingsProvider, SharedSettings};
pub use forward::{ForwardError, ForwardResult, ForwardService, GeminiRequest};
pub use server::{build_router, build_state, AxumServer};
