// HTTP middleware

pub mod monitor;

pub use monitor::monitor_middleware;

use tower_http::cors::{Any, CorsLayer};

/// Permissive CORS for browser-based clients
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
