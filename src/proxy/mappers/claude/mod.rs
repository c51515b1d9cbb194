// Claude mapper module
// Handles Claude/Anthropic ↔ v1internal protocol conversion

pub mod degrade;
pub mod models;
pub mod request;
pub mod response;
pub mod streaming;

pub use degrade::DegradeStage;
pub use models::*;
pub use request::{
    clean_cache_control_from_messages, merge_consecutive_messages, transform_claude_request,
    TransformOptions,
};
pub use response::transform_response;
pub use streaming::{ClaudeStreamProcessor, PartProcessor, StreamingState};
