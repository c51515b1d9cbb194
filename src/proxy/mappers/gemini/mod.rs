// Gemini mapper module
// Gemini native format passthrough with v1internal wrapping/unwrapping

pub mod models;
pub mod streaming;
pub mod wrapper;

pub use streaming::GeminiStreamProcessor;
pub use wrapper::*;
