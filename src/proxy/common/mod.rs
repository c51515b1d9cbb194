// Shared helpers used by every protocol path

pub mod error_classifier;
pub mod model_mapping;
pub mod usage;

pub use usage::TokenUsage;
