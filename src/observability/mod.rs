//! Observability: structured logging for connection and transport events

pub mod logging;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
