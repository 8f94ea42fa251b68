// Log configuration
pub mod config;

// Subscriber setup
pub mod logging;

pub use config::{LogConfig, LogFormat};
pub use logging::init_logging;
