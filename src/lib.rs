// Core modules
pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod feed;
pub mod models;

// Re-export commonly used types
pub use config::Settings;
pub use error::BotError;
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, error::BotError>;
