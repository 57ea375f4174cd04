//! Shared types for the flagrelay handler: the incoming event, the flags built
//! from it, the outcome reported back to the host, and handler configuration.

pub mod config;
pub mod error;
pub mod models;

pub use config::*;
pub use error::*;
pub use models::*;
