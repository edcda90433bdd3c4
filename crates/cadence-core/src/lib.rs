//! `cadence-core`: configuration and shared error types for the cadence beat service.

pub mod config;
pub mod error;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
