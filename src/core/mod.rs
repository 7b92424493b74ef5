//! Core domain types for the relay: the point model, errors, and
//! configuration.

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use error::{CinderError, Result};
pub use types::{Point, Points};
