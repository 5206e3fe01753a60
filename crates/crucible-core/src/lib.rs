//! Crucible Core
//!
//! Core domain types, traits, and error handling for the Crucible control
//! plane. This crate has minimal dependencies and defines the shared
//! vocabulary used across all other crates.

pub mod abort;
pub mod builds;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod plan;
pub mod ports;
pub mod versions;
pub mod workers;

pub use error::{Error, Result};
pub use ids::*;
