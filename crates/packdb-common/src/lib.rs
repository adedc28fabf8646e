//! PackDB Common - Shared utilities and types
//!
//! This crate provides functionality shared by the PackDB storage core:
//! - Error types and handling
//! - Configuration management
//! - Metrics and logging bootstrap
//! - Schema, value and row codec definitions

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
