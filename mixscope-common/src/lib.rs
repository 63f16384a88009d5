//! # Mixscope Common Library
//!
//! Shared code for the mixscope services:
//! - Error and Result types
//! - Configuration loading and root folder resolution
//! - Job lifecycle events (EventBus)

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
