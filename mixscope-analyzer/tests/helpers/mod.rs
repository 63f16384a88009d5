//! Test Helper Utilities
//!
//! Shared utilities for testing mixscope-analyzer

#![allow(dead_code)]

pub mod audio_generator;
pub mod db_utils;

// Re-export commonly used items
pub use audio_generator::{generate_sine_wav, sine, SineConfig};
pub use db_utils::{create_test_db, create_test_orchestrator, test_settings, wait_for_terminal};
