//! Core runtime infrastructure.
//!
//! This module contains the essential components for running Strata:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Main runtime orchestration
//! - [`time`] - Monotonic and manual clocks
//! - [`error`] - Error types and transport-facing codes

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
