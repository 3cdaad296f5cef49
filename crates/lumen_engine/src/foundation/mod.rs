//! Foundation module - Core utilities and types
//!
//! This module provides fundamental utilities used throughout the engine:
//! - Math types and operations
//! - Frame timing
//! - Hierarchical profiling
//! - Logging utilities

pub mod logging;
pub mod math;
pub mod profiler;
pub mod time;
