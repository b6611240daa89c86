//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `ntserve` application.
//!
//! This module centralizes the error types, the logging setup and the
//! microsecond clock that every other module relies on.

pub mod error;
pub mod logging;
pub mod time;
