//! Core types for webspark_rust.
//!
//! This crate provides the shared building blocks the other workspace
//! crates are written against:
//! - [`HttpError`]: the structured error every request-processing
//!   component surfaces failures through
//!
//! # Design Principles
//!
//! - Errors are values; components return `Result` and callers branch on
//!   the kind rather than catching by class
//! - Serialization is confined to `serde`/`serde_json`

#![forbid(unsafe_code)]

mod error;

pub use error::{DEFAULT_STATUS_CODE, HttpError};
