//! Core types and error definitions for the conductor workflow engine.
//!
//! This crate provides the foundational pieces shared by every conductor
//! crate: the error taxonomy used to classify task failures, and tracing
//! initialisation for embedding binaries.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for the engine and its agents.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`ErrorKind`] — Message-free failure classification driving retries.
//! - [`TracingConfig`] — Settings for [`init_tracing`].

/// Error taxonomy.
pub mod error;
/// Tracing subscriber setup.
pub mod telemetry;

pub use error::{ConductorError, ConductorResult, ErrorKind};
pub use telemetry::{init_tracing, TracingConfig};

/// Opaque key/value parameters attached to a task. The engine never looks inside.
pub type Parameters = serde_json::Map<String, serde_json::Value>;
