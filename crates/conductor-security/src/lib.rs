//! Capability matching and audit primitives for the conductor engine.
//!
//! # Main types
//!
//! - [`CapabilitySet`] — Named capabilities an agent offers or a task requires.
//! - [`AuditLog`] — Bounded in-memory audit trail with optional forwarding.
//! - [`AuditSink`] — Destination for forwarded audit entries.
//! - [`JsonlFileSink`] — Sink appending JSON lines to a file.

/// Audit logging module.
pub mod audit;
/// Capability set definitions.
pub mod capability;

pub use audit::{
    AuditEntry, AuditFilter, AuditLog, AuditOutcome, AuditSink, JsonlFileSink,
    DEFAULT_AUDIT_CAPACITY,
};
pub use capability::CapabilitySet;
