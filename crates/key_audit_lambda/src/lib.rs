//! AWS-oriented adapters and handlers for the stale access key audit.
//!
//! This crate owns runtime integration details (the Lambda handler, identity
//! enumeration, and notification dispatch adapters) around the pure audit
//! logic in `key_audit_core`.

pub mod adapters;
pub mod handlers;
