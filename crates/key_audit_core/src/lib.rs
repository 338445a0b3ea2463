//! Shared access-key audit domain primitives.
//!
//! This crate owns the audit data contract, the staleness predicate, and
//! grouping/formatting of notification reports. It intentionally excludes
//! AWS SDK and Lambda runtime concerns.

pub mod contract;
pub mod report;
pub mod staleness;
