//! CRMFlow SDK
//!
//! Shared types and the error taxonomy used by the CRMFlow engine and its
//! collaborator adapters. This crate performs no I/O.

/// Error types and handling
pub mod errors;

/// Tool result types
pub mod types;

// Re-export commonly used types
pub use errors::{CrmflowErrorExt, EngineError, ErrorKind};
pub use types::{
    ArtifactKind, ArtifactRef, Column, ColumnType, Metric, RecordRef, Row, Table, ToolResult,
};
