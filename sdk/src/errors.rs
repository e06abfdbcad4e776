//! Error types and handling
//!
//! This module provides the error types used throughout the CRMFlow engine.
//! All errors implement the `CrmflowErrorExt` trait which provides user-friendly
//! hints, a coarse [`ErrorKind`] classification, and whether the error is
//! recoverable.
//!
//! # Security
//!
//! All error hints are scrubbed to ensure:
//! - No secrets (signing keys, session tokens) are included
//! - No file paths are exposed to remote users
//! - All messages are safe to display to end users

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed classification reported on a failed step.
///
/// Every [`EngineError`] maps onto exactly one kind. `NotFound` and
/// `Internal` never appear on a step produced by the deterministic planner
/// path; they cover artifact retrieval and engine faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing or malformed step parameter. Never reaches a collaborator.
    ValidationError,
    /// Collection or field not permitted for the user.
    AuthorizationError,
    /// Store or service unreachable or mis-configured.
    CollaboratorUnavailable,
    /// Collaborator did not answer within the fixed deadline.
    CollaboratorTimeout,
    /// The planner produced an empty plan.
    UnrecognizedIntent,
    /// Artifact absent or expired.
    NotFound,
    /// Engine-side fault (database, rendering, I/O).
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::AuthorizationError => "AuthorizationError",
            ErrorKind::CollaboratorUnavailable => "CollaboratorUnavailable",
            ErrorKind::CollaboratorTimeout => "CollaboratorTimeout",
            ErrorKind::UnrecognizedIntent => "UnrecognizedIntent",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Step-local kinds are reported on the failing step only.
    pub fn is_step_local(&self) -> bool {
        matches!(
            self,
            ErrorKind::ValidationError | ErrorKind::AuthorizationError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for CRMFlow error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait CrmflowErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain:
    /// - Secrets (signing keys, session tokens, CRM credentials)
    /// - File paths
    /// - Internal implementation details
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried by the user. The engine itself never
    /// retries a failed step.
    fn is_recoverable(&self) -> bool;

    /// Returns the step-level classification of the error
    fn kind(&self) -> ErrorKind;
}

/// Main engine error type
///
/// This enum represents all possible errors that can occur in the CRMFlow
/// engine. Each variant includes context-specific information while ensuring
/// no sensitive data is exposed in error messages.
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration
/// - **Database**: SQLite operation failures
/// - **Validation**: Step parameters rejected before dispatch
/// - **Authorization**: Collection not permitted for the user
/// - **Collaborator**: Store, BI or CRM failures and timeouts
/// - **Artifacts**: Unknown or expired artifact identifiers
///
/// # Examples
///
/// ```
/// use sdk::errors::{CrmflowErrorExt, EngineError, ErrorKind};
///
/// let error = EngineError::CollaboratorTimeout {
///     collaborator: "document_store".to_string(),
///     secs: 30,
/// };
/// assert_eq!(error.kind(), ErrorKind::CollaboratorTimeout);
/// assert!(error.is_recoverable());
///
/// let denied = EngineError::Authorization {
///     user: "rep-7".to_string(),
///     collection: "leads".to_string(),
/// };
/// assert_eq!(denied.kind(), ErrorKind::AuthorizationError);
/// assert!(!denied.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Validation errors
    #[error("Invalid parameters for {tool}: {message}")]
    Validation { tool: String, message: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Pipeline operator not allowed: {0}")]
    ForbiddenOperator(String),

    // Authorization errors
    #[error("User {user} may not read collection {collection}")]
    Authorization { user: String, collection: String },

    #[error("Session {session} belongs to another user")]
    SessionAccess { session: String },

    // Collaborator errors
    #[error("{collaborator} unavailable: {message}")]
    CollaboratorUnavailable {
        collaborator: String,
        message: String,
    },

    #[error("{collaborator} did not respond within {secs}s")]
    CollaboratorTimeout { collaborator: String, secs: u64 },

    #[error("{collaborator} rejected the request ({status}): {message}")]
    CollaboratorRejected {
        collaborator: String,
        status: u16,
        message: String,
    },

    // Planning errors
    #[error("No actionable request recognized")]
    UnrecognizedIntent,

    #[error("Reasoning service error: {0}")]
    Reasoning(String),

    // Artifact errors
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Saved report not found: {0}")]
    ReportNotFound(String),

    // Rendering errors
    #[error("Render error: {0}")]
    Render(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for a validation failure on `tool`.
    pub fn validation(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Shorthand for an unreachable or mis-configured collaborator.
    pub fn unavailable(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CollaboratorUnavailable {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }
}

impl CrmflowErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "Database operation failed. Try again shortly",

            Self::Validation { .. } => "The request is missing information. Try rephrasing it",
            Self::UnknownTool(_) => "The requested operation is not available",
            Self::ForbiddenOperator(_) => "The query uses an operator that is not permitted",

            Self::Authorization { .. } => "You do not have access to this data",
            Self::SessionAccess { .. } => "This conversation belongs to another user. Start a new one",

            Self::CollaboratorUnavailable { .. } => {
                "A data service is unavailable. Please retry in a moment"
            }
            Self::CollaboratorTimeout { .. } => {
                "A data service took too long to respond. Please retry"
            }
            Self::CollaboratorRejected { .. } => "The CRM rejected the request. Check the details",

            Self::UnrecognizedIntent => {
                "No action was taken. Try asking about leads, tasks, notes, calls or activity"
            }
            Self::Reasoning(_) => "Falling back to built-in request matching",

            Self::ArtifactNotFound(_) => "The file is no longer available. Run the request again",
            Self::ReportNotFound(_) => "No saved report with that id is available to you",

            Self::Render(_) => "Could not generate the file",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Retrying the same request cannot succeed
            Self::Authorization { .. }
            | Self::SessionAccess { .. }
            | Self::ForbiddenOperator(_)
            | Self::UnknownTool(_)
            | Self::Config(_) => false,

            _ => true,
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::UnknownTool(_) | Self::ForbiddenOperator(_) => {
                ErrorKind::ValidationError
            }
            Self::Authorization { .. } | Self::SessionAccess { .. } => ErrorKind::AuthorizationError,
            Self::CollaboratorUnavailable { .. } => ErrorKind::CollaboratorUnavailable,
            Self::CollaboratorTimeout { .. } => ErrorKind::CollaboratorTimeout,
            Self::CollaboratorRejected { status, .. } if (400..500).contains(status) => {
                ErrorKind::ValidationError
            }
            Self::CollaboratorRejected { .. } => ErrorKind::CollaboratorUnavailable,
            Self::UnrecognizedIntent => ErrorKind::UnrecognizedIntent,
            Self::ArtifactNotFound(_) | Self::ReportNotFound(_) => ErrorKind::NotFound,
            Self::Config(_)
            | Self::Database(_)
            | Self::Reasoning(_)
            | Self::Render(_)
            | Self::Io(_) => ErrorKind::Internal,
        }
    }
}
