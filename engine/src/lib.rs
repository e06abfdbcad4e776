//! CRMFlow Engine Library
//!
//! Conversational CRM orchestration: messages become plans of typed tool
//! steps that are authorized, executed and observed against the CRM
//! collaborators. Used by the `crmflow` binary and the integration tests.

/// Configuration management module
pub mod config;

/// Database persistence module
pub mod db;

/// Artifact storage
pub mod artifacts;

/// Role and field access policy
pub mod rbac;

/// Document store collaborator
pub mod store;

/// In-memory table transforms and metrics
pub mod transform;

/// Chart and spreadsheet rendering
pub mod render;

/// BI service collaborator
pub mod bi;

/// CRM write collaborator
pub mod crm;

/// Reasoning service providers
pub mod llm;

/// Tool registry and argument validation
pub mod tools;

/// Plan-execute-observe orchestration
pub mod conductor;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
