//! CLI interface for CRMFlow
//!
//! This module provides the command-line interface using clap's derive API.
//! Every command runs in-process against the configured store and database.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CRMFlow conversational CRM engine
///
/// Turns plain-language requests into plans of CRM reads, transforms,
/// charts, exports and record updates, and runs them.
#[derive(Parser, Debug)]
#[command(name = "crmflow")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one message and print the response
    Ask {
        /// The request, e.g. "Show me all qualified leads"
        message: String,

        /// Session to continue (a new one is started when absent)
        #[arg(short, long)]
        session: Option<String>,

        /// User the request runs as
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Interactive conversation on one session
    Chat {
        /// User the conversation runs as
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Show the plan for a message without running it
    Plan {
        /// The request to plan
        message: String,

        /// User whose collections the plan may read
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Save, list and run report definitions
    Report {
        #[command(subcommand)]
        action: ReportAction,
    },

    /// List the tool registry
    Tools,

    /// Manage stored artifacts
    Artifact {
        #[command(subcommand)]
        action: ArtifactAction,
    },

    /// Show the plan audit trail
    History {
        /// Number of plans to show (default: 10)
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

/// Artifact actions
#[derive(Subcommand, Debug)]
pub enum ArtifactAction {
    /// Write an artifact's bytes to a file
    Get {
        /// Artifact ID
        id: String,

        /// Destination path (defaults to the artifact's filename)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// List live artifacts, newest first
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Delete an artifact
    Delete {
        /// Artifact ID
        id: String,
    },

    /// Remove expired artifacts
    Purge,
}

/// Saved report actions
#[derive(Subcommand, Debug)]
pub enum ReportAction {
    /// Save a report definition
    Save {
        /// Name to save the report under
        name: String,

        /// Request that describes the report, e.g. "Build a weekly sales report"
        #[arg(short, long, conflicts_with = "spec", required_unless_present = "spec")]
        message: Option<String>,

        /// report.build arguments as JSON
        #[arg(long)]
        spec: Option<String>,

        #[arg(short, long, default_value = "")]
        description: String,

        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// List your saved reports, newest first
    List {
        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Build a saved report now
    Run {
        /// Report ID
        id: String,

        #[arg(short, long, default_value = "local")]
        user: String,
    },

    /// Delete a saved report
    Delete {
        /// Report ID
        id: String,

        #[arg(short, long, default_value = "local")]
        user: String,
    },
}
