// CRMFlow conversational CRM engine
// Main entry point for the crmflow binary

use clap::Parser;
use crmflow_engine::cli::{Cli, Command};
use crmflow_engine::config::Config;
use crmflow_engine::handlers::{
    handle_artifact, handle_ask, handle_chat, handle_history, handle_plan, handle_report,
    handle_tools, OutputFormat,
};
use crmflow_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the configured level; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    tracing::debug!("CRMFlow v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Ask {
            message,
            session,
            user,
        } => handle_ask(message, session, user, &config, format).await,

        Command::Chat { user } => handle_chat(user, &config, format).await,

        Command::Plan { message, user } => handle_plan(message, user, &config, format).await,

        Command::Report { action } => {
            tracing::debug!("Report action: {:?}", action);
            handle_report(action, &config, format).await
        }

        Command::Tools => handle_tools(&config, format).await,

        Command::Artifact { action } => {
            tracing::debug!("Artifact action: {:?}", action);
            handle_artifact(action, &config, format).await
        }

        Command::History { limit } => {
            tracing::debug!("Showing last {} plans", limit);
            handle_history(limit, &config, format).await
        }
    }
}
