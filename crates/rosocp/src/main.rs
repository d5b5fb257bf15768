//! Resource optimization for OpenShift
//!
//! A single binary runs every process of the pipeline; the subcommand picks
//! which one.

mod commands;

use clap::{Parser, Subcommand};
use rosocp_lib::config::LogFormat;
use rosocp_lib::observability::init_tracing;
use rosocp_lib::Settings;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

/// Resource optimization pipeline for OpenShift workloads
#[derive(Parser)]
#[command(name = "rosocp")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start one of the pipeline processes
    #[command(subcommand)]
    Start(StartCommands),

    /// Manage the database schema
    #[command(subcommand)]
    Migrate(MigrateCommands),

    /// Aggregate a usage report locally and write the result as CSV
    Aggregate {
        /// Usage report to aggregate
        input: PathBuf,

        /// Directory receiving output.csv (current directory if not specified)
        #[arg(long, short)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum StartCommands {
    /// Consume upload events and feed the analyzer
    Processor,

    /// Consume recommendation-due events and store recommendations
    RecommendationPoller,

    /// Serve the recommendations read API
    Api,

    /// Run one housekeeping task
    Housekeeper {
        /// Remove clusters whose source was deleted
        #[arg(long, conflicts_with = "partition", required_unless_present = "partition")]
        sources: bool,

        /// Drop partitions older than the retention window
        #[arg(long)]
        partition: bool,
    },
}

#[derive(Subcommand)]
pub enum MigrateCommands {
    /// Apply every pending migration
    Up,

    /// List migrations and whether they are applied
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            init_tracing("info", LogFormat::Json);
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&settings.log_level, settings.log_format);

    let result = match cli.command {
        Commands::Start(start) => match start {
            StartCommands::Processor => commands::start::processor(settings).await,
            StartCommands::RecommendationPoller => commands::start::recommendation_poller(settings).await,
            StartCommands::Api => commands::start::api(settings).await,
            StartCommands::Housekeeper { sources: true, .. } => commands::start::sources_listener(settings).await,
            StartCommands::Housekeeper { .. } => commands::start::partition_cleaner(settings).await,
        },
        Commands::Migrate(migrate) => match migrate {
            MigrateCommands::Up => commands::migrate::up(&settings).await,
            MigrateCommands::Status => commands::migrate::status(&settings).await,
        },
        Commands::Aggregate { input, output_dir } => {
            commands::aggregate::run(&input, output_dir.as_deref())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Exiting after failure");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn housekeeper_needs_exactly_one_task() {
        assert!(Cli::try_parse_from(["rosocp", "start", "housekeeper"]).is_err());
        assert!(Cli::try_parse_from(["rosocp", "start", "housekeeper", "--sources", "--partition"]).is_err());

        let cli = Cli::try_parse_from(["rosocp", "start", "housekeeper", "--partition"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Start(StartCommands::Housekeeper { sources: false, partition: true })
        ));
    }

    #[test]
    fn process_names_are_kebab_case() {
        let cli = Cli::try_parse_from(["rosocp", "start", "recommendation-poller"]).unwrap();
        assert!(matches!(cli.command, Commands::Start(StartCommands::RecommendationPoller)));

        let cli = Cli::try_parse_from(["rosocp", "migrate", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Migrate(MigrateCommands::Status)));
    }
}
