//! FhirLake ingest - main entry point

use clap::Parser;
use fhirlake_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use fhirlake_ingest::cli::{Cli, Commands};
use fhirlake_ingest::commands;
use fhirlake_ingest::config::IngestConfig;
use fhirlake_ingest::orchestrator::{FilterScope, OrchestratorInput};
use fhirlake_ingest::{FailureKind, IngestError};
use std::process;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// sysexits EX_TEMPFAIL: the run can be retried as is
const EXIT_RETRIABLE: i32 = 75;
const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("fhirlake-ingest")
        .build();
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    let config = match IngestConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(2);
        },
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            ctrl_c.cancel();
        }
    });

    if let Err(e) = execute_command(cli.command, &config, cancel).await {
        let kind = e.kind();
        error!(error = %e, kind = kind.as_str(), "Command failed");
        eprintln!("Error: {}", e);
        process::exit(match kind {
            FailureKind::Retriable => EXIT_RETRIABLE,
            FailureKind::NonRetriable => 1,
            FailureKind::Cancelled => EXIT_CANCELLED,
        });
    }
}

async fn execute_command(
    command: Commands,
    config: &IngestConfig,
    cancel: CancellationToken,
) -> Result<(), IngestError> {
    match command {
        Commands::Plan {
            start,
            end,
            resource_types,
        } => commands::plan::run(config, start, end, &resource_types, cancel).await,

        Commands::Run {
            trigger_sequence_id,
            queue_group_id,
            checkpoint_key,
            group,
            since,
            start,
            end,
        } => {
            let input = OrchestratorInput {
                trigger_sequence_id,
                queue_group_id,
                checkpoint_key,
                since,
                data_start_time: start,
                data_end_time: end,
                resource_types: config.resource_types.clone(),
                scope: match group {
                    Some(group_id) => FilterScope::Group { group_id },
                    None => FilterScope::System,
                },
            };
            commands::run::run(config, input, cancel).await
        },

        Commands::Status {
            checkpoint_key,
            end,
        } => commands::status::run(config, &checkpoint_key, end).await,
    }
}
