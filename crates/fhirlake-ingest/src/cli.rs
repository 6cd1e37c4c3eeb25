//! Command-line definitions for the `fhirlake-ingest` binary

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use fhirlake_common::time::parse_instant;

/// FhirLake incremental FHIR extraction
#[derive(Parser, Debug)]
#[command(name = "fhirlake-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Split a window into processing jobs and print them as JSON lines
    Plan {
        /// Window start, RFC 3339 or YYYY-MM-DD (default: earliest record)
        #[arg(long, value_parser = parse_timestamp)]
        start: Option<DateTime<Utc>>,

        /// Window end, exclusive (default: now)
        #[arg(long, value_parser = parse_timestamp)]
        end: Option<DateTime<Utc>>,

        /// Resource types, overriding FHIRLAKE_RESOURCE_TYPES
        #[arg(short, long, value_delimiter = ',')]
        resource_types: Vec<String>,
    },

    /// Run or resume an orchestrator until all jobs complete
    Run {
        #[arg(long)]
        trigger_sequence_id: i64,

        /// Queue group the processing jobs are enqueued under
        #[arg(long)]
        queue_group_id: i64,

        /// Checkpoint key; rerunning with the same key resumes
        #[arg(long)]
        checkpoint_key: String,

        /// Extract only members of this patient group
        #[arg(long)]
        group: Option<String>,

        /// Only records changed since this instant
        #[arg(long, value_parser = parse_timestamp)]
        since: Option<DateTime<Utc>>,

        #[arg(long, value_parser = parse_timestamp)]
        start: Option<DateTime<Utc>>,

        #[arg(long, value_parser = parse_timestamp)]
        end: DateTime<Utc>,
    },

    /// Show a stored orchestrator checkpoint
    Status {
        #[arg(long)]
        checkpoint_key: String,

        /// Report resource types still short of this instant
        #[arg(long, value_parser = parse_timestamp)]
        end: Option<DateTime<Utc>>,
    },
}

fn parse_timestamp(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_instant(value).map_err(|e| e.to_string())
}
