//! Recon CLI Library
//!
//! Command-line driver for reconciliation runs between the local mirror and the
//! upstream CRM.
//!
//! # Overview
//!
//! - **Runs**: validate one or more entity types (`recon run`)
//! - **History**: list recent runs and inspect one (`recon list`, `recon show`)
//! - **Trends**: metric history with a moving average (`recon trend`)
//! - **Schema**: apply the run-store migrations (`recon migrate`)
//!
//! `recon run` exits with `0` when every check passed, `1` on a data-quality
//! failure or a partially failed run, and `2` when the run could not be
//! carried out.

pub mod commands;
pub mod error;
pub mod output;
pub mod progress;
pub mod setup;

// Re-export commonly used types
pub use error::{CliError, Result};

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use recon_common::{CheckType, EntityType, ValidationMode};
use std::path::PathBuf;
use uuid::Uuid;

/// Exit code for a run that could not be carried out
pub const EXIT_OPERATIONAL_FAILURE: i32 = 2;

/// Recon - data validation and reconciliation for the CRM mirror
#[derive(Parser, Debug)]
#[command(name = "recon")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print the CLI reference as markdown and exit
    #[arg(long, hide = true)]
    pub markdown_help: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a reconciliation
    Run(RunArgs),

    /// Show one run with its results
    Show {
        /// Run id
        run_id: Uuid,

        #[command(flatten)]
        store: StoreArgs,

        /// Print JSON instead of tables
        #[arg(long)]
        json: bool,
    },

    /// List recent runs, newest first
    List {
        /// Number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        #[command(flatten)]
        store: StoreArgs,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the history of one metric
    Trend(TrendArgs),

    /// Apply run-store migrations
    Migrate {
        #[command(flatten)]
        store: StoreArgs,
    },
}

/// Where run history lives
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// PostgreSQL connection string for the run store and the local mirror
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,
}

/// Kind of run store
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Keep history in memory for this invocation only
    Memory,
    /// Persist history in PostgreSQL
    Postgres,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Entity types to validate (repeatable or comma separated)
    #[arg(short, long = "entity", value_delimiter = ',', required_unless_present = "all")]
    pub entities: Vec<EntityType>,

    /// Validate every entity type
    #[arg(long, conflicts_with = "entities")]
    pub all: bool,

    /// fast: schema, count, completeness; slow: adds hash and tolerance
    #[arg(short, long, default_value = "fast")]
    pub mode: ValidationMode,

    /// Extra checks on top of the mode (repeatable or comma separated)
    #[arg(long = "check", value_delimiter = ',')]
    pub checks: Vec<CheckType>,

    /// Who or what started the run
    #[arg(long, default_value = "manual")]
    pub triggered_by: String,

    /// Only count and inspect records updated at or after this instant (RFC 3339)
    #[arg(long)]
    pub since: Option<DateTime<Utc>>,

    /// Reconciliation policy file (TOML)
    #[arg(short, long, env = "RECON_CONFIG")]
    pub config: Option<PathBuf>,

    /// Read CRM records from `<entity>.json` files in this directory
    #[arg(long, conflicts_with = "crm_url")]
    pub source_dir: Option<PathBuf>,

    /// Base URL of the CRM API
    #[arg(long, env = "RECON_CRM_URL")]
    pub crm_url: Option<String>,

    /// Read local records from `<entity>.json` files instead of PostgreSQL
    #[arg(long)]
    pub local_dir: Option<PathBuf>,

    /// Run store; defaults to postgres when a database is configured
    #[arg(long, value_enum)]
    pub store: Option<StoreKind>,

    #[command(flatten)]
    pub database: StoreArgs,

    /// Print the run as JSON instead of tables
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn entity_types(&self) -> Vec<EntityType> {
        if self.all {
            EntityType::ALL.to_vec()
        } else {
            self.entities.clone()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct TrendArgs {
    /// Entity type
    #[arg(short, long)]
    pub entity: EntityType,

    /// Check type that records the metric
    #[arg(short, long)]
    pub check: CheckType,

    /// Metric name, e.g. variance or mismatch_rate
    #[arg(long)]
    pub metric: String,

    /// Moving-average window; defaults to the policy's window
    #[arg(short, long)]
    pub window: Option<usize>,

    /// Reconciliation policy file (TOML)
    #[arg(long, env = "RECON_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args_parse() {
        let cli = Cli::try_parse_from([
            "recon",
            "run",
            "--entity",
            "volunteer,event",
            "--mode",
            "slow",
            "--check",
            "hash",
            "--since",
            "2024-03-01T00:00:00Z",
        ])
        .unwrap();

        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.entity_types(), vec![EntityType::Volunteer, EntityType::Event]);
        assert_eq!(args.mode, ValidationMode::Slow);
        assert_eq!(args.checks, vec![CheckType::Hash]);
        assert!(args.since.is_some());
    }

    #[test]
    fn test_all_selects_every_entity() {
        let cli = Cli::try_parse_from(["recon", "run", "--all"]).unwrap();
        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.entity_types(), EntityType::ALL.to_vec());
    }

    #[test]
    fn test_entity_or_all_is_required() {
        assert!(Cli::try_parse_from(["recon", "run"]).is_err());
        assert!(Cli::try_parse_from(["recon", "run", "--all", "--entity", "event"]).is_err());
        assert!(Cli::try_parse_from(["recon", "run", "--entity", "donor"]).is_err());
    }
}
