//! Build automation tasks for the reconciliation workspace
//!
//! - Generating the `recon` CLI reference from the clap definitions

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for recon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<recon_cli::Cli>();

    let content = format!(
        r#"# recon CLI Reference

This documentation is generated from the CLI source code. Last updated: {}.

## Overview

`recon` compares the local PostgreSQL mirror against the upstream CRM, records
every check in the run store and exits with:

| Code | Meaning |
|------|---------|
| `0` | every check passed |
| `1` | a data-quality failure, or some checks could not complete |
| `2` | the run could not be carried out (configuration, persistence) |

## Quick Start

```bash
# Create the run-store tables
recon migrate

# Nightly slow run over every entity type
recon run --all --mode slow --triggered-by nightly

# Hourly fast run for one entity type
recon run --entity volunteer --triggered-by cron

# Inspect history
recon list --limit 10
recon show <run-id>
recon trend --entity volunteer --check count --metric variance
```

## Commands

{}

## Environment Variables

- `DATABASE_URL` - PostgreSQL for the local mirror and the run store
- `DATABASE_MAX_CONNECTIONS`, `DATABASE_CONNECT_TIMEOUT` - connection pool
- `RECON_CRM_URL` - base URL of the CRM API
- `RECON_CONFIG` - reconciliation policy file (TOML)
- `RECON_MAX_CONCURRENCY`, `RECON_CALL_TIMEOUT`, `RECON_PAGE_SIZE` - worker pool
- `RECON_RETRY_MAX_ATTEMPTS`, `RECON_RETRY_INITIAL_BACKOFF_MS`, `RECON_RETRY_MAX_BACKOFF_MS` - retries
- `RECON_ALERT_WEBHOOK` - webhook notified when a run does not complete cleanly
- `RECON_LOG_LEVEL`, `RECON_LOG_OUTPUT`, `RECON_LOG_FORMAT`, `RECON_LOG_DIR` - logging
- `RECON__<SECTION>__<KEY>` - override any policy value, e.g. `RECON__SCHEMA__SAMPLE_SIZE=50`

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());

    Ok(())
}
