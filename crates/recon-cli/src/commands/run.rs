//! `recon run` command implementation

use recon_engine::config::{ConfigHandle, ReconConfig};
use recon_engine::orchestrator::{OrchestratorSettings, ReconciliationOrchestrator, RunRequest};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{CliError, Result};
use crate::output::{self, RunReport};
use crate::progress::create_spinner;
use crate::setup::{engine_config, RunEnvironment};
use crate::RunArgs;

/// Execute one reconciliation run and return its exit code
pub async fn run(args: &RunArgs) -> Result<i32> {
    let entity_types = args.entity_types();
    if entity_types.is_empty() {
        return Err(CliError::invalid_argument("at least one --entity is required"));
    }

    let engine = engine_config(&args.database)?;
    let policy_path = args.config.as_deref().or(engine.policy_path.as_deref());
    let policy = ReconConfig::load(policy_path)?;

    let env = RunEnvironment::build(args, &engine).await?;
    let orchestrator = ReconciliationOrchestrator::new(
        env.store,
        ConfigHandle::new(policy),
        OrchestratorSettings::from(&engine),
    )
    .with_alerts(env.alerts);

    let mut request = RunRequest::new(entity_types, args.mode, args.triggered_by.clone());
    if let Some(since) = args.since {
        request = request.since(since);
    }
    for check in &args.checks {
        request = request.with_check(*check);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current checks");
            on_signal.cancel();
        }
    });

    let spinner = (!args.json).then(|| create_spinner(&format!("Running {} reconciliation...", args.mode)));
    let outcome = orchestrator.run(request, env.sources, cancel).await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    let outcome = outcome?;

    let summary = outcome.summary();
    info!(run_id = %summary.run_id, status = %summary.status, "Run finished");

    if args.json {
        output::print_json(&RunReport::new(&outcome.run, &outcome.advisories))?;
    } else {
        output::print_run(&outcome.run);
        output::print_advisories(&outcome.advisories);
    }

    Ok(summary.exit_code())
}
