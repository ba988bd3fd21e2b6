//! `recon trend` command implementation

use recon_engine::config::ReconConfig;
use recon_engine::trend::TrendAnalyzer;

use crate::error::{CliError, Result};
use crate::output;
use crate::setup::history_store;
use crate::TrendArgs;

/// Print the history of one metric with its moving average
pub async fn run(args: &TrendArgs) -> Result<i32> {
    let mut settings = ReconConfig::load(args.config.as_deref())?.trend;
    if let Some(window) = args.window {
        if window == 0 {
            return Err(CliError::invalid_argument("--window must be at least 1"));
        }
        settings.window = window;
    }

    let store = history_store(&args.store).await?;
    let report = TrendAnalyzer::new(settings)
        .analyze(&store, args.entity, args.check, &args.metric)
        .await?;

    if args.json {
        output::print_json(&report)?;
    } else {
        output::print_trend(&report);
    }
    Ok(0)
}
