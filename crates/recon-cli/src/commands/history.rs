//! `recon show` and `recon list` command implementations

use recon_engine::store::ValidationRunStore;
use uuid::Uuid;

use crate::error::Result;
use crate::output::{self, RunReport};
use crate::setup::history_store;
use crate::StoreArgs;

/// Show one stored run
pub async fn show(run_id: Uuid, store: &StoreArgs, json: bool) -> Result<i32> {
    let store = history_store(store).await?;
    let run = store.get_run(run_id).await?;

    if json {
        output::print_json(&RunReport::new(&run, &[]))?;
    } else {
        output::print_run(&run);
    }
    Ok(0)
}

/// List recent runs, newest first
pub async fn list(limit: usize, store: &StoreArgs, json: bool) -> Result<i32> {
    let store = history_store(store).await?;
    let summaries = store.list_runs(limit).await?;

    if json {
        output::print_json(&summaries)?;
    } else {
        output::print_summaries(&summaries);
    }
    Ok(0)
}
