//! `recon migrate` command implementation

use colored::Colorize;

use crate::error::Result;
use crate::setup::history_store;
use crate::StoreArgs;

/// Apply pending run-store migrations
pub async fn run(store: &StoreArgs) -> Result<i32> {
    let store = history_store(store).await?;
    store.migrate().await?;
    println!("{}", "Run-store migrations applied.".green());
    Ok(0)
}
