//! `actd status` command.

use anyhow::Result;

use crate::opts::GlobalOpts;
use crate::output::print_success;

use super::call;

pub async fn cmd_status(opts: &GlobalOpts) -> Result<()> {
    let status = call(opts, "status", serde_json::json!({})).await?;
    print_success(opts, status)
}
