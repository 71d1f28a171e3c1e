//! `actd stop` command.

use anyhow::Result;
use clap::Args;

use crate::opts::GlobalOpts;
use crate::output::print_success;

use super::call;

#[derive(Args, Debug)]
pub struct StopArgs {
    /// Admin token, required when the daemon was started with one (env: ACTD_ADMIN_TOKEN)
    #[arg(long, env = "ACTD_ADMIN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

pub async fn cmd_stop(opts: &GlobalOpts, args: &StopArgs) -> Result<()> {
    call(opts, "shutdown", serde_json::json!({ "token": args.token })).await?;
    print_success(opts, serde_json::json!({ "stopped": true }))
}
