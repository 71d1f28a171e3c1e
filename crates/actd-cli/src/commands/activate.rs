//! `actd activate` command.

use anyhow::Result;
use clap::Args;

use crate::opts::GlobalOpts;
use crate::output::print_success;

use super::call;

#[derive(Args, Debug)]
pub struct ActivateArgs {
    /// Object id
    pub object: String,

    /// Ignore any cached stub and construct a fresh instance
    #[arg(long)]
    pub force: bool,
}

pub async fn cmd_activate(opts: &GlobalOpts, args: &ActivateArgs) -> Result<()> {
    let result = call(
        opts,
        "activate",
        serde_json::json!({ "object": args.object, "force": args.force }),
    )
    .await?;
    print_success(opts, result)
}
