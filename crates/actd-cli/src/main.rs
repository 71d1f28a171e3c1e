mod commands;
mod opts;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::activate::ActivateArgs;
use commands::group::GroupCommand;
use commands::object::ObjectCommand;
use commands::run::RunArgs;
use commands::stop::StopArgs;
use opts::GlobalOpts;

#[derive(Parser, Debug)]
#[command(name = "actd", version, about = "Object activation daemon")]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the activation daemon in the foreground
    Run(RunArgs),

    /// Stop a running daemon
    Stop(StopArgs),

    /// Show registry and group status
    Status,

    /// Manage activation groups
    #[command(subcommand)]
    Group(GroupCommand),

    /// Manage activatable objects
    #[command(subcommand)]
    Object(ObjectCommand),

    /// Obtain a live stub for an object, starting its group if needed
    Activate(ActivateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let opts = &cli.opts;

    match &cli.command {
        Command::Run(args) => commands::run::cmd_run(opts, args).await,
        Command::Stop(args) => commands::stop::cmd_stop(opts, args).await,
        Command::Status => commands::status::cmd_status(opts).await,
        Command::Group(cmd) => commands::group::cmd_group(opts, cmd).await,
        Command::Object(cmd) => commands::object::cmd_object(opts, cmd).await,
        Command::Activate(args) => commands::activate::cmd_activate(opts, args).await,
    }
}
