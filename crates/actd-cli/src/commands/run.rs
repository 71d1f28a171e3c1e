//! `actd run` command: the daemon itself.

use anyhow::{Context, Result};
use actd_host::control::RequestEnvelope;
use actd_host::{Activation, ControlClient, ControlServer, DaemonConfig};
use clap::Args;

use crate::opts::GlobalOpts;

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Default executable for groups without a command path (env: ACTD_GROUP_COMMAND)
    #[arg(long)]
    pub group_command: Option<String>,

    /// Argument appended to every group command line, repeatable
    #[arg(long = "child-arg", allow_hyphen_values = true)]
    pub child_args: Vec<String>,

    /// Additional allowed command path glob, repeatable
    #[arg(long = "allow-command")]
    pub allow_commands: Vec<String>,

    /// Allowed option or NAME=VALUE property glob, repeatable
    #[arg(long = "allow-option", allow_hyphen_values = true)]
    pub allow_options: Vec<String>,

    /// Maximum number of groups starting at once (env: ACTD_GROUP_THROTTLE)
    #[arg(long)]
    pub throttle: Option<usize>,
}

impl RunArgs {
    fn config(&self, opts: &GlobalOpts) -> DaemonConfig {
        let mut config = DaemonConfig::with_state_dir(opts.state_dir()).with_env_overrides();
        config.control_socket = opts.control_socket();
        if let Some(cmd) = &self.group_command {
            config.allowed_commands.push(cmd.clone());
            config.group_command = cmd.clone();
        }
        config.child_args.extend(self.child_args.iter().cloned());
        config.allowed_commands.extend(self.allow_commands.iter().cloned());
        config.allowed_options.extend(self.allow_options.iter().cloned());
        if let Some(n) = self.throttle {
            config.group_throttle = n;
        }
        config
    }
}

pub async fn cmd_run(opts: &GlobalOpts, args: &RunArgs) -> Result<()> {
    setup_logging();
    let config = args.config(opts);
    let control_path = config.control_socket.clone();

    if control_path.exists() {
        if let Ok(mut client) = ControlClient::connect(&control_path).await {
            let ping = RequestEnvelope::new("status", serde_json::json!({}));
            if client.request(&ping).await.is_ok_and(|resp| resp.ok) {
                anyhow::bail!("a daemon is already running at {}", control_path.display());
            }
        }
        tracing::warn!(socket = %control_path.display(), "removing stale control socket");
    }

    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("create state dir {}", config.state_dir.display()))?;
    let activation = Activation::open(config).context("open activation system")?;

    let server = ControlServer::new(control_path, activation.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(err) = server.run().await {
            tracing::error!(error = %err, "control server error");
        }
    });

    let signalled = activation.clone();
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down");
            }
            _ = async {
                match term.as_mut() {
                    Some(t) => { t.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                tracing::info!("SIGTERM received, shutting down");
            }
        }
        signalled.shutdown().await;
    });

    activation.wait_stopped().await;
    let _ = server_handle.await;
    stop_outcome(&activation)
}

/// A daemon that stopped itself exits unsuccessfully.
fn stop_outcome(activation: &Activation) -> Result<()> {
    match activation.fatal_error() {
        Some(reason) => anyhow::bail!("daemon stopped after a fatal error: {reason}"),
        None => Ok(()),
    }
}

/// Installs the daemon's tracing subscriber (`RUST_LOG`, default `info`).
fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();
}
