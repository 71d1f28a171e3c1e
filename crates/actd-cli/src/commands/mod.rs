pub mod activate;
pub mod group;
pub mod object;
pub mod run;
pub mod status;
pub mod stop;

use anyhow::{Context, Result, anyhow};
use actd_host::ControlClient;
use serde_json::Value;

use crate::opts::GlobalOpts;

/// Connects to the daemon's control socket.
pub async fn control_client(opts: &GlobalOpts) -> Result<ControlClient> {
    let path = opts.control_socket();
    ControlClient::connect(&path).await.with_context(|| {
        format!(
            "no daemon reachable at {} (start one with `actd run`)",
            path.display()
        )
    })
}

/// Sends one control command and returns its result, honouring `--timeout-ms`.
pub async fn call(opts: &GlobalOpts, cmd: &str, payload: Value) -> Result<Value> {
    let mut client = control_client(opts).await?;
    let pending = client.call(cmd, payload);
    let reply = match opts.timeout() {
        Some(limit) => tokio::time::timeout(limit, pending)
            .await
            .map_err(|_| anyhow!("{cmd} timed out after {}ms", limit.as_millis()))?,
        None => pending.await,
    };
    let result = reply.with_context(|| format!("control request {cmd} failed"))?;
    result.map_err(|err| anyhow!("{cmd}: {} ({})", err.message, err.code))
}

/// Parses `name=value` pairs given on the command line.
pub fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}
