use std::collections::BTreeMap;
use std::io;
use std::process::Stdio;

use actd_kernel::{GroupDescriptor, GroupId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

/// Environment prefix under which descriptor properties reach the group process.
pub const PROPERTY_ENV_PREFIX: &str = "ACTD_PROP_";

/// Everything needed to launch one group process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Process name used in logs (`Group-N`).
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Written to the child's stdin, which is closed afterwards.
    pub stdin: Vec<u8>,
}

/// First message a group process reads on stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBootstrap {
    pub group: GroupId,
    pub incarnation: u64,
    pub descriptor: GroupDescriptor,
    /// Control socket the group reports back on.
    pub control: String,
}

/// Handle on a running group process.
#[async_trait]
pub trait GroupProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Waits for the process to exit and returns its exit code, if it had one.
    /// Must be cancel-safe: it is polled inside `select!`.
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Sends a kill signal without waiting for the exit.
    fn start_kill(&mut self) -> io::Result<()>;
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<Box<dyn GroupProcess>>;
}

/// Command line for a group: the descriptor's command path (or `default_program`),
/// then the descriptor's options, then `child_args`.
pub fn command_line(
    desc: &GroupDescriptor,
    default_program: &str,
    child_args: &[String],
) -> Vec<String> {
    let command = desc.command.as_ref();
    let program = command
        .and_then(|cmd| cmd.path.clone())
        .unwrap_or_else(|| default_program.to_string());
    let mut argv = vec![program];
    if let Some(cmd) = command {
        argv.extend(cmd.options.iter().cloned());
    }
    argv.extend(child_args.iter().cloned());
    argv
}

/// Maps descriptor properties to `ACTD_PROP_<NAME>` variables.
///
/// Fails when two property names map to the same variable.
pub fn property_env(desc: &GroupDescriptor) -> Result<BTreeMap<String, String>, String> {
    let mut env = BTreeMap::new();
    let mut sources: BTreeMap<String, &str> = BTreeMap::new();
    for (name, value) in &desc.properties {
        let key: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        let key = format!("{PROPERTY_ENV_PREFIX}{key}");
        if let Some(other) = sources.insert(key.clone(), name.as_str()) {
            return Err(format!("properties {other:?} and {name:?} both map to {key}"));
        }
        env.insert(key, value.clone());
    }
    Ok(env)
}

/// Spawns group processes with `tokio::process`, forwarding their stdout and
/// stderr lines into the daemon log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<Box<dyn GroupProcess>> {
        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, request.name.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, request.name.clone(), "stderr"));
        }
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = request.stdin.clone();
            let name = request.name.clone();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&bytes).await {
                    tracing::warn!(group = %name, error = %err, "failed to write group bootstrap");
                }
            });
        }
        Ok(Box::new(TokioGroupProcess { child }))
    }
}

async fn forward_lines<R>(stream: R, name: String, stream_name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(target: "actd::child", group = %name, stream = stream_name, "{line}");
    }
}

struct TokioGroupProcess {
    child: Child,
}

#[async_trait]
impl GroupProcess for TokioGroupProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.child.wait().await.map(|status| status.code())
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_orders_path_options_then_child_args() {
        let desc = GroupDescriptor::default()
            .with_command("/opt/worker", vec!["--fast".into(), "-v".into()]);
        let argv = command_line(&desc, "actd-group", &["--log=json".into()]);
        assert_eq!(argv, vec!["/opt/worker", "--fast", "-v", "--log=json"]);

        let argv = command_line(&GroupDescriptor::default(), "actd-group", &[]);
        assert_eq!(argv, vec!["actd-group"]);
    }

    #[test]
    fn properties_become_prefixed_env_vars() {
        let desc = GroupDescriptor::default()
            .with_property("heap.max", "64m")
            .with_property("trace", "");
        let env = property_env(&desc).unwrap();
        assert_eq!(env.get("ACTD_PROP_HEAP_MAX").map(String::as_str), Some("64m"));
        assert_eq!(env.get("ACTD_PROP_TRACE").map(String::as_str), Some(""));
    }

    #[test]
    fn colliding_property_names_are_rejected() {
        let desc = GroupDescriptor::default()
            .with_property("heap.max", "64m")
            .with_property("heap_max", "128m");
        let err = property_env(&desc).unwrap_err();
        assert!(err.contains("ACTD_PROP_HEAP_MAX"));
    }

    #[tokio::test]
    async fn tokio_spawner_reports_exit_code() {
        let request = SpawnRequest {
            name: "Group-test".into(),
            program: "sh".into(),
            args: vec!["-c".into(), "read line; exit 3".into()],
            env: BTreeMap::new(),
            stdin: b"hello\n".to_vec(),
        };
        let mut process = TokioSpawner.spawn(&request).unwrap();
        assert!(process.id().is_some());
        assert_eq!(process.wait().await.unwrap(), Some(3));
    }
}
