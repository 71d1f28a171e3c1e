use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use actd_kernel::DEFAULT_SNAPSHOT_INTERVAL;

/// Executable launched for groups whose descriptor names no command path.
pub const DEFAULT_GROUP_COMMAND: &str = "actd-group";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Root of the persisted registry (`journal/`, `snapshot/`).
    pub state_dir: PathBuf,
    pub control_socket: PathBuf,
    /// How long a spawned group has to report itself active.
    pub exec_timeout: Duration,
    /// Grace period between killing a group process and giving up on its exit.
    pub group_timeout: Duration,
    pub snapshot_interval: u64,
    /// Maximum number of groups being created at the same time.
    pub group_throttle: usize,
    pub max_tries: u32,
    pub group_command: String,
    /// Appended after the descriptor's own options on every group command line.
    pub child_args: Vec<String>,
    /// Command path globs accepted by the default exec policy.
    pub allowed_commands: Vec<String>,
    /// Option and `name=value` property globs accepted by the default exec policy.
    pub allowed_options: Vec<String>,
    /// When set, `shutdown` over the control socket must present this token.
    pub admin_token: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let state_dir = PathBuf::from(".actd");
        Self {
            control_socket: state_dir.join("control.sock"),
            state_dir,
            exec_timeout: Duration::from_secs(30),
            group_timeout: Duration::from_secs(60),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            group_throttle: 3,
            max_tries: 2,
            group_command: DEFAULT_GROUP_COMMAND.into(),
            child_args: Vec::new(),
            allowed_commands: vec![DEFAULT_GROUP_COMMAND.into()],
            allowed_options: Vec::new(),
            admin_token: None,
        }
    }
}

impl DaemonConfig {
    /// Defaults rooted at `state_dir`, with the control socket inside it.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            control_socket: state_dir.join("control.sock"),
            state_dir,
            ..Self::default()
        }
    }

    /// Default configuration with `ACTD_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies `ACTD_*` environment overrides on top of `self`. Unparseable
    /// values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_parse::<u64>("ACTD_EXEC_TIMEOUT_MS") {
            self.exec_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("ACTD_GROUP_TIMEOUT_MS") {
            self.group_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse("ACTD_SNAPSHOT_INTERVAL") {
            self.snapshot_interval = n;
        }
        if let Some(n) = env_parse("ACTD_GROUP_THROTTLE") {
            self.group_throttle = n;
        }
        if let Some(n) = env_parse("ACTD_MAX_TRIES") {
            self.max_tries = n;
        }
        if let Ok(cmd) = std::env::var("ACTD_GROUP_COMMAND") {
            self.allowed_commands.push(cmd.clone());
            self.group_command = cmd;
        }
        if let Ok(list) = std::env::var("ACTD_ALLOW_COMMANDS") {
            self.allowed_commands.extend(split_list(&list));
        }
        if let Ok(list) = std::env::var("ACTD_ALLOW_OPTIONS") {
            self.allowed_options.extend(split_list(&list));
        }
        if let Ok(token) = std::env::var("ACTD_ADMIN_TOKEN") {
            self.admin_token = Some(token).filter(|t| !t.is_empty());
        }
        self
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(%key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_daemon_constants() {
        let config = DaemonConfig::with_state_dir("/tmp/actd");
        assert_eq!(config.exec_timeout, Duration::from_secs(30));
        assert_eq!(config.group_timeout, Duration::from_secs(60));
        assert_eq!(config.snapshot_interval, 200);
        assert_eq!(config.group_throttle, 3);
        assert_eq!(config.max_tries, 2);
        assert_eq!(config.control_socket, PathBuf::from("/tmp/actd/control.sock"));
    }

    #[test]
    fn list_values_are_trimmed() {
        let items: Vec<_> = split_list(" /usr/bin/*, ,-Xmx*").collect();
        assert_eq!(items, vec!["/usr/bin/*", "-Xmx*"]);
    }
}
