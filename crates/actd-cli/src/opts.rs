//! Global CLI options and path resolution.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

pub const DEFAULT_STATE_DIR: &str = ".actd";

/// Options shared by every command. Each can also be set from the environment.
#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Daemon state directory (env: ACTD_STATE, default: ./.actd)
    #[arg(long, global = true, env = "ACTD_STATE")]
    pub state_dir: Option<PathBuf>,

    /// Control socket override (env: ACTD_CONTROL, default: <state-dir>/control.sock)
    #[arg(long, global = true, env = "ACTD_CONTROL")]
    pub control: Option<PathBuf>,

    /// JSON output envelope
    #[arg(long, global = true)]
    pub json: bool,

    /// Pretty-print JSON output (implies --json)
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Client-side control timeout in milliseconds (env: ACTD_TIMEOUT_MS)
    #[arg(long, global = true, env = "ACTD_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,
}

impl GlobalOpts {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }

    pub fn control_socket(&self) -> PathBuf {
        self.control
            .clone()
            .unwrap_or_else(|| self.state_dir().join("control.sock"))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> GlobalOpts {
        GlobalOpts {
            state_dir: None,
            control: None,
            json: false,
            pretty: false,
            timeout_ms: None,
        }
    }

    #[test]
    fn control_socket_defaults_under_state_dir() {
        let mut o = opts();
        assert_eq!(o.control_socket(), PathBuf::from(".actd/control.sock"));
        o.state_dir = Some("/var/lib/actd".into());
        assert_eq!(o.control_socket(), PathBuf::from("/var/lib/actd/control.sock"));
        o.control = Some("/run/actd.sock".into());
        assert_eq!(o.control_socket(), PathBuf::from("/run/actd.sock"));
    }
}
