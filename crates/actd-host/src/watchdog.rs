use tokio::sync::mpsc;

use crate::group::GroupMsg;
use crate::process::GroupProcess;

/// Owner-side handle on a watchdog task. Dropping it disposes the watchdog:
/// the process is killed and its exit is never reported.
#[derive(Debug)]
pub(crate) struct Watchdog {
    incarnation: u64,
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<()>,
}

impl Watchdog {
    /// Starts watching `process`, which belongs to `incarnation`. The exit is
    /// reported to the owning group as [`GroupMsg::ProcessExited`].
    pub(crate) fn spawn(
        mut process: Box<dyn GroupProcess>,
        incarnation: u64,
        name: String,
        group_tx: mpsc::WeakSender<GroupMsg>,
    ) -> Self {
        let pid = process.id();
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let code = loop {
                tokio::select! {
                    exit = process.wait() => break exit,
                    cmd = kill_rx.recv() => match cmd {
                        Some(()) => {
                            tracing::debug!(group = %name, incarnation, "killing group process");
                            if let Err(err) = process.start_kill() {
                                tracing::warn!(group = %name, error = %err, "kill failed");
                            }
                        }
                        None => {
                            let _ = process.start_kill();
                            tracing::debug!(group = %name, incarnation, "watchdog disposed");
                            return;
                        }
                    },
                }
            };
            let code = match code {
                Ok(code) => code,
                Err(err) => {
                    tracing::warn!(group = %name, error = %err, "waiting on group process failed");
                    None
                }
            };
            tracing::info!(group = %name, incarnation, ?code, "group process exited");
            if let Some(tx) = group_tx.upgrade() {
                let _ = tx.send(GroupMsg::ProcessExited { incarnation, code }).await;
            }
        });
        Self {
            incarnation,
            pid,
            kill_tx,
        }
    }

    pub(crate) fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn kill(&self) {
        let _ = self.kill_tx.send(());
    }
}
