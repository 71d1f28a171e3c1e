//! Activation daemon runtime: per-group process supervisors, the activation
//! protocol handles, and the local control socket.

pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod group;
pub mod instantiator;
pub mod policy;
pub mod process;
pub mod throttle;
mod watchdog;

pub use config::DaemonConfig;
pub use control::{ControlClient, ControlServer};
pub use daemon::{Activation, ActivationMonitor, ActivationSystem, Activator, DaemonStatus};
pub use error::ActivationError;
pub use group::{GroupReport, GroupStatus};
pub use instantiator::{InstantiateError, Instantiator, InstantiatorConnector, SocketConnector, Stub};
pub use policy::{AllowAllPolicy, ExecPolicy, GlobExecPolicy, PolicyDenied};
pub use process::{GroupBootstrap, GroupProcess, ProcessSpawner, SpawnRequest, TokioSpawner};
pub use throttle::{StartupThrottle, ThrottlePermit};
