//! Per-group supervisor. Each registered group gets one task that owns its
//! transient state (status, live instantiator, cached stubs, child process);
//! everything else talks to it through [`GroupHandle`].

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use actd_kernel::{GroupId, KernelError, ObjectId, Registry};
use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, oneshot};

use crate::config::DaemonConfig;
use crate::error::ActivationError;
use crate::instantiator::{Instantiator, Stub};
use crate::policy::ExecPolicy;
use crate::process::{GroupBootstrap, ProcessSpawner, SpawnRequest, command_line, property_env};
use crate::throttle::{StartupThrottle, ThrottlePermit};
use crate::watchdog::Watchdog;

const INBOX_CAPACITY: usize = 64;

/// A live instantiator together with the incarnation it belongs to.
pub(crate) type InstantiatorLease = (Arc<dyn Instantiator>, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Normal,
    Creating,
    /// Allowed to exit on its own; will not be restarted.
    Terminate,
    /// Kill sent, waiting for the exit.
    Terminating,
}

/// Point-in-time view of one group, as returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    #[serde(serialize_with = "as_display")]
    pub group: GroupId,
    pub status: GroupStatus,
    pub incarnation: u64,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub cached_stubs: usize,
}

fn as_display<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

pub(crate) enum DaemonEvent {
    /// A group process died on its own; reactivate every restart-flagged object.
    RestartServices,
    /// The registry can no longer be persisted.
    Fatal(String),
}

/// Shared resources every group supervisor needs.
pub(crate) struct GroupContext {
    pub(crate) config: DaemonConfig,
    pub(crate) registry: Arc<Mutex<Registry>>,
    pub(crate) throttle: StartupThrottle,
    pub(crate) spawner: Arc<dyn ProcessSpawner>,
    pub(crate) policy: Arc<dyn ExecPolicy>,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) events: mpsc::UnboundedSender<DaemonEvent>,
}

impl GroupContext {
    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Runs a registry mutation. A snapshot failure is reported as fatal
    /// before the error is handed back.
    pub(crate) fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Registry) -> Result<T, KernelError>,
    ) -> Result<T, ActivationError> {
        let result = f(&mut self.registry());
        result.map_err(|err| {
            let err = ActivationError::from(err);
            if let ActivationError::SnapshotFailed(msg) = &err {
                tracing::error!(error = %msg, "registry snapshot failed; shutting down");
                let _ = self.events.send(DaemonEvent::Fatal(msg.clone()));
            }
            err
        })
    }
}

pub(crate) enum GroupMsg {
    CachedStub {
        object: ObjectId,
        resp: oneshot::Sender<Option<Stub>>,
    },
    GetInstantiator {
        resp: oneshot::Sender<Result<InstantiatorLease, ActivationError>>,
    },
    ObjectActivated {
        object: ObjectId,
        stub: Stub,
        incarnation: u64,
    },
    ActiveGroup {
        instantiator: Arc<dyn Instantiator>,
        incarnation: u64,
        resp: oneshot::Sender<Result<(), ActivationError>>,
    },
    InactiveGroup {
        incarnation: u64,
        failure: bool,
    },
    ActiveObject {
        object: ObjectId,
        stub: Stub,
    },
    InactiveObject {
        object: ObjectId,
    },
    PermitGranted {
        permit: Result<ThrottlePermit, ActivationError>,
    },
    ProcessExited {
        incarnation: u64,
        code: Option<i32>,
    },
    CreateTimeout {
        incarnation: u64,
    },
    TerminateDeadline {
        incarnation: u64,
    },
    Report {
        resp: oneshot::Sender<GroupReport>,
    },
    Unregister,
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub(crate) struct GroupHandle {
    id: GroupId,
    tx: mpsc::Sender<GroupMsg>,
}

impl GroupHandle {
    pub(crate) fn spawn(id: GroupId, incarnation: u64, ctx: Arc<GroupContext>) -> Self {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let supervisor = GroupSupervisor {
            id,
            ctx,
            self_tx: tx.downgrade(),
            status: GroupStatus::Normal,
            incarnation,
            instantiator: None,
            stubs: HashMap::new(),
            child: None,
            restart_on_exit: true,
            removed: false,
            stopping: false,
            acquiring: false,
            start_after_exit: false,
            permit: None,
            waiters: Vec::new(),
            stop_waiters: Vec::new(),
        };
        tokio::spawn(supervisor.run(rx));
        Self { id, tx }
    }

    async fn ask<T>(
        &self,
        msg: impl FnOnce(oneshot::Sender<T>) -> GroupMsg,
    ) -> Result<T, ActivationError> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(msg(resp))
            .await
            .map_err(|_| ActivationError::UnknownGroup(self.id))?;
        rx.await.map_err(|_| ActivationError::UnknownGroup(self.id))
    }

    async fn tell(&self, msg: GroupMsg) {
        let _ = self.tx.send(msg).await;
    }

    pub(crate) async fn cached_stub(&self, object: ObjectId) -> Result<Option<Stub>, ActivationError> {
        self.ask(|resp| GroupMsg::CachedStub { object, resp }).await
    }

    /// Returns the live instantiator, starting the group process if needed.
    pub(crate) async fn instantiator(&self) -> Result<InstantiatorLease, ActivationError> {
        self.ask(|resp| GroupMsg::GetInstantiator { resp }).await?
    }

    pub(crate) async fn object_activated(&self, object: ObjectId, stub: Stub, incarnation: u64) {
        self.tell(GroupMsg::ObjectActivated {
            object,
            stub,
            incarnation,
        })
        .await;
    }

    pub(crate) async fn active_group(
        &self,
        instantiator: Arc<dyn Instantiator>,
        incarnation: u64,
    ) -> Result<(), ActivationError> {
        self.ask(|resp| GroupMsg::ActiveGroup {
            instantiator,
            incarnation,
            resp,
        })
        .await?
    }

    pub(crate) async fn inactive_group(&self, incarnation: u64, failure: bool) {
        self.tell(GroupMsg::InactiveGroup {
            incarnation,
            failure,
        })
        .await;
    }

    pub(crate) async fn active_object(&self, object: ObjectId, stub: Stub) {
        self.tell(GroupMsg::ActiveObject { object, stub }).await;
    }

    pub(crate) async fn inactive_object(&self, object: ObjectId) {
        self.tell(GroupMsg::InactiveObject { object }).await;
    }

    pub(crate) async fn report(&self) -> Result<GroupReport, ActivationError> {
        self.ask(|resp| GroupMsg::Report { resp }).await
    }

    pub(crate) async fn unregister(&self) {
        self.tell(GroupMsg::Unregister).await;
    }

    /// Stops the supervisor, killing its process and waiting for the exit
    /// (bounded by the group grace period).
    pub(crate) async fn shutdown(&self) {
        let _ = self.ask(|resp| GroupMsg::Shutdown { resp }).await;
    }
}

struct ChildProcess {
    watchdog: Watchdog,
    name: String,
    reported_active: bool,
}

struct GroupSupervisor {
    id: GroupId,
    ctx: Arc<GroupContext>,
    self_tx: mpsc::WeakSender<GroupMsg>,
    status: GroupStatus,
    incarnation: u64,
    instantiator: Option<Arc<dyn Instantiator>>,
    stubs: HashMap<ObjectId, Stub>,
    child: Option<ChildProcess>,
    restart_on_exit: bool,
    removed: bool,
    stopping: bool,
    acquiring: bool,
    start_after_exit: bool,
    permit: Option<ThrottlePermit>,
    waiters: Vec<oneshot::Sender<Result<InstantiatorLease, ActivationError>>>,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

impl GroupSupervisor {
    async fn run(mut self, mut inbox: mpsc::Receiver<GroupMsg>) {
        tracing::debug!(group = %self.id, incarnation = self.incarnation, "group supervisor started");
        while let Some(msg) = inbox.recv().await {
            self.handle(msg);
            if (self.removed || self.stopping) && self.child.is_none() {
                break;
            }
        }
        for tx in self.stop_waiters.drain(..) {
            let _ = tx.send(());
        }
        tracing::debug!(group = %self.id, "group supervisor stopped");
    }

    fn handle(&mut self, msg: GroupMsg) {
        match msg {
            GroupMsg::CachedStub { object, resp } => {
                let _ = resp.send(self.stubs.get(&object).cloned());
            }
            GroupMsg::GetInstantiator { resp } => self.get_instantiator(resp),
            GroupMsg::ObjectActivated {
                object,
                stub,
                incarnation,
            } => {
                if incarnation == self.incarnation
                    && self.instantiator.is_some()
                    && self.owns(&object)
                {
                    self.stubs.insert(object, stub);
                }
            }
            GroupMsg::ActiveGroup {
                instantiator,
                incarnation,
                resp,
            } => {
                let _ = resp.send(self.active_group(instantiator, incarnation));
            }
            GroupMsg::InactiveGroup {
                incarnation,
                failure,
            } => self.inactive_group(incarnation, failure),
            GroupMsg::ActiveObject { object, stub } => {
                self.stubs.insert(object, stub);
            }
            GroupMsg::InactiveObject { object } => {
                self.stubs.remove(&object);
            }
            GroupMsg::PermitGranted { permit } => self.permit_granted(permit),
            GroupMsg::ProcessExited { incarnation, code } => self.process_exited(incarnation, code),
            GroupMsg::CreateTimeout { incarnation } => {
                if incarnation == self.incarnation && self.status == GroupStatus::Creating {
                    let reason = if self.removed {
                        "activation group unregistered"
                    } else {
                        "timeout creating child process"
                    };
                    tracing::warn!(group = %self.id, incarnation, "{reason}");
                    self.fail_waiters(|| ActivationError::failed(reason));
                    self.terminate();
                }
            }
            GroupMsg::TerminateDeadline { incarnation } => {
                let current = self.child.as_ref().map(|c| c.watchdog.incarnation());
                if current == Some(incarnation) && self.status == GroupStatus::Terminating {
                    tracing::warn!(
                        group = %self.id,
                        incarnation,
                        "group process did not exit within the grace period; abandoning it"
                    );
                    if let Some(child) = self.child.take() {
                        self.child_gone(child);
                    }
                }
            }
            GroupMsg::Report { resp } => {
                let _ = resp.send(self.report());
            }
            GroupMsg::Unregister => {
                tracing::info!(group = %self.id, "group unregistered");
                self.removed = true;
                self.reset();
                let id = self.id;
                self.fail_waiters(|| ActivationError::UnknownGroup(id));
                self.terminate();
            }
            GroupMsg::Shutdown { resp } => {
                self.stopping = true;
                self.reset();
                self.fail_waiters(|| ActivationError::ShuttingDown);
                self.stop_waiters.push(resp);
                self.terminate();
            }
        }
    }

    fn get_instantiator(&mut self, resp: oneshot::Sender<Result<InstantiatorLease, ActivationError>>) {
        if self.removed {
            let _ = resp.send(Err(ActivationError::UnknownGroup(self.id)));
            return;
        }
        if self.stopping || self.ctx.is_shutting_down() {
            let _ = resp.send(Err(ActivationError::ShuttingDown));
            return;
        }
        if let Some(inst) = &self.instantiator {
            let _ = resp.send(Ok((inst.clone(), self.incarnation)));
            return;
        }
        self.waiters.push(resp);
        match self.status {
            GroupStatus::Creating => {}
            GroupStatus::Normal if self.child.is_none() => self.request_permit(),
            GroupStatus::Normal | GroupStatus::Terminate | GroupStatus::Terminating => {
                self.terminate();
                self.start_after_exit = true;
            }
        }
    }

    fn request_permit(&mut self) {
        if self.acquiring || self.permit.is_some() {
            return;
        }
        self.acquiring = true;
        let throttle = self.ctx.throttle.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let permit = throttle.acquire().await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(GroupMsg::PermitGranted { permit }).await;
            }
        });
    }

    fn permit_granted(&mut self, permit: Result<ThrottlePermit, ActivationError>) {
        self.acquiring = false;
        let permit = match permit {
            Ok(permit) => permit,
            Err(_) => {
                self.fail_waiters(|| ActivationError::ShuttingDown);
                return;
            }
        };
        if self.waiters.is_empty() || self.removed || self.stopping {
            return;
        }
        if self.child.is_some() {
            self.start_after_exit = true;
            return;
        }
        self.start_process(permit);
    }

    fn start_process(&mut self, permit: ThrottlePermit) {
        let ctx = self.ctx.clone();
        let config = &ctx.config;
        let desc = match ctx.registry().group(&self.id) {
            Ok(record) => record.descriptor.clone(),
            Err(_) => {
                let id = self.id;
                self.fail_waiters(|| ActivationError::UnknownGroup(id));
                return;
            }
        };
        let argv = command_line(&desc, &config.group_command, &config.child_args);
        if let Err(denied) = ctx.policy.check_exec(&desc, &argv) {
            tracing::warn!(group = %self.id, command = ?argv, reason = %denied, "group exec denied");
            self.fail_waiters(|| ActivationError::failed(format!("exec denied: {denied}")));
            return;
        }
        let env = match property_env(&desc) {
            Ok(env) => env,
            Err(reason) => {
                self.fail_waiters(|| ActivationError::BadDescriptor(reason.clone()));
                return;
            }
        };

        let incarnation = self.incarnation + 1;
        if let Err(err) = ctx.mutate(|r| r.set_incarnation(&self.id, incarnation)) {
            let reason = err.to_string();
            self.fail_waiters(|| ActivationError::failed(reason.clone()));
            return;
        }
        self.incarnation = incarnation;

        let bootstrap = GroupBootstrap {
            group: self.id,
            incarnation,
            descriptor: desc.clone(),
            control: config.control_socket.display().to_string(),
        };
        let stdin = match actd_cbor::to_canonical_cbor(&bootstrap) {
            Ok(bytes) => bytes,
            Err(err) => {
                let reason = format!("unable to encode group bootstrap: {err}");
                self.fail_waiters(|| ActivationError::failed(reason.clone()));
                return;
            }
        };
        let Some((program, args)) = argv.split_first() else {
            self.fail_waiters(|| ActivationError::failed("empty group command line"));
            return;
        };
        let request = SpawnRequest {
            name: permit.name().to_string(),
            program: program.clone(),
            args: args.to_vec(),
            env,
            stdin,
        };

        tracing::info!(
            group = %self.id,
            process = %request.name,
            incarnation,
            command = ?argv,
            "starting group process"
        );
        let process = match ctx.spawner.spawn(&request) {
            Ok(process) => process,
            Err(err) => {
                tracing::warn!(group = %self.id, error = %err, "unable to create activation group");
                let reason = format!("unable to create activation group: {err}");
                self.fail_waiters(|| ActivationError::failed(reason.clone()));
                return;
            }
        };
        let watchdog = Watchdog::spawn(process, incarnation, request.name.clone(), self.self_tx.clone());
        self.child = Some(ChildProcess {
            watchdog,
            name: request.name,
            reported_active: false,
        });
        self.status = GroupStatus::Creating;
        self.restart_on_exit = true;
        self.permit = Some(permit);
        let exec_timeout = config.exec_timeout;
        self.schedule(exec_timeout, GroupMsg::CreateTimeout { incarnation });
    }

    fn active_group(
        &mut self,
        inst: Arc<dyn Instantiator>,
        incarnation: u64,
    ) -> Result<(), ActivationError> {
        if self.removed {
            return Err(ActivationError::UnknownGroup(self.id));
        }
        if incarnation != self.incarnation {
            return Err(ActivationError::GroupCreationRace("invalid incarnation".into()));
        }
        if let Some(current) = &self.instantiator {
            return if current.endpoint() == inst.endpoint() {
                Ok(())
            } else {
                Err(ActivationError::GroupCreationRace("group already active".into()))
            };
        }
        if self.child.is_some() && self.status != GroupStatus::Creating {
            return Err(ActivationError::GroupCreationRace(
                "group not being created".into(),
            ));
        }

        tracing::info!(group = %self.id, incarnation, endpoint = inst.endpoint(), "group active");
        self.status = GroupStatus::Normal;
        self.permit = None;
        if let Some(child) = &mut self.child {
            child.reported_active = true;
        }
        self.instantiator = Some(inst.clone());
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok((inst.clone(), incarnation)));
        }
        Ok(())
    }

    fn inactive_group(&mut self, incarnation: u64, failure: bool) {
        if incarnation != self.incarnation {
            tracing::debug!(
                group = %self.id,
                incarnation,
                current = self.incarnation,
                "ignoring stale inactive-group"
            );
            return;
        }
        tracing::info!(group = %self.id, incarnation, failure, "group marked inactive");
        self.reset();
        if failure {
            self.terminate();
        } else if self.child.is_some() && self.status == GroupStatus::Normal {
            self.status = GroupStatus::Terminate;
            self.restart_on_exit = false;
        }
    }

    fn process_exited(&mut self, incarnation: u64, code: Option<i32>) {
        let current = self.child.as_ref().map(|c| c.watchdog.incarnation());
        if current != Some(incarnation) {
            tracing::debug!(group = %self.id, incarnation, "ignoring exit of a replaced process");
            return;
        }
        let Some(child) = self.child.take() else {
            return;
        };
        let restart = self.restart_on_exit
            && child.reported_active
            && !self.removed
            && !self.stopping
            && !self.ctx.is_shutting_down();
        tracing::info!(group = %self.id, incarnation, ?code, restart, "group process gone");
        self.child_gone(child);
        if restart {
            let _ = self.ctx.events.send(DaemonEvent::RestartServices);
        }
    }

    /// Forgets the (dead or abandoned) child. Dropping `child` disposes its watchdog.
    fn child_gone(&mut self, child: ChildProcess) {
        drop(child);
        let was_creating = self.status == GroupStatus::Creating;
        self.reset();
        self.status = GroupStatus::Normal;
        self.permit = None;
        if was_creating {
            self.fail_waiters(|| {
                ActivationError::failed("group process exited before reporting active")
            });
        }
        if std::mem::take(&mut self.start_after_exit)
            && !self.waiters.is_empty()
            && !self.removed
            && !self.stopping
        {
            self.request_permit();
        }
    }

    /// Kills the child unless it is already being killed.
    fn terminate(&mut self) {
        let Some(child) = &self.child else {
            return;
        };
        if self.status == GroupStatus::Terminating {
            return;
        }
        child.watchdog.kill();
        let incarnation = child.watchdog.incarnation();
        self.status = GroupStatus::Terminating;
        self.permit = None;
        let grace = self.ctx.config.group_timeout;
        self.schedule(grace, GroupMsg::TerminateDeadline { incarnation });
    }

    fn reset(&mut self) {
        self.instantiator = None;
        self.stubs.clear();
    }

    fn fail_waiters(&mut self, err: impl Fn() -> ActivationError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err()));
        }
    }

    fn owns(&self, object: &ObjectId) -> bool {
        self.ctx
            .registry()
            .lookup_group(object)
            .is_ok_and(|group| group == self.id)
    }

    fn schedule(&self, after: Duration, msg: GroupMsg) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(msg).await;
            }
        });
    }

    fn report(&self) -> GroupReport {
        GroupReport {
            group: self.id,
            status: self.status,
            incarnation: self.incarnation,
            active: self.instantiator.is_some(),
            process: self.child.as_ref().map(|c| c.name.clone()),
            pid: self.child.as_ref().and_then(|c| c.watchdog.pid()),
            cached_stubs: self.stubs.len(),
        }
    }
}
