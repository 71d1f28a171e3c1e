//! The activation system: registry, group supervisors and the three protocol
//! handles ([`Activator`], [`ActivationSystem`], [`ActivationMonitor`]) that
//! callers and group processes use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use actd_kernel::{GroupDescriptor, GroupId, ObjectDescriptor, ObjectId, Registry, SystemId};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;

use crate::config::DaemonConfig;
use crate::error::ActivationError;
use crate::group::{DaemonEvent, GroupContext, GroupHandle, GroupReport};
use crate::instantiator::{InstantiateError, InstantiatorConnector, SocketConnector, Stub};
use crate::policy::{ExecPolicy, GlobExecPolicy};
use crate::process::{ProcessSpawner, TokioSpawner, command_line, property_env};
use crate::throttle::StartupThrottle;

/// Owned handle on a running activation system. Cheap to clone.
#[derive(Clone)]
pub struct Activation {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Arc<GroupContext>,
    connector: Arc<dyn InstantiatorConnector>,
    groups: Mutex<HashMap<GroupId, GroupHandle>>,
    object_locks: Mutex<HashMap<ObjectId, Arc<tokio::sync::Mutex<()>>>>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: watch::Sender<bool>,
    fatal: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub system: String,
    pub shutting_down: bool,
    pub objects: usize,
    pub startup_slots_free: usize,
    pub groups: Vec<GroupReport>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Activation {
    /// Opens the registry under `config.state_dir` and starts the daemon with
    /// the stock collaborators (tokio process spawning, glob exec policy from
    /// the config, Unix socket instantiators).
    pub fn open(config: DaemonConfig) -> Result<Self, ActivationError> {
        let registry = Registry::open_dir(&config.state_dir, config.snapshot_interval)?;
        let policy = GlobExecPolicy::new(&config.allowed_commands, &config.allowed_options)
            .map_err(|err| ActivationError::InvalidConfig(format!("exec policy: {err}")))?;
        Ok(Self::start(
            config,
            registry,
            Arc::new(TokioSpawner),
            Arc::new(policy),
            Arc::new(SocketConnector),
        ))
    }

    /// Starts supervisors for every recovered group and reactivates the
    /// recovered restart-flagged objects. Must be called inside a tokio runtime.
    pub fn start(
        config: DaemonConfig,
        registry: Registry,
        spawner: Arc<dyn ProcessSpawner>,
        policy: Arc<dyn ExecPolicy>,
        connector: Arc<dyn InstantiatorConnector>,
    ) -> Self {
        let recovered: Vec<(GroupId, u64)> = registry
            .state()
            .groups()
            .map(|(id, record)| (*id, record.incarnation))
            .collect();
        let system = registry.system_id();
        let boot_restarts = registry.restart_candidates();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(GroupContext {
            throttle: StartupThrottle::new(config.group_throttle),
            config,
            registry: Arc::new(Mutex::new(registry)),
            spawner,
            policy,
            shutting_down: AtomicBool::new(false),
            events: events_tx,
        });
        let groups = recovered
            .iter()
            .map(|(id, incarnation)| (*id, GroupHandle::spawn(*id, *incarnation, ctx.clone())))
            .collect();
        let (shutdown_tx, _) = broadcast::channel(4);
        let (stopped, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            ctx,
            connector,
            groups: Mutex::new(groups),
            object_locks: Mutex::new(HashMap::new()),
            shutdown_tx,
            stopped,
            fatal: Mutex::new(None),
        });
        tokio::spawn(run_events(Arc::downgrade(&inner), events_rx));
        tracing::info!(%system, groups = recovered.len(), "activation system started");
        let activation = Self { inner };
        if !boot_restarts.is_empty() {
            let booting = activation.clone();
            tokio::spawn(async move { booting.restart_objects(boot_restarts).await });
        }
        activation
    }

    pub fn activator(&self) -> Activator {
        Activator {
            inner: self.inner.clone(),
        }
    }

    pub fn system(&self) -> ActivationSystem {
        ActivationSystem {
            activation: self.clone(),
        }
    }

    /// Monitor for a group that already reported itself active.
    pub fn monitor(&self, group: GroupId) -> Result<ActivationMonitor, ActivationError> {
        self.inner.group_handle(&group)?;
        Ok(ActivationMonitor {
            inner: self.inner.clone(),
            group,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.inner.ctx.config
    }

    pub fn system_id(&self) -> SystemId {
        self.inner.ctx.registry().system_id()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.ctx.is_shutting_down()
    }

    /// Fires once shutdown has completed.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.inner.shutdown_tx.subscribe()
    }

    /// Resolves when shutdown has completed, however it was triggered.
    pub async fn wait_stopped(&self) {
        let mut rx = self.inner.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Why the daemon stopped itself, if it did.
    pub fn fatal_error(&self) -> Option<String> {
        lock(&self.inner.fatal).clone()
    }

    /// Stops every group (killing processes and waiting for their exit within
    /// the grace period), takes a final snapshot and signals shutdown. Calls
    /// after the first one just wait for it to finish.
    pub async fn shutdown(&self) {
        let ctx = &self.inner.ctx;
        if ctx.shutting_down.swap(true, Ordering::SeqCst) {
            self.wait_stopped().await;
            return;
        }
        tracing::info!("activation system shutting down");
        ctx.throttle.close();

        let handles: Vec<GroupHandle> = lock(&self.inner.groups).drain().map(|(_, h)| h).collect();
        let mut stopping = JoinSet::new();
        for handle in handles {
            stopping.spawn(async move { handle.shutdown().await });
        }
        while stopping.join_next().await.is_some() {}

        if let Err(err) = ctx.registry().snapshot_now() {
            tracing::warn!(error = %err, "final registry snapshot failed");
        }
        let _ = self.inner.shutdown_tx.send(());
        self.inner.stopped.send_replace(true);
        tracing::info!("activation system stopped");
    }

    /// Reactivates every restart-flagged object in the registry.
    async fn restart_services(&self) {
        let candidates = self.inner.ctx.registry().restart_candidates();
        self.restart_objects(candidates).await;
    }

    async fn restart_objects(&self, candidates: Vec<ObjectId>) {
        if candidates.is_empty() {
            return;
        }
        tracing::info!(count = candidates.len(), "restarting services");
        let activator = self.activator();
        for id in candidates {
            if self.is_shutting_down() {
                return;
            }
            if let Err(err) = activator.activate(id, true).await {
                if self.is_shutting_down() {
                    return;
                }
                tracing::warn!(object = %id, error = %err, "unable to restart service");
            }
        }
    }
}

async fn run_events(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<DaemonEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let activation = Activation { inner };
        match event {
            DaemonEvent::RestartServices => {
                tokio::spawn(async move { activation.restart_services().await });
            }
            DaemonEvent::Fatal(reason) => {
                tracing::error!(%reason, "fatal persistence failure");
                lock(&activation.inner.fatal).get_or_insert(reason);
                tokio::spawn(async move { activation.shutdown().await });
            }
        }
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<(), ActivationError> {
        if self.ctx.is_shutting_down() {
            Err(ActivationError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn group_handle(&self, id: &GroupId) -> Result<GroupHandle, ActivationError> {
        lock(&self.groups)
            .get(id)
            .cloned()
            .ok_or(ActivationError::UnknownGroup(*id))
    }

    fn object_lock(&self, id: ObjectId) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.object_locks).entry(id).or_default().clone()
    }

    fn forget_object_lock(&self, id: &ObjectId) {
        lock(&self.object_locks).remove(id);
    }

    fn check_exec(&self, desc: &GroupDescriptor) -> Result<(), ActivationError> {
        let config = &self.ctx.config;
        let argv = command_line(desc, &config.group_command, &config.child_args);
        self.ctx.policy.check_exec(desc, &argv)?;
        property_env(desc).map_err(ActivationError::BadDescriptor)?;
        Ok(())
    }
}

/// Activates objects on behalf of callers.
#[derive(Clone)]
pub struct Activator {
    inner: Arc<Inner>,
}

impl Activator {
    /// Returns a live stub for `id`, starting its group if necessary.
    ///
    /// Without `force` a stub cached in the current incarnation is returned
    /// as-is. Failed attempts are retried up to `max_tries` times; a group that
    /// turns out to be inactive or unreachable is marked inactive first.
    pub async fn activate(&self, id: ObjectId, force: bool) -> Result<Stub, ActivationError> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let group = inner.ctx.registry().lookup_group(&id)?;
        let handle = inner.group_handle(&group)?;
        let object_lock = inner.object_lock(id);
        let _serialized = object_lock.lock().await;

        let tries = inner.ctx.config.max_tries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=tries {
            if !force {
                if let Some(stub) = handle.cached_stub(id).await? {
                    return Ok(stub);
                }
            }
            let desc = inner.ctx.registry().object_descriptor(&id)?.clone();
            let (instantiator, incarnation) = match handle.instantiator().await {
                Ok(lease) => lease,
                Err(ActivationError::ActivationFailed { reason }) => {
                    tracing::warn!(object = %id, attempt, %reason, "group startup failed");
                    last_error = reason;
                    continue;
                }
                Err(err) => return Err(err),
            };
            match instantiator.new_instance(id, &desc).await {
                Ok(stub) => {
                    tracing::debug!(object = %id, %group, incarnation, "object activated");
                    handle.object_activated(id, stub.clone(), incarnation).await;
                    return Ok(stub);
                }
                Err(InstantiateError::BadDescriptor(msg)) => {
                    return Err(ActivationError::BadDescriptor(msg));
                }
                Err(err) => {
                    tracing::warn!(object = %id, attempt, error = %err, "activation attempt failed");
                    match &err {
                        InstantiateError::Inactive(_) => {
                            handle.inactive_group(incarnation, false).await
                        }
                        InstantiateError::Unreachable(_) => {
                            handle.inactive_group(incarnation, true).await
                        }
                        _ => {}
                    }
                    last_error = err.to_string();
                }
            }
        }
        Err(ActivationError::failed(format!(
            "object activation failed after {tries} tries: {last_error}"
        )))
    }
}

/// Registration and administration surface.
#[derive(Clone)]
pub struct ActivationSystem {
    activation: Activation,
}

impl ActivationSystem {
    fn inner(&self) -> &Inner {
        &self.activation.inner
    }

    pub async fn register_group(&self, desc: GroupDescriptor) -> Result<GroupId, ActivationError> {
        let inner = self.inner();
        inner.ensure_running()?;
        inner.check_exec(&desc)?;
        let id = inner.ctx.mutate(|r| r.register_group(desc))?;
        let handle = GroupHandle::spawn(id, 0, inner.ctx.clone());
        lock(&inner.groups).insert(id, handle);
        tracing::info!(group = %id, "group registered");
        Ok(id)
    }

    /// Removes the group and all of its objects, killing its process.
    pub async fn unregister_group(&self, id: GroupId) -> Result<(), ActivationError> {
        let inner = self.inner();
        inner.ensure_running()?;
        let record = inner.ctx.mutate(|r| r.unregister_group(&id))?;
        for object in record.objects.keys() {
            inner.forget_object_lock(object);
        }
        let handle = lock(&inner.groups).remove(&id);
        if let Some(handle) = handle {
            handle.unregister().await;
        }
        Ok(())
    }

    pub async fn register_object(&self, desc: ObjectDescriptor) -> Result<ObjectId, ActivationError> {
        let inner = self.inner();
        inner.ensure_running()?;
        let group = desc.group;
        let id = inner.ctx.mutate(|r| r.register_object(desc))?;
        tracing::debug!(object = %id, %group, "object registered");
        Ok(id)
    }

    pub async fn unregister_object(&self, id: ObjectId) -> Result<(), ActivationError> {
        let inner = self.inner();
        inner.ensure_running()?;
        let desc = inner.ctx.mutate(|r| r.unregister_object(&id))?;
        inner.forget_object_lock(&id);
        if let Ok(handle) = inner.group_handle(&desc.group) {
            handle.inactive_object(id).await;
        }
        Ok(())
    }

    /// Replaces the object's descriptor and drops its cached stub.
    pub async fn set_object_descriptor(
        &self,
        id: ObjectId,
        desc: ObjectDescriptor,
    ) -> Result<ObjectDescriptor, ActivationError> {
        let inner = self.inner();
        inner.ensure_running()?;
        let old = inner.ctx.mutate(|r| r.set_object_descriptor(&id, desc))?;
        if let Ok(handle) = inner.group_handle(&old.group) {
            handle.inactive_object(id).await;
        }
        Ok(old)
    }

    /// Replaces the group's descriptor; takes effect on the next process start.
    pub async fn set_group_descriptor(
        &self,
        id: GroupId,
        desc: GroupDescriptor,
    ) -> Result<GroupDescriptor, ActivationError> {
        let inner = self.inner();
        inner.ensure_running()?;
        inner.check_exec(&desc)?;
        inner.ctx.mutate(|r| r.set_group_descriptor(&id, desc))
    }

    pub fn object_descriptor(&self, id: ObjectId) -> Result<ObjectDescriptor, ActivationError> {
        let inner = self.inner();
        inner.ensure_running()?;
        Ok(inner.ctx.registry().object_descriptor(&id)?.clone())
    }

    pub fn group_descriptor(&self, id: GroupId) -> Result<GroupDescriptor, ActivationError> {
        let inner = self.inner();
        inner.ensure_running()?;
        Ok(inner.ctx.registry().group(&id)?.descriptor.clone())
    }

    /// Called by a group process once its instantiator is listening at
    /// `endpoint`. Completes any activation waiting on the group.
    pub async fn active_group(
        &self,
        id: GroupId,
        endpoint: &str,
        incarnation: u64,
    ) -> Result<ActivationMonitor, ActivationError> {
        let inner = self.inner();
        inner.ensure_running()?;
        let handle = inner.group_handle(&id)?;
        let instantiator = inner.connector.connect(endpoint).await.map_err(|err| {
            ActivationError::failed(format!("cannot reach instantiator at {endpoint}: {err}"))
        })?;
        handle.active_group(instantiator, incarnation).await?;
        self.activation.monitor(id)
    }

    pub async fn status(&self) -> Result<DaemonStatus, ActivationError> {
        let inner = self.inner();
        let handles: Vec<GroupHandle> = lock(&inner.groups).values().cloned().collect();
        let mut groups = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(report) = handle.report().await {
                groups.push(report);
            }
        }
        groups.sort_by_key(|report| report.group);
        let registry = inner.ctx.registry();
        Ok(DaemonStatus {
            system: registry.system_id().to_string(),
            shutting_down: inner.ctx.is_shutting_down(),
            objects: registry.state().object_count(),
            startup_slots_free: inner.ctx.throttle.available(),
            groups,
        })
    }

    pub async fn shutdown(&self) {
        self.activation.shutdown().await;
    }
}

/// Callbacks a running group uses to report on its objects. Ignored once the
/// daemon is shutting down.
#[derive(Clone)]
pub struct ActivationMonitor {
    inner: Arc<Inner>,
    group: GroupId,
}

impl ActivationMonitor {
    pub fn group(&self) -> GroupId {
        self.group
    }

    fn owned_handle(&self, object: &ObjectId) -> Result<GroupHandle, ActivationError> {
        let owner = self.inner.ctx.registry().lookup_group(object)?;
        if owner != self.group {
            return Err(ActivationError::UnknownObject(*object));
        }
        self.inner.group_handle(&self.group)
    }

    pub async fn active_object(&self, id: ObjectId, stub: Stub) -> Result<(), ActivationError> {
        if self.inner.ctx.is_shutting_down() {
            return Ok(());
        }
        self.owned_handle(&id)?.active_object(id, stub).await;
        Ok(())
    }

    pub async fn inactive_object(&self, id: ObjectId) -> Result<(), ActivationError> {
        if self.inner.ctx.is_shutting_down() {
            return Ok(());
        }
        self.owned_handle(&id)?.inactive_object(id).await;
        Ok(())
    }

    /// Reports that the group's process for `incarnation` is going away. A
    /// stale incarnation is ignored.
    pub async fn inactive_group(&self, incarnation: u64) -> Result<(), ActivationError> {
        if self.inner.ctx.is_shutting_down() {
            return Ok(());
        }
        self.inner
            .group_handle(&self.group)?
            .inactive_group(incarnation, false)
            .await;
        Ok(())
    }
}
