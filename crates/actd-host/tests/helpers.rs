//! Shared test helpers for the activation integration tests.
//!
//! Group processes are faked: the spawner records every launch and, unless
//! told otherwise, reports the group active on the daemon the way a real group
//! runtime would after reading its bootstrap. Each integration test compiles
//! this module separately, so some helpers look unused in some of them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actd_host::{
    Activation, AllowAllPolicy, DaemonConfig, ExecPolicy, GroupBootstrap, GroupProcess,
    GroupReport, InstantiateError, Instantiator, InstantiatorConnector, ProcessSpawner,
    SpawnRequest, Stub,
};
use actd_kernel::journal::mem::MemJournal;
use actd_kernel::{
    ActivationLog, GroupDescriptor, GroupId, KernelError, MemSnapshotStore, ObjectDescriptor,
    ObjectId, Registry, RegistrySnapshot, SnapshotStore,
};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

pub fn test_config() -> DaemonConfig {
    DaemonConfig {
        exec_timeout: Duration::from_secs(5),
        group_timeout: Duration::from_secs(2),
        snapshot_interval: 4,
        group_throttle: 3,
        max_tries: 2,
        ..DaemonConfig::default()
    }
}

type ExitState = Option<Option<i32>>;

/// One recorded launch.
#[derive(Clone)]
pub struct Launch {
    pub request: SpawnRequest,
    pub bootstrap: GroupBootstrap,
    exit: Arc<watch::Sender<ExitState>>,
}

impl Launch {
    pub fn endpoint(&self) -> String {
        fake_endpoint(&self.bootstrap)
    }

    pub fn exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

fn fake_endpoint(boot: &GroupBootstrap) -> String {
    format!("fake://{}/{}", boot.group, boot.incarnation)
}

pub struct FakeSpawner {
    launches: Mutex<Vec<Launch>>,
    auto_active: AtomicBool,
    fail_spawns: AtomicBool,
    next_pid: AtomicU32,
    boots: mpsc::UnboundedSender<GroupBootstrap>,
}

impl FakeSpawner {
    fn new(boots: mpsc::UnboundedSender<GroupBootstrap>) -> Self {
        Self {
            launches: Mutex::new(Vec::new()),
            auto_active: AtomicBool::new(true),
            fail_spawns: AtomicBool::new(false),
            next_pid: AtomicU32::new(1000),
            boots,
        }
    }

    pub fn set_auto_active(&self, on: bool) {
        self.auto_active.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_spawns(&self, on: bool) {
        self.fail_spawns.store(on, Ordering::SeqCst);
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    /// Makes the process behind launch `index` exit on its own.
    pub fn exit(&self, index: usize, code: i32) {
        let launch = self.launches.lock().unwrap()[index].clone();
        launch.exit.send_replace(Some(Some(code)));
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<Box<dyn GroupProcess>> {
        if self.fail_spawns.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
        }
        let bootstrap: GroupBootstrap = actd_cbor::from_cbor(&request.stdin)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        let (exit_tx, exit_rx) = watch::channel(None);
        let exit = Arc::new(exit_tx);
        self.launches.lock().unwrap().push(Launch {
            request: request.clone(),
            bootstrap: bootstrap.clone(),
            exit: exit.clone(),
        });
        if self.auto_active.load(Ordering::SeqCst) {
            let _ = self.boots.send(bootstrap);
        }
        Ok(Box::new(FakeProcess {
            pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
            exit,
            exit_rx,
        }))
    }
}

struct FakeProcess {
    pid: u32,
    exit: Arc<watch::Sender<ExitState>>,
    exit_rx: watch::Receiver<ExitState>,
}

#[async_trait]
impl GroupProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let state = *self
            .exit_rx
            .wait_for(|state| state.is_some())
            .await
            .map_err(|_| io::Error::other("process handle dropped"))?;
        Ok(state.flatten())
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.exit.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(None);
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

/// How the fake instantiator should answer for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    BadDescriptor,
    RemoteOnce,
    InactiveOnce,
}

#[derive(Default)]
pub struct FakeBackend {
    failures: Mutex<HashMap<ObjectId, Failure>>,
    attempts: AtomicUsize,
    created: AtomicUsize,
}

impl FakeBackend {
    pub fn fail(&self, object: ObjectId, failure: Failure) {
        self.failures.lock().unwrap().insert(object, failure);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

pub struct FakeConnector {
    backend: Arc<FakeBackend>,
}

#[async_trait]
impl InstantiatorConnector for FakeConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn Instantiator>, InstantiateError> {
        Ok(Arc::new(FakeInstantiator {
            endpoint: endpoint.to_string(),
            backend: self.backend.clone(),
        }))
    }
}

struct FakeInstantiator {
    endpoint: String,
    backend: Arc<FakeBackend>,
}

#[async_trait]
impl Instantiator for FakeInstantiator {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn new_instance(
        &self,
        id: ObjectId,
        desc: &ObjectDescriptor,
    ) -> Result<Stub, InstantiateError> {
        self.backend.attempts.fetch_add(1, Ordering::SeqCst);
        let failure = {
            let mut failures = self.backend.failures.lock().unwrap();
            match failures.get(&id).copied() {
                Some(Failure::BadDescriptor) => Some(Failure::BadDescriptor),
                Some(once) => failures.remove(&id).map(|_| once),
                None => None,
            }
        };
        match failure {
            Some(Failure::BadDescriptor) => {
                return Err(InstantiateError::BadDescriptor(format!(
                    "no class {}",
                    desc.class_name
                )));
            }
            Some(Failure::RemoteOnce) => {
                return Err(InstantiateError::Remote("constructor threw".into()));
            }
            Some(Failure::InactiveOnce) => {
                return Err(InstantiateError::Inactive("group is going away".into()));
            }
            None => {}
        }
        let n = self.backend.created.fetch_add(1, Ordering::SeqCst);
        Ok(Stub::new(format!("{}#{id}#{n}", self.endpoint).into_bytes()))
    }
}

/// Snapshot store that starts failing once `broken` is set.
pub struct BreakableSnapshots {
    inner: MemSnapshotStore,
    pub broken: Arc<AtomicBool>,
}

impl BreakableSnapshots {
    pub fn new(inner: MemSnapshotStore) -> Self {
        Self {
            inner,
            broken: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl SnapshotStore for BreakableSnapshots {
    fn load(&self) -> Result<Option<RegistrySnapshot>, KernelError> {
        self.inner.load()
    }

    fn store(&mut self, snapshot: &RegistrySnapshot) -> Result<(), KernelError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(KernelError::SnapshotFailed("no space left on device".into()));
        }
        self.inner.store(snapshot)
    }
}

/// A running activation system wired to fake processes and instantiators,
/// persisting into shared in-memory storage.
pub struct Harness {
    pub activation: Activation,
    pub spawner: Arc<FakeSpawner>,
    pub backend: Arc<FakeBackend>,
    pub journal: MemJournal,
    pub snapshots: MemSnapshotStore,
}

impl Harness {
    pub fn start(config: DaemonConfig) -> Self {
        Self::start_with(
            config,
            Arc::new(AllowAllPolicy),
            MemJournal::new(),
            MemSnapshotStore::new(),
        )
    }

    pub fn start_with(
        config: DaemonConfig,
        policy: Arc<dyn ExecPolicy>,
        journal: MemJournal,
        snapshots: MemSnapshotStore,
    ) -> Self {
        let store = Box::new(snapshots.clone());
        Self::start_with_store(config, policy, journal, snapshots, store)
    }

    /// Like [`Harness::start_with`], but the registry writes snapshots through
    /// `store` while `snapshots` is kept for later reboots.
    pub fn start_with_store(
        config: DaemonConfig,
        policy: Arc<dyn ExecPolicy>,
        journal: MemJournal,
        snapshots: MemSnapshotStore,
        store: Box<dyn SnapshotStore>,
    ) -> Self {
        let log = ActivationLog::new(Box::new(journal.clone()), store)
            .with_snapshot_interval(config.snapshot_interval);
        let registry = Registry::open(log).unwrap();
        let (boot_tx, mut boot_rx) = mpsc::unbounded_channel();
        let spawner = Arc::new(FakeSpawner::new(boot_tx));
        let backend = Arc::new(FakeBackend::default());
        let connector = Arc::new(FakeConnector {
            backend: backend.clone(),
        });
        let activation = Activation::start(config, registry, spawner.clone(), policy, connector);

        let runtime = activation.clone();
        tokio::spawn(async move {
            while let Some(boot) = boot_rx.recv().await {
                let _ = runtime
                    .system()
                    .active_group(boot.group, &fake_endpoint(&boot), boot.incarnation)
                    .await;
            }
        });

        Self {
            activation,
            spawner,
            backend,
            journal,
            snapshots,
        }
    }

    /// Shuts this daemon down and boots a new one over the same storage.
    pub async fn reboot(self, config: DaemonConfig) -> Self {
        self.activation.shutdown().await;
        Self::start_with(config, Arc::new(AllowAllPolicy), self.journal, self.snapshots)
    }

    pub async fn group(&self) -> GroupId {
        self.activation
            .system()
            .register_group(GroupDescriptor::default())
            .await
            .unwrap()
    }

    pub async fn object(&self, group: GroupId, restart: bool) -> ObjectId {
        self.activation
            .system()
            .register_object(ObjectDescriptor::new(group, "Echo").with_restart(restart))
            .await
            .unwrap()
    }

    /// Reports launch `index` active, as its group process would.
    pub async fn report_active(&self, index: usize) {
        let boot = self.spawner.launches()[index].bootstrap.clone();
        self.activation
            .system()
            .active_group(boot.group, &fake_endpoint(&boot), boot.incarnation)
            .await
            .unwrap();
    }

    pub async fn report(&self, group: GroupId) -> GroupReport {
        let status = self.activation.system().status().await.unwrap();
        status
            .groups
            .into_iter()
            .find(|report| report.group == group)
            .expect("group missing from status")
    }
}

/// Polls `cond` until it holds, panicking after a few seconds.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut cond: F) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
