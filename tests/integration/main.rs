//! Hive integration tests.
//!
//! Everything runs in-process over loopback: a throwaway PKI, real TLS
//! listeners, and the daemon's own loops. Workers accept through
//! `hived::worker::session` and execute in the sandbox; the master connects
//! through `hived::master::connection` and schedules with
//! `hived::master::scheduler`.

mod api;
mod cluster;
mod master;
mod tls;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use hive_core::config::{SandboxConfig, SchedulerConfig};
use hive_core::crypto::AuthToken;
use hive_core::message::{ResourceReport, Role};
use hive_services::discovery::{Candidate, CandidateTable};
use hive_services::{
    Dispatcher, DispatcherSettings, NodeInfo, Selector, TaskRecord, TlsIdentity, Transport,
    WorkerRegistry,
};
use hived::master::connection::{self, WorkerEvent};
use hived::master::scheduler;
use hived::worker::executor::Executor;
use hived::worker::session;

pub const WORKER_SERVER_NAME: &str = "hive-worker";
pub const STEP_TIMEOUT: Duration = Duration::from_secs(20);
const POLL: Duration = Duration::from_millis(20);

// ── PKI ───────────────────────────────────────────────────────────────────────

/// A CA plus one server and one client leaf, all PEM.
pub struct Pki {
    pub ca_pem: String,
    pub server_cert: String,
    pub server_key: String,
    pub client_cert: String,
    pub client_key: String,
}

fn leaf(
    names: Vec<String>,
    ca: &Certificate,
    ca_key: &KeyPair,
) -> Result<(String, String)> {
    let mut params = CertificateParams::new(names)?;
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let key = KeyPair::generate()?;
    let cert = params.signed_by(&key, ca, ca_key)?;
    Ok((cert.pem(), key.serialize_pem()))
}

impl Pki {
    pub fn generate() -> Result<Self> {
        let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate()?;
        let ca = ca_params.self_signed(&ca_key)?;

        let (server_cert, server_key) = leaf(
            vec![WORKER_SERVER_NAME.to_string(), "localhost".to_string()],
            &ca,
            &ca_key,
        )?;
        let (client_cert, client_key) = leaf(vec!["hive-master".to_string()], &ca, &ca_key)?;

        Ok(Self {
            ca_pem: ca.pem(),
            server_cert,
            server_key,
            client_cert,
            client_key,
        })
    }

    pub fn worker_tls(&self) -> Result<TlsIdentity> {
        Ok(TlsIdentity::from_pem(
            self.ca_pem.as_bytes(),
            Some((self.server_cert.as_bytes(), self.server_key.as_bytes())),
        )?)
    }

    pub fn master_tls(&self, with_client_cert: bool) -> Result<TlsIdentity> {
        let identity = with_client_cert
            .then(|| (self.client_cert.as_bytes(), self.client_key.as_bytes()));
        Ok(TlsIdentity::from_pem(self.ca_pem.as_bytes(), identity)?)
    }
}

pub fn token(secret: &str) -> AuthToken {
    AuthToken::from_bytes(secret.as_bytes()).expect("non-empty token")
}

fn scratch_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("hive-it-{}-{name}", std::process::id()))
}

// ── Test worker ───────────────────────────────────────────────────────────────

/// Knobs for a test worker.
#[derive(Clone)]
pub struct WorkerOptions {
    pub token: AuthToken,
    pub require_client_cert: bool,
    pub accelerator: bool,
}

impl WorkerOptions {
    pub fn new(token: AuthToken) -> Self {
        Self {
            token,
            require_client_cert: false,
            accelerator: false,
        }
    }
}

/// A worker listening on loopback, serving each master with the daemon's
/// session loop.
pub struct TestWorker {
    pub addr: SocketAddr,
    pub executor: Executor,
    shutdown: broadcast::Sender<()>,
    work_dir: PathBuf,
}

impl TestWorker {
    pub async fn spawn(pki: &Pki, name: &str, opts: WorkerOptions) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let info = NodeInfo {
            node_id: name.to_string(),
            role: Role::Worker,
            hostname: name.to_string(),
            listen_port: addr.port(),
        };
        let transport = Transport::server(
            &pki.worker_tls()?,
            opts.token.clone(),
            info,
            opts.require_client_cert,
        )?;

        let work_dir = scratch_dir(name);
        std::fs::create_dir_all(&work_dir)?;
        let executor = Executor::new(SandboxConfig {
            work_dir: work_dir.clone(),
            max_concurrent_tasks: 4,
            progress_interval_secs: 1,
            ..SandboxConfig::default()
        });
        let (_, reports) = watch::channel(Some(fake_report(name, opts.accelerator)));

        let (shutdown, _) = broadcast::channel::<()>(1);
        let accept_shutdown = shutdown.clone();
        let accept_executor = executor.clone();
        tokio::spawn(async move {
            let mut stop = accept_shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    accepted = listener.accept() => {
                        let Ok((tcp, peer)) = accepted else { break };
                        tokio::spawn(session::serve(
                            tcp,
                            peer,
                            transport.clone(),
                            accept_executor.clone(),
                            reports.clone(),
                            accept_shutdown.subscribe(),
                        ));
                    }
                }
            }
        });

        Ok(Self {
            addr,
            executor,
            shutdown,
            work_dir,
        })
    }

    pub fn id(&self) -> String {
        self.addr.to_string()
    }

    /// Drop the listener and every open session.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        self.stop();
        let _ = std::fs::remove_dir_all(&self.work_dir);
    }
}

fn fake_report(name: &str, accelerator: bool) -> ResourceReport {
    ResourceReport {
        cpu_percent: 10.0,
        mem_percent: 20.0,
        disk_free_gb: 100.0,
        has_accelerator: accelerator,
        accelerator: accelerator.then(|| "Test GPU".to_string()),
        core_count: 4,
        physical_cores: 4,
        memory_total_mb: 8192,
        hostname: name.to_string(),
        platform: "linux".to_string(),
        battery: None,
    }
}

/// Poll `done` until it holds or `STEP_TIMEOUT` passes.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut done: F) -> Result<()> {
    let deadline = Instant::now() + STEP_TIMEOUT;
    while !done() {
        if Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(POLL).await;
    }
    Ok(())
}

// ── Test master ───────────────────────────────────────────────────────────────

/// Scheduler settings for tests: a short tick, everything else default.
pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_ms: 20,
        ..SchedulerConfig::default()
    }
}

/// The master side: a dispatcher, the scheduler loop, and one connection
/// task per worker. Dropping it shuts all of them down.
pub struct TestMaster {
    pub dispatcher: Dispatcher,
    transport: Transport,
    table: CandidateTable,
    events: mpsc::UnboundedSender<WorkerEvent>,
    shutdown: broadcast::Sender<()>,
}

impl TestMaster {
    pub fn new(pki: &Pki, token: AuthToken, with_client_cert: bool) -> Result<Self> {
        Self::with_scheduler(pki, token, with_client_cert, scheduler_config())
    }

    pub fn with_scheduler(
        pki: &Pki,
        token: AuthToken,
        with_client_cert: bool,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let info = NodeInfo {
            node_id: "master@test".to_string(),
            role: Role::Master,
            hostname: "test".to_string(),
            listen_port: 0,
        };
        let transport = Transport::client(
            &pki.master_tls(with_client_cert)?,
            token,
            info,
            WORKER_SERVER_NAME,
        )?;
        let dispatcher = Dispatcher::new(
            WorkerRegistry::new(),
            Arc::new(Selector::new()),
            DispatcherSettings::from_config(&config, &SandboxConfig::default()),
        );

        let (shutdown, _) = broadcast::channel::<()>(1);
        let (events, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(scheduler::run(
            dispatcher.clone(),
            config,
            events_rx,
            shutdown.subscribe(),
        ));

        Ok(Self {
            dispatcher,
            transport,
            table: CandidateTable::new(Duration::from_secs(30)),
            events,
            shutdown,
        })
    }

    /// Start a connection task for `worker` and wait until it is registered.
    /// Fails if the handshake is refused.
    pub async fn connect(&self, worker: &TestWorker) -> Result<()> {
        let id = worker.id();
        let task = tokio::spawn(connection::run(
            Candidate::manual(worker.addr),
            self.transport.clone(),
            self.dispatcher.registry().clone(),
            self.table.clone(),
            self.events.clone(),
            self.shutdown.subscribe(),
        ));

        let deadline = Instant::now() + STEP_TIMEOUT;
        loop {
            let connected = self
                .dispatcher
                .registry()
                .get(&id)
                .is_some_and(|w| w.is_connected());
            if connected {
                return Ok(());
            }
            if task.is_finished() {
                bail!("connection to {id} ended before registration");
            }
            if Instant::now() >= deadline {
                bail!("timed out connecting to {id}");
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Feed an event to the scheduler as if a connection task sent it.
    pub fn inject(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    /// Whether a failed handshake put `worker` into cool-down.
    pub fn cooling_down(&self, worker: &TestWorker) -> bool {
        self.table.in_cooldown(&worker.id())
    }

    /// Wait until `done` holds; the scheduler runs on its own meanwhile.
    pub async fn run_until<F>(&self, what: &str, mut done: F) -> Result<()>
    where
        F: FnMut(&Dispatcher) -> bool,
    {
        eventually(what, || done(&self.dispatcher)).await
    }

    /// Wait until `worker` has delivered its first resource report.
    pub async fn wait_ready(&self, worker: &TestWorker) -> Result<()> {
        let id = worker.id();
        self.run_until("worker resources", |d| {
            d.registry()
                .get(&id)
                .is_some_and(|w| w.resources.is_some())
        })
        .await
    }

    pub fn task(&self, id: &str) -> Result<TaskRecord> {
        self.dispatcher
            .task(id)
            .with_context(|| format!("task {id} missing"))
    }
}

impl Drop for TestMaster {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}
