//! Lifecycle supervision of the single backend instance
//!
//! The supervisor owns exactly one [`ContainerHandle`], created lazily on the
//! first proxied request. Starts are serialized by an async mutex held for the
//! whole cold start, so any number of concurrent cold requests produce one
//! start. A failed start is shared the same way: callers that queued behind
//! it receive its error instead of retrying one after another. Requests hold
//! a [`ContainerLease`] while they are forwarded; the
//! idle monitor never stops a handle with outstanding leases, and releasing a
//! lease resets the idle timer.

use crate::config::ContainerConfig;
use parking_lot::Mutex;
use std::ops::Deref;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Not running; the next request starts it
    Stopped,
    /// Cold start in progress, waiting for readiness
    Starting,
    /// Ready to accept traffic
    Running,
}

/// Why the backend was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No requests arrived within the idle window
    Idle,
    /// The backend process exited on its own
    Exited,
    /// The gateway is shutting down
    Shutdown,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Idle => f.write_str("idle"),
            StopReason::Exited => f.write_str("exited"),
            StopReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("unknown container binding: {0}")]
    UnknownBinding(String),
    #[error("failed to spawn backend: {0}")]
    Spawn(#[source] Arc<std::io::Error>),
    #[error("backend exited during startup ({0})")]
    Exited(String),
    #[error("backend not ready after {} seconds", .0.as_secs())]
    StartTimeout(Duration),
}

/// Observers of lifecycle transitions.
///
/// Implementations must not panic; they run inline with start and stop.
pub trait LifecycleHooks: Send + Sync {
    fn on_start(&self, binding: &str, port: u16);
    fn on_stop(&self, binding: &str, reason: StopReason);
    fn on_error(&self, binding: &str, error: &SupervisorError);
}

/// Default hooks: structured log lines only
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

impl LifecycleHooks for LoggingHooks {
    fn on_start(&self, binding: &str, port: u16) {
        info!(binding, port, "Container started");
    }

    fn on_stop(&self, binding: &str, reason: StopReason) {
        info!(binding, %reason, "Container stopped");
    }

    fn on_error(&self, binding: &str, error: &SupervisorError) {
        error!(binding, error = %error, "Container error");
    }
}

/// Counters for lifecycle events
#[derive(Debug, Default)]
pub struct SupervisorStats {
    starts: AtomicU64,
    stops: AtomicU64,
    errors: AtomicU64,
}

impl SupervisorStats {
    pub fn starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn stops(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

struct HandleState {
    state: ContainerState,
    idle_since: Instant,
    child: Option<Child>,
    /// Completed start attempts, successful or not
    start_attempts: u64,
    /// Outcome of the latest attempt when it failed
    last_failure: Option<SupervisorError>,
}

/// The single supervised backend instance
pub struct ContainerHandle {
    binding: String,
    port: u16,
    state: Mutex<HandleState>,
    /// Held for the duration of a start or stop
    start_lock: tokio::sync::Mutex<()>,
    in_flight: AtomicUsize,
}

impl ContainerHandle {
    fn new(binding: &str, port: u16) -> Self {
        Self {
            binding: binding.to_string(),
            port,
            state: Mutex::new(HandleState {
                state: ContainerState::Stopped,
                idle_since: Instant::now(),
                child: None,
                start_attempts: 0,
                last_failure: None,
            }),
            start_lock: tokio::sync::Mutex::new(()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    /// Fixed internal port the backend listens on
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ContainerState {
        self.state.lock().state
    }

    /// Time since the last request finished
    pub fn idle_for(&self) -> Duration {
        self.state.lock().idle_since.elapsed()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Reset the idle timer
    pub fn touch(&self) {
        self.state.lock().idle_since = Instant::now();
    }

    /// Take a lease if the backend is running; checked and counted under one lock
    fn try_lease(self: &Arc<Self>) -> Option<ContainerLease> {
        let guard = self.state.lock();
        if guard.state != ContainerState::Running {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(ContainerLease {
            handle: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut guard = self.state.lock();
        guard.idle_since = Instant::now();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A running backend reserved for one request.
///
/// Dropping the lease resets the idle timer.
pub struct ContainerLease {
    handle: Arc<ContainerHandle>,
}

impl ContainerLease {
    pub fn handle(&self) -> &Arc<ContainerHandle> {
        &self.handle
    }
}

impl Deref for ContainerLease {
    type Target = ContainerHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        self.handle.release();
    }
}

/// Owns the backend's lifecycle.
///
/// `Supervisor::new` returns `Arc<Self>` because the idle monitor task and
/// every request handler share it.
pub struct Supervisor {
    config: ContainerConfig,
    hooks: Arc<dyn LifecycleHooks>,
    handle: OnceLock<Arc<ContainerHandle>>,
    stats: SupervisorStats,
}

impl Supervisor {
    pub fn new(config: ContainerConfig) -> Arc<Self> {
        Self::with_hooks(config, Arc::new(LoggingHooks))
    }

    pub fn with_hooks(config: ContainerConfig, hooks: Arc<dyn LifecycleHooks>) -> Arc<Self> {
        Arc::new(Self {
            config,
            hooks,
            handle: OnceLock::new(),
            stats: SupervisorStats::default(),
        })
    }

    pub fn binding(&self) -> &str {
        &self.config.binding
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    /// The handle, if a request has created it yet
    pub fn handle(&self) -> Option<Arc<ContainerHandle>> {
        self.handle.get().cloned()
    }

    pub fn state(&self) -> ContainerState {
        self.handle
            .get()
            .map(|h| h.state())
            .unwrap_or(ContainerState::Stopped)
    }

    /// Return a lease on the running backend, starting it if needed
    pub async fn get_or_start(&self, binding: &str) -> Result<ContainerLease, SupervisorError> {
        if binding != self.config.binding {
            return Err(SupervisorError::UnknownBinding(binding.to_string()));
        }

        let handle = Arc::clone(self.handle.get_or_init(|| {
            debug!(binding, port = self.config.port, "Creating container handle");
            Arc::new(ContainerHandle::new(binding, self.config.port))
        }));

        loop {
            if let Some(lease) = handle.try_lease() {
                return Ok(lease);
            }

            let observed = handle.state.lock().start_attempts;
            let _start = handle.start_lock.lock().await;
            if let Some(lease) = handle.try_lease() {
                return Ok(lease);
            }

            // A start finished while we queued; if it failed, share its result
            {
                let guard = handle.state.lock();
                if guard.start_attempts != observed {
                    if let Some(failure) = &guard.last_failure {
                        return Err(failure.clone());
                    }
                }
            }

            self.start(&handle).await?;
        }
    }

    /// Cold start; the caller holds `start_lock`
    async fn start(&self, handle: &ContainerHandle) -> Result<(), SupervisorError> {
        handle.state.lock().state = ContainerState::Starting;

        let result = match self.spawn_backend() {
            Ok(child) => {
                handle.state.lock().child = child;
                self.wait_until_ready(handle).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                {
                    let mut guard = handle.state.lock();
                    guard.state = ContainerState::Running;
                    guard.idle_since = Instant::now();
                    guard.start_attempts += 1;
                    guard.last_failure = None;
                }
                self.stats.starts.fetch_add(1, Ordering::Relaxed);
                self.hooks.on_start(&handle.binding, handle.port);
                Ok(())
            }
            Err(e) => {
                let child = {
                    let mut guard = handle.state.lock();
                    guard.state = ContainerState::Stopped;
                    guard.start_attempts += 1;
                    guard.last_failure = Some(e.clone());
                    guard.child.take()
                };
                if let Some(child) = child {
                    terminate(&handle.binding, child, Duration::ZERO).await;
                }
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                self.hooks.on_error(&handle.binding, &e);
                Err(e)
            }
        }
    }

    /// Spawn the configured command; attached backends have nothing to spawn
    fn spawn_backend(&self) -> Result<Option<Child>, SupervisorError> {
        let Some(command) = self.config.command.as_ref() else {
            debug!(binding = %self.config.binding, port = self.config.port, "Probing attached backend");
            return Ok(None);
        };

        info!(binding = %self.config.binding, command = %command, "Starting backend process");

        let mut cmd = Command::new(command);
        cmd.args(&self.config.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        cmd.env("PORT", self.config.port.to_string());

        let child = cmd.spawn().map_err(|e| SupervisorError::Spawn(Arc::new(e)))?;
        info!(binding = %self.config.binding, pid = child.id().unwrap_or(0), "Backend process spawned");
        Ok(Some(child))
    }

    /// Poll the readiness path until it answers or the startup timeout passes
    async fn wait_until_ready(&self, handle: &ContainerHandle) -> Result<(), SupervisorError> {
        let timeout = self.config.startup_timeout();
        let interval = self.config.health_check_interval();
        let start = Instant::now();

        loop {
            if let Some(status) = exited_status(handle) {
                return Err(SupervisorError::Exited(status));
            }

            if check_ready(handle.port, &self.config.health_path).await {
                debug!(binding = %handle.binding, elapsed_ms = start.elapsed().as_millis(), "Backend is ready");
                return Ok(());
            }

            if start.elapsed() >= timeout {
                return Err(SupervisorError::StartTimeout(timeout));
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Stop the backend if it has been idle for the full window with no
    /// requests in flight. Skips the round when a start is in progress.
    pub async fn stop_if_idle(&self) -> bool {
        let Some(handle) = self.handle.get() else {
            return false;
        };
        let idle_timeout = self.config.idle_timeout();
        let expired = |s: &HandleState| {
            s.state == ContainerState::Running
                && handle.in_flight() == 0
                && s.idle_since.elapsed() >= idle_timeout
        };

        let expired_now = expired(&*handle.state.lock());
        if !expired_now {
            return false;
        }
        let Ok(_start) = handle.start_lock.try_lock() else {
            return false;
        };

        self.stop_where(handle, StopReason::Idle, expired).await
    }

    /// Mark a crashed backend as stopped so the next request restarts it
    pub async fn reap_exited(&self) -> bool {
        let Some(handle) = self.handle.get() else {
            return false;
        };
        let Ok(_start) = handle.start_lock.try_lock() else {
            return false;
        };

        let status = {
            let mut guard = handle.state.lock();
            if guard.state != ContainerState::Running {
                return false;
            }
            let status = match guard.child.as_mut().map(|c| c.try_wait()) {
                Some(Ok(Some(status))) => status.to_string(),
                _ => return false,
            };
            guard.state = ContainerState::Stopped;
            guard.child = None;
            status
        };

        warn!(binding = %handle.binding, %status, "Backend process exited while running");
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        self.stats.stops.fetch_add(1, Ordering::Relaxed);
        self.hooks.on_error(&handle.binding, &SupervisorError::Exited(status));
        self.hooks.on_stop(&handle.binding, StopReason::Exited);
        true
    }

    /// Stop the backend unconditionally (gateway shutdown)
    pub async fn shutdown(&self) {
        let Some(handle) = self.handle.get() else {
            return;
        };
        let _start = handle.start_lock.lock().await;
        self.stop_where(handle, StopReason::Shutdown, |s| {
            s.state == ContainerState::Running
        })
        .await;
    }

    /// Transition to stopped if `should_stop` holds; caller holds `start_lock`
    async fn stop_where<F>(&self, handle: &ContainerHandle, reason: StopReason, should_stop: F) -> bool
    where
        F: Fn(&HandleState) -> bool,
    {
        let child = {
            let mut guard = handle.state.lock();
            if !should_stop(&*guard) {
                return false;
            }
            info!(
                binding = %handle.binding,
                idle_secs = guard.idle_since.elapsed().as_secs(),
                %reason,
                "Stopping backend"
            );
            guard.state = ContainerState::Stopped;
            guard.child.take()
        };

        if let Some(child) = child {
            terminate(&handle.binding, child, self.config.shutdown_grace_period()).await;
        }

        self.stats.stops.fetch_add(1, Ordering::Relaxed);
        self.hooks.on_stop(&handle.binding, reason);
        true
    }

    /// Run the idle monitor until shutdown is signalled
    pub fn spawn_idle_monitor(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let interval = self.config.idle_check_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        supervisor.reap_exited().await;
                        supervisor.stop_if_idle().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Idle monitor stopped");
        })
    }
}

fn exited_status(handle: &ContainerHandle) -> Option<String> {
    let mut guard = handle.state.lock();
    match guard.child.as_mut().map(|c| c.try_wait()) {
        Some(Ok(Some(status))) => Some(status.to_string()),
        Some(Err(e)) => Some(e.to_string()),
        _ => None,
    }
}

/// Readiness check: any non-5xx answer on the health path
async fn check_ready(port: u16, path: &str) -> bool {
    let host_port = format!("127.0.0.1:{}", port);

    let connect = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(&host_port),
    )
    .await;

    let mut stream = match connect {
        Ok(Ok(s)) => s,
        Ok(Err(_)) | Err(_) => return false,
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host_port
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let status_line = tokio::time::timeout(Duration::from_secs(2), async {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok::<_, std::io::Error>(line)
    })
    .await;

    match status_line {
        // Format: "HTTP/1.1 200 OK\r\n"
        Ok(Ok(line)) => line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .map(|code| (100..500).contains(&code))
            .unwrap_or(false),
        _ => false,
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL
async fn terminate(binding: &str, mut child: Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(binding, pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(binding, ?status, "Backend process exited");
        }
        Ok(Err(e)) => {
            warn!(binding, error = %e, "Error waiting for backend to exit");
        }
        Err(_) => {
            warn!(
                binding,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            let _ = child.kill().await;
        }
    }
}
