//! Lifecycle manager for the embedded graph database sidecar.
//!
//! The gateway does not talk to the graph store directly; it only makes sure
//! the Java process backing it is running, healthy, and cleanly torn down.
//! All entry points are infallible by design: a memory outage degrades the
//! product, it must never take the chat surface down with it.

mod settings;

pub use settings::{SettingsError, SidecarSettings};

use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Observable lifecycle of the managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SidecarState {
    Stopped,
    Starting,
    HealthChecking,
    Running,
    Stopping,
    Failed,
}

impl SidecarState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SidecarState::Stopped => "stopped",
            SidecarState::Starting => "starting",
            SidecarState::HealthChecking => "health_checking",
            SidecarState::Running => "running",
            SidecarState::Stopping => "stopping",
            SidecarState::Failed => "failed",
        }
    }
}

/// Composite health snapshot, reported as-is on the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct SidecarHealth {
    pub enabled: bool,
    pub process_alive: bool,
    pub connection_ok: bool,
}

impl SidecarHealth {
    pub fn is_healthy(&self) -> bool {
        !self.enabled || (self.process_alive && self.connection_ok)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SidecarStats {
    pub state: SidecarState,
    pub bolt_uri: Option<String>,
    pub http_port: Option<u16>,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SidecarManagerConfig {
    /// Shared `Setting.json`, re-read on every start attempt.
    pub settings_path: PathBuf,
    /// Unpacked database distribution (contains `bin/` and `conf/`).
    pub runtime_dir: PathBuf,
    /// Where piped stdout/stderr of the child land.
    pub log_dir: PathBuf,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub shutdown_grace: Duration,
    /// Kill orphaned processes from a previous run before launching.
    pub clean_stray_processes: bool,
}

impl SidecarManagerConfig {
    pub fn new(settings_path: impl Into<PathBuf>, runtime_dir: impl Into<PathBuf>) -> Self {
        let runtime_dir = runtime_dir.into();
        let log_dir = runtime_dir.join("logs");
        Self {
            settings_path: settings_path.into(),
            runtime_dir,
            log_dir,
            startup_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(30),
            clean_stray_processes: true,
        }
    }
}

struct ManagerState {
    state: SidecarState,
    child: Option<Child>,
    settings: Option<SidecarSettings>,
}

struct Inner {
    config: SidecarManagerConfig,
    http_client: reqwest::Client,
    state: Mutex<ManagerState>,
}

#[derive(Clone)]
pub struct SidecarManager {
    inner: Arc<Inner>,
}

impl SidecarManager {
    pub fn new(config: SidecarManagerConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_PROBE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            inner: Arc::new(Inner {
                config,
                http_client,
                state: Mutex::new(ManagerState {
                    state: SidecarState::Stopped,
                    child: None,
                    settings: None,
                }),
            }),
        }
    }

    pub async fn state(&self) -> SidecarState {
        self.inner.state.lock().await.state
    }

    /// Starts the sidecar, returning whether memory is usable afterwards.
    ///
    /// Never returns an error: every failure path logs, moves the manager to
    /// `Failed` (or leaves it `Stopped` for the external-server case), and
    /// reports `false` so the caller can continue without memory.
    pub async fn start(&self) -> bool {
        let settings = match SidecarSettings::load(&self.inner.config.settings_path) {
            Ok(settings) => settings,
            Err(err) => {
                error!(error = %err, "failed to load sidecar settings");
                self.transition(SidecarState::Failed).await;
                return false;
            }
        };

        if !settings.embedded_enabled {
            // Memory may still be served by an externally managed database.
            let reachable = self.probe_http(settings.http_port).await;
            let mut guard = self.inner.state.lock().await;
            guard.settings = Some(settings);
            guard.state = SidecarState::Stopped;
            if reachable {
                info!("embedded sidecar disabled, external database reachable");
            } else {
                info!("embedded sidecar disabled, no external database found");
            }
            return reachable;
        }

        {
            let mut guard = self.inner.state.lock().await;
            if guard.state == SidecarState::Running {
                debug!("sidecar already running");
                return true;
            }
            guard.state = SidecarState::Starting;
            guard.settings = Some(settings.clone());
        }

        if !self.prepare_runtime(&settings) {
            self.transition(SidecarState::Failed).await;
            return false;
        }

        if port_in_use(settings.bolt_port) || port_in_use(settings.http_port) {
            error!(
                bolt_port = settings.bolt_port,
                http_port = settings.http_port,
                "sidecar ports already in use, refusing to start"
            );
            self.transition(SidecarState::Failed).await;
            return false;
        }

        #[cfg(unix)]
        if self.inner.config.clean_stray_processes {
            kill_stray_runtime_processes(&self.inner.config.runtime_dir);
        }

        let child = match self.spawn_process().await {
            Ok(child) => child,
            Err(err) => {
                error!(error = %err, "failed to spawn sidecar process");
                self.transition(SidecarState::Failed).await;
                return false;
            }
        };

        {
            let mut guard = self.inner.state.lock().await;
            guard.child = Some(child);
            guard.state = SidecarState::HealthChecking;
        }
        info!(
            bolt_port = settings.bolt_port,
            http_port = settings.http_port,
            "sidecar process spawned, waiting for it to accept connections"
        );

        if self.wait_for_ready(&settings).await {
            self.transition(SidecarState::Running).await;
            info!("sidecar is up");
            true
        } else {
            error!("sidecar did not become ready in time");
            self.stop().await;
            self.transition(SidecarState::Failed).await;
            false
        }
    }

    /// Stops the child process and its process group. Idempotent.
    pub async fn stop(&self) {
        let mut child = {
            let mut guard = self.inner.state.lock().await;
            match guard.child.take() {
                Some(child) => {
                    guard.state = SidecarState::Stopping;
                    child
                }
                None => {
                    guard.state = SidecarState::Stopped;
                    return;
                }
            }
        };

        terminate_child(&mut child, self.inner.config.shutdown_grace).await;
        self.transition(SidecarState::Stopped).await;
        info!("sidecar stopped");
    }

    pub async fn health_check(&self) -> SidecarHealth {
        let (enabled, http_port, process_alive) = {
            let mut guard = self.inner.state.lock().await;
            let enabled = guard
                .settings
                .as_ref()
                .map(|s| s.embedded_enabled)
                .unwrap_or(false);
            let http_port = guard.settings.as_ref().map(|s| s.http_port);
            let process_alive = match guard.child.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None => false,
            };
            (enabled, http_port, process_alive)
        };

        let connection_ok = match http_port {
            Some(port) => self.probe_http(port).await,
            None => false,
        };

        SidecarHealth {
            enabled,
            process_alive,
            connection_ok,
        }
    }

    pub async fn stats(&self) -> SidecarStats {
        let guard = self.inner.state.lock().await;
        SidecarStats {
            state: guard.state,
            bolt_uri: guard
                .settings
                .as_ref()
                .map(|s| format!("bolt://127.0.0.1:{}", s.bolt_port)),
            http_port: guard.settings.as_ref().map(|s| s.http_port),
            pid: guard.child.as_ref().and_then(|c| c.id()),
        }
    }

    async fn transition(&self, state: SidecarState) {
        let mut guard = self.inner.state.lock().await;
        if guard.state != state {
            debug!(from = guard.state.as_str(), to = state.as_str(), "sidecar state change");
            guard.state = state;
        }
    }

    /// Validates the runtime layout and patches the listen addresses in the
    /// database config so restarts pick up port changes from `Setting.json`.
    fn prepare_runtime(&self, settings: &SidecarSettings) -> bool {
        let runtime_dir = &self.inner.config.runtime_dir;
        let launcher = launcher_path(runtime_dir);
        if !launcher.is_file() {
            error!(path = %launcher.display(), "sidecar launcher not found");
            return false;
        }
        let conf_path = runtime_dir.join("conf").join("neo4j.conf");
        if !conf_path.is_file() {
            error!(path = %conf_path.display(), "sidecar config not found");
            return false;
        }
        match patch_listen_addresses(&conf_path, settings.bolt_port, settings.http_port) {
            Ok(true) => info!(path = %conf_path.display(), "updated sidecar listen addresses"),
            Ok(false) => debug!("sidecar config already up to date"),
            Err(err) => {
                error!(error = %err, "failed to patch sidecar config");
                return false;
            }
        }
        true
    }

    async fn spawn_process(&self) -> std::io::Result<Child> {
        let runtime_dir = &self.inner.config.runtime_dir;
        let mut cmd = Command::new(launcher_path(runtime_dir));
        cmd.arg("console")
            .current_dir(runtime_dir)
            .env("NEO4J_HOME", runtime_dir)
            .env("NEO4J_CONF", runtime_dir.join("conf"))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        // A bundled JRE takes precedence over whatever Java the host has.
        let jre_dir = runtime_dir.join("jre");
        if jre_dir.is_dir() {
            cmd.env("JAVA_HOME", &jre_dir);
            let path = std::env::var_os("PATH").unwrap_or_default();
            let mut entries = vec![jre_dir.join("bin")];
            entries.extend(std::env::split_paths(&path));
            if let Ok(joined) = std::env::join_paths(entries) {
                cmd.env("PATH", joined);
            }
        }

        // Own process group so shutdown can signal the JVM and any children
        // it forks in one go.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;

        tokio::fs::create_dir_all(&self.inner.config.log_dir).await?;
        if let Some(stdout) = child.stdout.take() {
            spawn_log_writer(stdout, self.inner.config.log_dir.join("sidecar.stdout.log"));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_writer(stderr, self.inner.config.log_dir.join("sidecar.stderr.log"));
        }

        Ok(child)
    }

    async fn wait_for_ready(&self, settings: &SidecarSettings) -> bool {
        let deadline = tokio::time::Instant::now() + self.inner.config.startup_timeout;
        loop {
            {
                let mut guard = self.inner.state.lock().await;
                match guard.child.as_mut().map(|c| c.try_wait()) {
                    Some(Ok(Some(status))) => {
                        error!(?status, "sidecar process exited during startup");
                        return false;
                    }
                    Some(Ok(None)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "failed to poll sidecar process");
                    }
                    None => return false,
                }
            }

            if self.probe_http(settings.http_port).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
    }

    /// The database answers its HTTP port with 200 (auth disabled) or 401
    /// (auth enabled) once it is ready; both count as reachable.
    async fn probe_http(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}/");
        match self.inner.http_client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                status.is_success() || status == reqwest::StatusCode::UNAUTHORIZED
            }
            Err(_) => false,
        }
    }
}

fn launcher_path(runtime_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        runtime_dir.join("bin").join("neo4j.bat")
    } else {
        runtime_dir.join("bin").join("neo4j")
    }
}

fn port_in_use(port: u16) -> bool {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok()
}

/// Rewrites the bolt/http listen addresses in `neo4j.conf`, uncommenting the
/// http line if needed. Leaves the file untouched when every value already
/// matches, so repeated starts do not churn its mtime.
fn patch_listen_addresses(path: &Path, bolt_port: u16, http_port: u16) -> std::io::Result<bool> {
    let content = std::fs::read_to_string(path)?;
    let bolt_line = format!("server.bolt.listen_address=127.0.0.1:{bolt_port}");
    let http_line = format!("server.http.listen_address=127.0.0.1:{http_port}");
    let http_enabled_line = "server.http.enabled=true";

    let mut changed = false;
    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            let replacement = if trimmed.starts_with("server.bolt.listen_address") {
                Some(bolt_line.as_str())
            } else if trimmed.starts_with("server.http.listen_address")
                || trimmed.starts_with("#server.http.listen_address")
            {
                Some(http_line.as_str())
            } else if trimmed.starts_with("server.http.enabled")
                || trimmed.starts_with("#server.http.enabled")
            {
                Some(http_enabled_line)
            } else {
                None
            };
            match replacement {
                Some(replacement) if line != replacement => {
                    changed = true;
                    replacement.to_string()
                }
                Some(replacement) => replacement.to_string(),
                None => line.to_string(),
            }
        })
        .collect();

    if !changed {
        return Ok(false);
    }
    let mut output = lines.join("\n");
    output.push('\n');
    std::fs::write(path, output)?;
    Ok(true)
}

/// Scans `/proc` for leftover sidecar processes from a crashed previous run
/// and kills them. Matching is on the runtime directory appearing in the
/// command line, which only the launcher and its JVM carry.
#[cfg(unix)]
fn kill_stray_runtime_processes(runtime_dir: &Path) {
    let needle = runtime_dir.to_string_lossy().into_owned();
    let own_pid = std::process::id();
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let mut killed = 0u32;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&cmdline);
        if cmdline.contains(&needle) {
            warn!(pid, "killing stray sidecar process");
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
            killed += 1;
        }
    }
    if killed > 0 {
        info!(count = killed, "cleaned up stray sidecar processes");
    }
}

/// Graceful shutdown: SIGTERM to the process group, a bounded wait, then
/// SIGKILL. On non-unix targets this degrades to a plain kill.
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::killpg(pid as i32, libc::SIGTERM);
            }
            let deadline = tokio::time::Instant::now() + grace;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) => {}
                    Err(err) => {
                        warn!(error = %err, "failed to poll sidecar during shutdown");
                        break;
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!("sidecar ignored SIGTERM, escalating to SIGKILL");
                    unsafe {
                        libc::killpg(pid as i32, libc::SIGKILL);
                    }
                    break;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
    }
    if let Err(err) = child.kill().await {
        debug!(error = %err, "sidecar already gone");
    }
    let _ = child.wait().await;
}

fn spawn_log_writer(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    path: PathBuf,
) {
    tokio::spawn(async move {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        let mut file = match file {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to open sidecar log file");
                return;
            }
        };
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let entry = format!("{} {line}\n", format_timestamp());
            if file.write_all(entry.as_bytes()).await.is_err() {
                break;
            }
        }
    });
}

fn format_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
