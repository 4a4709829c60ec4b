//! Lifecycle of the locally launched engine and desktop client.

mod log;
pub mod platform;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, Signal, System, UpdateKind};
use tracing::{debug, info, warn};

pub use self::log::{EngineLog, DEFAULT_TAIL_LINES, LOG_KEEP_BYTES, LOG_MAX_BYTES};
use self::platform::Platform;
use crate::error::SupervisorError;
use crate::reconcile::EngineMode;
use crate::settings::{Paths, Settings};

const GRACEFUL_WAIT: Duration = Duration::from_secs(3);
const KILL_WAIT: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "camelCase")]
pub enum ProcessState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
    /// A launch precondition was not met; carries the error code.
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub engine: bool,
    pub client: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessIds {
    pub engine: Option<u32>,
    pub client: Option<u32>,
}

struct Slot {
    label: &'static str,
    child: Option<Child>,
    state: ProcessState,
}

impl Slot {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            child: None,
            state: ProcessState::NotStarted,
        }
    }

    /// Polls without blocking; an exited child is released.
    fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("{} exited with {status}", self.label);
                self.child = None;
                self.state = ProcessState::Stopped;
                false
            }
            Err(e) => {
                warn!("cannot poll {}: {e}", self.label);
                self.child = None;
                self.state = ProcessState::Stopped;
                false
            }
        }
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn launched(&mut self, child: Child) {
        info!("{} started, pid {}", self.label, child.id());
        self.child = Some(child);
        self.state = ProcessState::Running;
    }

    fn failed(&mut self, error: &SupervisorError, log: &EngineLog) {
        warn!("{} not started: {error}", self.label);
        log.note(&format!("{} not started: {error}", self.label));
        self.child = None;
        self.state = ProcessState::Failed(error.code().to_string());
    }

    fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        self.state = ProcessState::Stopping;
        terminate(&mut child, self.label);
        self.state = ProcessState::Stopped;
    }
}

/// Owns the engine and client child processes. Not meant for concurrent
/// use; callers serialize access.
pub struct Supervisor {
    platform: Box<dyn Platform>,
    window_title: String,
    branding_marker: String,
    engine: Slot,
    client: Slot,
    background_stop: Option<Arc<AtomicBool>>,
}

impl Supervisor {
    pub fn new(settings: &Settings) -> Self {
        Self::with_platform(settings, platform::detect())
    }

    pub fn with_platform(settings: &Settings, platform: Box<dyn Platform>) -> Self {
        Self {
            platform,
            window_title: settings.window_title.clone(),
            branding_marker: settings.branding_marker.clone(),
            engine: Slot::new("engine"),
            client: Slot::new("client"),
            background_stop: None,
        }
    }

    /// Starts the engine (Launch mode only) and then the client.
    ///
    /// Processes still running from an earlier call are stopped first.
    /// Missing binaries or configs leave that slot unset and are written to
    /// the engine log; consult [`Supervisor::status`] for the outcome.
    pub fn start(&mut self, mode: &EngineMode, paths: &Paths) {
        if self.engine.child.is_some() || self.client.child.is_some() {
            info!("replacing running processes");
            self.stop();
        }
        let stop = Arc::new(AtomicBool::new(false));
        self.background_stop = Some(stop.clone());
        let log = EngineLog::new(&paths.log);

        if mode.is_reuse() {
            info!("reusing engine at {}, bundled engine not started", mode.control_base);
        } else {
            match self.spawn_engine(paths, &log, &stop) {
                Ok(child) => self.engine.launched(child),
                Err(e) => self.engine.failed(&e, &log),
            }
        }

        match self.spawn_client(paths) {
            Ok(child) => {
                let pid = child.id();
                self.client.launched(child);
                self.platform.spawn_title_rewriter(
                    pid,
                    self.branding_marker.clone(),
                    self.window_title.clone(),
                    stop,
                );
            }
            Err(e) => self.client.failed(&e, &log),
        }
    }

    /// Terminates both processes. A no-op when nothing runs.
    pub fn stop(&mut self) {
        if let Some(stop) = self.background_stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
        self.client.stop();
        self.engine.stop();
    }

    pub fn status(&mut self) -> EngineStatus {
        EngineStatus {
            engine: self.engine.is_alive(),
            client: self.client.is_alive(),
        }
    }

    pub fn engine_state(&self) -> &ProcessState {
        &self.engine.state
    }

    pub fn client_state(&self) -> &ProcessState {
        &self.client.state
    }

    pub fn pids(&mut self) -> ProcessIds {
        self.status();
        ProcessIds {
            engine: self.engine.pid(),
            client: self.client.pid(),
        }
    }

    fn spawn_engine(&self, paths: &Paths, log: &EngineLog, stop: &Arc<AtomicBool>) -> Result<Child, SupervisorError> {
        if !paths.engine_binary.is_file() {
            return Err(SupervisorError::MissingBinary(paths.engine_binary.clone()));
        }
        if !paths.engine_config.is_file() {
            return Err(SupervisorError::MissingConfig(paths.engine_config.clone()));
        }
        reap_strays(&paths.engine_binary);

        // Truncated on every start.
        let log_file = log.open_for_engine()?;
        let binary = absolute(&paths.engine_binary);
        let mut command = Command::new(&binary);
        command.arg("-f").arg(absolute(&paths.engine_config));
        if let Some(dir) = binary.parent() {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone().map_err(SupervisorError::Log)?))
            .stderr(Stdio::from(log_file));
        self.platform.configure(&mut command);

        let child = command.spawn().map_err(|source| SupervisorError::Spawn {
            path: paths.engine_binary.clone(),
            source,
        })?;
        self.platform.attach(&child);
        log.spawn_trimmer(stop.clone());
        Ok(child)
    }

    fn spawn_client(&self, paths: &Paths) -> Result<Child, SupervisorError> {
        if !paths.client_binary.is_file() {
            return Err(SupervisorError::MissingBinary(paths.client_binary.clone()));
        }
        let binary = absolute(&paths.client_binary);
        let mut command = Command::new(&binary);
        if paths.client_config.is_file() {
            command.arg(absolute(&paths.client_config));
        }
        if let Some(dir) = binary.parent() {
            command.current_dir(dir);
        }
        command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        self.platform.configure(&mut command);

        let child = command.spawn().map_err(|source| SupervisorError::Spawn {
            path: paths.client_binary.clone(),
            source,
        })?;
        self.platform.attach(&child);
        Ok(child)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

// Spawned processes run from their own directory, so relative paths break.
fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Graceful signal first, hard kill after the grace period.
fn terminate(child: &mut Child, label: &str) {
    let pid = Pid::from_u32(child.id());
    let mut system = System::new();
    let signalled = system.refresh_process(pid)
        && system
            .process(pid)
            .and_then(|process| process.kill_with(Signal::Term))
            .unwrap_or(false);

    if signalled && wait_for_exit(child, GRACEFUL_WAIT) {
        info!("{label} stopped");
        return;
    }
    if let Err(e) = child.kill() {
        debug!("kill {label}: {e}");
    }
    if wait_for_exit(child, KILL_WAIT) {
        info!("{label} killed");
    } else {
        warn!("{label} (pid {pid}) did not exit after kill");
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return true,
            Ok(None) if Instant::now() >= deadline => return false,
            Ok(None) => thread::sleep(EXIT_POLL),
        }
    }
}

/// Kills engine processes left over from an earlier session.
fn reap_strays(binary: &Path) {
    let target = absolute(binary);
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet)),
    );
    for (pid, process) in system.processes() {
        if process.exe() == Some(target.as_path()) {
            info!("killing stray engine pid {pid}");
            process.kill();
        }
    }
}
