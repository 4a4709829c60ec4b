//! Sequencing of fetch, reconcile, synthesize and supervise behind one
//! handle the shell (CLI or GUI) talks to.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ArtifactError, SubscriptionError, SupervisorError};
use crate::reconcile::{EngineMode, Reconciler};
use crate::settings::{Paths, Settings};
use crate::state::{PersistedState, Server};
use crate::subscription::{self, Fetcher, RoutingGroup, Subscription};
use crate::supervisor::{self, EngineLog, EngineStatus, ProcessIds, Supervisor};
use crate::synth::{synthesize_client_config, synthesize_engine_config, write_client_config, EngineConfig};

/// What the UI is told after a subscription load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub server_count: usize,
    pub proxy_groups: Vec<String>,
}

impl LoadOutcome {
    fn failed(code: &str, error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            code: Some(code.to_string()),
            server_count: 0,
            proxy_groups: Vec::new(),
        }
    }
}

impl From<SubscriptionError> for LoadOutcome {
    fn from(error: SubscriptionError) -> Self {
        Self::failed(error.code(), error)
    }
}

impl From<ArtifactError> for LoadOutcome {
    fn from(error: ArtifactError) -> Self {
        Self::failed(error.code(), error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub mode: EngineMode,
    pub processes: EngineStatus,
    pub pids: ProcessIds,
}

struct Inner {
    mode: EngineMode,
    supervisor: Supervisor,
    state: PersistedState,
    subscription: Option<Subscription>,
}

pub struct App {
    settings: Settings,
    paths: Paths,
    fetcher: Fetcher,
    reconciler: Reconciler,
    inner: Mutex<Inner>,
}

impl App {
    /// Prepares the data directory, restores persisted state, detects the
    /// engine mode and writes a client config for it.
    pub fn open(settings: Settings, data_dir: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let paths = Paths::new(data_dir, &settings);
        fs::create_dir_all(&paths.data_dir).map_err(|e| ArtifactError::io(&paths.data_dir, e))?;

        let reconciler = Reconciler::new(&settings);
        let mode = reconciler.reconcile();
        let state = PersistedState::load(&paths.state);
        let subscription = restore_subscription(&paths, &state);
        info!(
            "opened {} with {} saved servers, mode {:?}",
            paths.data_dir.display(),
            state.servers.len(),
            mode.mode
        );

        let app = Self {
            fetcher: Fetcher::new(&settings),
            inner: Mutex::new(Inner {
                mode,
                supervisor: Supervisor::new(&settings),
                state,
                subscription,
            }),
            reconciler,
            paths,
            settings,
        };
        {
            let inner = app.lock();
            app.write_client_config(&inner)?;
        }
        Ok(app)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetches, parses and applies a subscription. Failures come back as an
    /// outcome carrying the error kind; nothing is persisted then.
    pub fn load_subscription(&self, url: &str) -> LoadOutcome {
        match self.fetcher.fetch(url) {
            Ok(body) => self.load_subscription_body(url, &body),
            Err(e) => {
                warn!("subscription load failed: {e}");
                e.into()
            }
        }
    }

    /// Same as [`App::load_subscription`] for a body fetched elsewhere.
    pub fn load_subscription_body(&self, url: &str, body: &str) -> LoadOutcome {
        match subscription::parse(body) {
            Ok(subscription) => self.apply_subscription(url.trim(), body, subscription),
            Err(e) => {
                warn!("subscription parse failed: {e}");
                e.into()
            }
        }
    }

    fn apply_subscription(&self, url: &str, body: &str, subscription: Subscription) -> LoadOutcome {
        let mut inner = self.lock();
        let servers = Server::from_proxies(&subscription.proxies);
        let engine = synthesize_engine_config(&subscription, inner.mode.socks_port, &self.settings);

        let previous = std::mem::replace(
            &mut inner.state,
            PersistedState {
                subscription_url: url.to_string(),
                servers,
                proxy_groups: engine.proxy_groups.clone(),
            },
        );
        if let Err(e) = self.write_artifacts(&inner, Some(&engine)) {
            warn!("cannot write artifacts: {e}");
            inner.state = previous;
            return e.into();
        }
        if let Err(e) = fs::write(&self.paths.subscription, body) {
            warn!("cannot keep subscription body: {e}");
        }
        if let Err(e) = inner.state.save(&self.paths.state) {
            warn!("cannot persist state: {e}");
        }
        inner.subscription = Some(subscription);

        info!(
            "loaded {} servers, {} groups",
            inner.state.servers.len(),
            inner.state.proxy_groups.len()
        );
        LoadOutcome {
            success: true,
            error: None,
            code: None,
            server_count: inner.state.servers.len(),
            proxy_groups: engine.group_names().map(str::to_string).collect(),
        }
    }

    /// Writes both artifacts against the current mode's port. The engine
    /// document is only written when the bundled engine is used.
    fn write_artifacts(&self, inner: &Inner, engine: Option<&EngineConfig>) -> Result<(), ArtifactError> {
        if !inner.mode.is_reuse() {
            match engine {
                Some(config) => config.write(&self.paths.engine_config)?,
                None => self.ensure_engine_config(inner)?,
            }
        }
        self.write_client_config(inner)
    }

    fn write_client_config(&self, inner: &Inner) -> Result<(), ArtifactError> {
        let xml = synthesize_client_config(
            &inner.state.servers,
            inner.mode.socks_port,
            &self.settings.client_group_name,
        );
        write_client_config(&self.paths.client_config, &xml)
    }

    /// Regenerates the engine document from the last subscription, or a
    /// direct-only one when nothing was ever loaded. A document left on disk
    /// by an earlier run is never trusted.
    fn ensure_engine_config(&self, inner: &Inner) -> Result<(), ArtifactError> {
        let port = inner.mode.socks_port;
        let config = match &inner.subscription {
            Some(subscription) => synthesize_engine_config(subscription, port, &self.settings),
            None => synthesize_engine_config(&Subscription::proxy_list(Vec::new()), port, &self.settings),
        };
        config.write(&self.paths.engine_config)
    }

    /// Re-runs engine detection and rewrites the artifacts when the port or
    /// mode changed.
    pub fn detect(&self) -> EngineMode {
        let mode = self.reconciler.reconcile();
        let mut inner = self.lock();
        self.switch_mode(&mut inner, mode);
        inner.mode.clone()
    }

    fn switch_mode(&self, inner: &mut Inner, mode: EngineMode) {
        if inner.mode == mode {
            return;
        }
        info!("engine mode changed to {:?}, socks port {}", mode.mode, mode.socks_port);
        inner.mode = mode;
        if let Err(e) = self.write_artifacts(inner, None) {
            warn!("cannot rewrite artifacts: {e}");
        }
    }

    /// Detects the mode, makes sure both artifacts exist, and starts the
    /// supervised processes.
    pub fn start_engine(&self) -> EngineStatus {
        let mode = self.reconciler.reconcile();
        let mut inner = self.lock();
        if inner.mode != mode {
            info!("engine mode changed to {:?}, socks port {}", mode.mode, mode.socks_port);
            inner.mode = mode.clone();
        }
        if let Err(e) = self.write_artifacts(&inner, None) {
            warn!("cannot prepare artifacts: {e}");
        }
        inner.supervisor.start(&mode, &self.paths);
        inner.supervisor.status()
    }

    pub fn stop_engine(&self) -> EngineStatus {
        let mut inner = self.lock();
        inner.supervisor.stop();
        inner.supervisor.status()
    }

    pub fn status(&self) -> StatusReport {
        let mut inner = self.lock();
        StatusReport {
            mode: inner.mode.clone(),
            processes: inner.supervisor.status(),
            pids: inner.supervisor.pids(),
        }
    }

    pub fn mode(&self) -> EngineMode {
        self.lock().mode.clone()
    }

    pub fn servers(&self) -> Vec<Server> {
        self.lock().state.servers.clone()
    }

    pub fn proxy_groups(&self) -> Vec<RoutingGroup> {
        self.lock().state.proxy_groups.clone()
    }

    pub fn subscription_url(&self) -> String {
        self.lock().state.subscription_url.clone()
    }

    /// Delay of every member of `group` as measured by the active engine.
    pub fn group_delays(&self, group: &str) -> BTreeMap<String, i64> {
        let controller = self.mode().controller();
        controller.group_delays(group)
    }

    pub fn select_proxy(&self, group: &str, name: &str) -> bool {
        let controller = self.mode().controller();
        let selected = controller.select(group, name);
        info!("select {name} in {group}: {selected}");
        selected
    }

    pub fn read_log_tail(&self, limit: Option<usize>) -> Result<Vec<String>, SupervisorError> {
        EngineLog::new(&self.paths.log).tail(limit.unwrap_or(supervisor::DEFAULT_TAIL_LINES))
    }
}

/// Re-parses the body kept by the last successful load. Only used when it
/// still agrees with the persisted server list.
fn restore_subscription(paths: &Paths, state: &PersistedState) -> Option<Subscription> {
    let body = fs::read_to_string(&paths.subscription).ok()?;
    match subscription::parse(&body) {
        Ok(subscription) if Server::from_proxies(&subscription.proxies) == state.servers => Some(subscription),
        Ok(_) => {
            warn!("kept subscription does not match saved servers, ignoring it");
            None
        }
        Err(e) => {
            warn!("cannot restore kept subscription: {e}");
            None
        }
    }
}
