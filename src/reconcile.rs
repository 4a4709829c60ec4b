//! Decides whether to reuse an engine that is already running or to launch
//! the bundled one.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::controller::ControllerClient;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// An external engine answered; operate against it.
    Reuse,
    /// Nothing answered; the bundled engine must be started.
    Launch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMode {
    pub mode: Mode,
    pub control_base: String,
    pub socks_port: u16,
}

impl EngineMode {
    pub fn launch(settings: &Settings) -> Self {
        Self {
            mode: Mode::Launch,
            control_base: format!("http://{}", settings.bundled_controller),
            socks_port: settings.bundled_socks_port,
        }
    }

    pub fn is_reuse(&self) -> bool {
        self.mode == Mode::Reuse
    }

    pub fn controller(&self) -> ControllerClient {
        ControllerClient::new(self.control_base.clone())
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    host: String,
    ports: Vec<u16>,
    probe_timeout: Duration,
    reuse_default_port: u16,
    fallback: EngineMode,
}

impl Reconciler {
    pub fn new(settings: &Settings) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ports: settings.control_ports.clone(),
            probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
            reuse_default_port: settings.reuse_default_port,
            fallback: EngineMode::launch(settings),
        }
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Probes every candidate port concurrently and settles on a mode.
    ///
    /// Latency is bounded by the slowest single probe. Safe to call
    /// repeatedly; each result fully replaces the previous one.
    pub fn reconcile(&self) -> EngineMode {
        let Some(base) = self.probe() else {
            info!("no running engine found, launching bundled engine");
            return self.fallback.clone();
        };

        let client = ControllerClient::with_timeout(base.clone(), self.probe_timeout);
        let socks_port = client
            .configs()
            .and_then(|config| config.socks_capable_port())
            .unwrap_or(self.reuse_default_port);
        info!("reusing engine at {base}, socks port {socks_port}");

        // Fire and forget: the refresh outcome never feeds back into the mode.
        let refresher = ControllerClient::new(base.clone());
        thread::spawn(move || {
            let accepted = refresher.update_geo();
            debug!("geo refresh requested, accepted: {accepted}");
        });

        EngineMode {
            mode: Mode::Reuse,
            control_base: base,
            socks_port,
        }
    }

    /// Returns the control base of the first candidate, in list order,
    /// whose `/version` answers.
    fn probe(&self) -> Option<String> {
        let (tx, rx) = mpsc::channel();
        for (index, port) in self.ports.iter().copied().enumerate() {
            let tx = tx.clone();
            let base = format!("http://{}:{port}", self.host);
            let timeout = self.probe_timeout;
            thread::spawn(move || {
                let client = ControllerClient::with_timeout(base.clone(), timeout);
                let found = client.version().is_some();
                debug!("probe {base}: {}", if found { "answered" } else { "silent" });
                let _ = tx.send((index, found.then_some(base)));
            });
        }
        drop(tx);

        let mut results: Vec<Option<String>> = vec![None; self.ports.len()];
        // Probes carry their own timeout; anything slower than this is stuck.
        let deadline = self.probe_timeout * 2 + Duration::from_millis(500);
        while let Ok((index, base)) = rx.recv_timeout(deadline) {
            results[index] = base;
        }
        results.into_iter().flatten().next()
    }
}
