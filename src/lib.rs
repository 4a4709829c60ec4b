pub mod app;
pub mod cli;
pub mod controller;
pub mod error;
pub mod reconcile;
pub mod settings;
pub mod state;
pub mod subscription;
pub mod supervisor;
pub mod synth;

use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::cli::{Args, Command};
use crate::settings::Settings;

const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let data_dir = args.data_dir.clone().unwrap_or_else(settings::default_data_dir);
    let settings =
        Settings::load(&data_dir).with_context(|| format!("loading settings from {}", data_dir.display()))?;
    let app = App::open(settings, &data_dir).with_context(|| format!("opening {}", data_dir.display()))?;

    match args.command {
        Command::Load { url } => {
            let outcome = app.load_subscription(&url);
            print_json(&outcome)?;
            if !outcome.success {
                bail!("subscription not loaded");
            }
        }
        Command::Detect => print_json(&app.detect())?,
        Command::Up => supervise(&app)?,
        Command::Servers => print_json(&app.servers())?,
        Command::Groups => print_json(&app.proxy_groups())?,
        Command::Delays { group } => print_json(&app.group_delays(&group))?,
        Command::Select { group, proxy } => {
            if !app.select_proxy(&group, &proxy) {
                bail!("engine refused to select {proxy} in {group}");
            }
        }
        Command::Logs { lines } => {
            for line in app.read_log_tail(Some(lines))? {
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Starts everything and blocks until the processes are gone.
fn supervise(app: &App) -> anyhow::Result<()> {
    let started = app.start_engine();
    let report = app.status();
    print_json(&report)?;
    if !started.engine && !started.client {
        bail!("nothing started, see {}", app.paths().log.display());
    }

    let launched = !report.mode.is_reuse();
    loop {
        thread::sleep(SUPERVISE_INTERVAL);
        let status = app.status().processes;
        if launched && started.engine && !status.engine {
            warn!("engine exited");
            break;
        }
        if !status.engine && !status.client {
            info!("all processes exited");
            break;
        }
    }
    app.stop_engine();
    Ok(())
}
