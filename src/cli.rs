use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::settings::HOME_ENV;
use crate::supervisor::DEFAULT_TAIL_LINES;

#[derive(Parser)]
#[command(version, about = "Subscription, proxy engine and remote desktop controller", long_about = None)]
pub struct Args {
    #[arg(short, long, env = HOME_ENV, help = "Data directory (default ~/.nextdesk)")]
    pub data_dir: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Emit trace log")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Fetch a subscription and write both configs
    Load { url: String },
    /// Probe for a running engine
    Detect,
    /// Start the engine and client, then wait until they exit
    Up,
    /// List servers from the last subscription
    Servers,
    /// List proxy groups kept from the last subscription
    Groups,
    /// Measure the delay of every member of a group
    Delays { group: String },
    /// Point a selector group at one of its members
    Select { group: String, proxy: String },
    /// Print the tail of the engine log
    Logs {
        #[arg(short = 'n', long, default_value_t = DEFAULT_TAIL_LINES)]
        lines: usize,
    },
}
