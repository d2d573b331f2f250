use std::path::PathBuf;
use std::process;

use clap::Parser;

use ccpilot::client::{Client, ClientConfig};
use ccpilot::lifecycle::{Lifecycle, Outcome, GRACE_PERIOD_DEFAULT};

/// Sends a bulk TCP flow whose congestion window can be driven by an external decision process
#[derive(Parser, Debug)]
#[command(name = "ccpilot-client")]
struct Args {
    /// Receiver IP address
    #[arg(long)]
    ip: String,

    /// Receiver port
    #[arg(long)]
    port: u16,

    /// Kernel congestion control algorithm
    #[arg(long, default_value = "cubic")]
    cong: String,

    /// Control interval in milliseconds
    #[arg(long, default_value = "20")]
    interval: u64,

    /// Flow id to report when no decision process assigns one
    #[arg(long)]
    id: Option<u32>,

    /// Write a tab-separated performance log to this path
    #[arg(long, value_name = "PATH")]
    perf_log: Option<PathBuf>,

    /// Unix socket of the decision process; enables externally driven windows
    #[arg(long, value_name = "PATH")]
    decision_socket: Option<PathBuf>,

    /// How long to wait for each window decision in milliseconds (0 = unbounded)
    #[arg(long, default_value = "1000")]
    reply_timeout: u64,
}

impl Args {
    fn into_config(self) -> ClientConfig {
        let mut config = ClientConfig::new(self.ip, self.port);

        config.congestion_control = self.cong;
        config.control.interval_ms = self.interval;
        config.control.reply_timeout_ms = match self.reply_timeout {
            0 => None,
            ms => Some(ms),
        };
        config.flow_id = self.id;
        config.perf_log = self.perf_log;
        config.decision_socket = self.decision_socket;

        config
    }
}

fn main() {
    env_logger::init();

    let config = Args::parse().into_config();

    let lifecycle = Lifecycle::new(GRACE_PERIOD_DEFAULT);

    if let Err(err) = lifecycle.install_signal_handlers() {
        eprintln!("Error: failed to install signal handlers: {err}");
        process::exit(1);
    }

    let client = match Client::start(config, lifecycle) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    };

    match client.wait() {
        Outcome::Completed => (),
        Outcome::Terminated { .. } => {
            // Loop threads may still be blocked in I/O
            process::exit(0);
        }
    }
}
