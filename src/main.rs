//! NMEA-0183 bridge daemon for the autopilot.
//!
//! Probes serial ports for instrument traffic, serves NMEA peers over
//! TCP, arbitrates which source owns each sensor channel, and
//! synthesizes attitude and navigation sentences back out.
//!
//! Usage:
//!   nmea-bridge -c /etc/nmea-bridge.conf
//!   nmea-bridge -c /etc/nmea-bridge.conf --stderr   # log to stderr

mod bridge;
mod bus;
mod config;
mod error;
mod nmea;
mod serial;
mod source;
mod util;

use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::bridge::{Bridge, Notice};
use crate::serial::ScanProbe;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "nmea-bridge", about = "NMEA-0183 bridge — autopilot serial/TCP gateway")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/nmea-bridge.conf")]
    config: PathBuf,

    /// Log to stderr instead of syslog (useful for debugging).
    #[arg(long)]
    stderr: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("nmea-bridge: config error: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = config::validate_config(&cfg) {
        eprintln!("nmea-bridge: config validation: {e}");
        process::exit(1);
    }

    let use_syslog = cfg.log_syslog && !cli.stderr;
    setup_logging(use_syslog).expect("failed to set up logging");

    // Write PID file
    if let Err(e) = util::write_pid_file(&cfg.pid_file) {
        error!("cannot write PID file {}: {e}", cfg.pid_file.display());
    }

    info!("nmea-bridge starting on port {}", cfg.port);

    let (hub, handle, client) = bus::hub();
    tokio::spawn(hub.run());

    if !cfg.nmea_client.is_empty() {
        if let Err(e) = handle.set("nmea.client", serde_json::json!(cfg.nmea_client.clone())) {
            error!("cannot seed nmea.client: {e}");
        }
    }

    // Control notices feed socket loss back into the value store
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(notice) = notice_rx.recv().await {
                match notice {
                    Notice::Sockets => debug!("nmea peers connected"),
                    Notice::NoSockets => debug!("all nmea peers gone"),
                    Notice::LostSocket(uid) => {
                        if handle.lostdevice(&format!("socket{uid}")).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // Held open for the life of the process; the autopilot host feeds
    // sentences to relay to TCP peers through this side of the pipe.
    let (_relay_tx, relay_rx) = mpsc::unbounded_channel();

    let probe = ScanProbe::new(cfg.serial_ports.clone());
    let bridge = Bridge::bind(cfg.port, client, probe, relay_rx, notice_tx).await;
    bridge.run().await;
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool) -> anyhow::Result<()> {
    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process:  "nmea-bridge".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(log::LevelFilter::Info))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }
    Ok(())
}
