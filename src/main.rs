//! Console front end for the SMU agent.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use smu_agent::app::SmuApp;
use smu_agent::commands::Host;
use smu_agent::config::Settings;
use smu_agent::link;
use smu_agent::poller::PollerExit;

#[derive(Parser, Debug)]
#[command(name = "smu-agent", about = "Telemetry and control agent for an SMU")]
struct Cli {
    /// Serial port of the instrument (e.g. /dev/ttyUSB0, COM3)
    #[arg(short, long)]
    port: Option<String>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// List available serial ports and exit
    #[arg(long)]
    list: bool,
}

/// Exit requests from the interpreter feed the main loop's select.
struct ConsoleHost(watch::Sender<bool>);

impl Host for ConsoleHost {
    fn request_exit(&self) {
        let _ = self.0.send(true);
    }
}

fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::new(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&settings.log_level)?;

    if cli.list {
        for port in link::discover_ports().context("enumerating serial ports")? {
            println!("{}\t{}", port.name, port.description);
        }
        return Ok(());
    }

    let Some(port) = cli.port else {
        bail!("no serial port given; use --port <path>, or --list to enumerate");
    };

    let app = Arc::new(
        SmuApp::connect(&settings, &port)
            .await
            .with_context(|| format!("connecting to {port}"))?,
    );
    println!("Connected to {port}. Type 'help' for commands.");

    let (exit_tx, mut exit_rx) = watch::channel(false);
    let host = ConsoleHost(exit_tx);
    let mut poller = app.take_poller();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0usize;

    loop {
        tokio::select! {
            _ = exit_rx.changed() => break,
            exit = async {
                match poller.as_mut() {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            } => {
                poller = None;
                if matches!(exit, Ok(PollerExit::CriticalDisconnect)) {
                    eprintln!("CRITICAL: instrument lost and reconnection exhausted.");
                    for message in app.state().messages() {
                        eprintln!("{message}");
                    }
                    app.shutdown().await;
                    bail!("instrument disconnected");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                app.interpret(&line, &host).await;
                let messages = app.state().messages();
                for message in messages.iter().skip(printed.min(messages.len())) {
                    println!("{message}");
                }
                printed = messages.len();
                if let Some(m) = app.state().latest() {
                    println!("[{}] V: {:.3} V | I: {:.4} A", app.state().status(), m.voltage, m.current);
                }
            }
        }
    }

    app.shutdown().await;
    println!("Goodbye.");
    Ok(())
}
