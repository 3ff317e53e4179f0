//! Shared test fixtures: an in-memory fake SMU speaking the instrument's
//! SCPI subset over a duplex stream.
//!
//! The fake enforces the wire discipline the real instrument relies on:
//! if a command arrives while the reply to a previous query is still
//! unread, the device task panics, which surfaces in the test when the
//! task is joined.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use smu_agent::config::Settings;
use smu_agent::link::{DynSerial, InstrumentLink, LinkOptions};

/// Canned responses of the simulated instrument.
#[derive(Debug, Clone)]
pub struct FakeSmuBehavior {
    /// Reply to `*IDN?`; `None` means the device stays silent.
    pub identity: Option<String>,
    pub voltage: String,
    pub current: String,
    pub voltage_limit: String,
    pub current_limit: String,
}

impl Default for FakeSmuBehavior {
    fn default() -> Self {
        Self {
            identity: Some("SMU-2000".into()),
            voltage: "3.300".into(),
            current: "0.0521".into(),
            voltage_limit: "15.0".into(),
            current_limit: "1.0".into(),
        }
    }
}

impl FakeSmuBehavior {
    pub fn silent() -> Self {
        Self {
            identity: None,
            ..Self::default()
        }
    }

    pub fn with_identity(identity: &str) -> Self {
        Self {
            identity: Some(identity.into()),
            ..Self::default()
        }
    }

    fn respond(&self, command: &str) -> Option<String> {
        match command {
            "*IDN?" => self.identity.clone().map(|id| format!("{id}\n")),
            ":MEAS:VOLT?" => Some(format!("{}\n", self.voltage)),
            ":MEAS:CURR?" => Some(format!("{}\n", self.current)),
            ":SOUR:VOLT:LIM?" => Some(format!("{}\n", self.voltage_limit)),
            ":SOUR:CURR:LIM?" => Some(format!("{}\n", self.current_limit)),
            // set commands are acknowledged silently
            _ => None,
        }
    }
}

/// Handle to the running device task and everything it received.
pub struct FakeSmu {
    received: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeSmu {
    /// Every command line the device has read so far, in order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Join the device task; fails the test if it panicked (e.g. on a
    /// wire-discipline violation).
    pub async fn assert_clean_exit(self) {
        self.task.await.expect("fake SMU device task panicked");
    }
}

/// Start a fake SMU and return the host side of its serial channel.
pub fn spawn_fake_smu(behavior: FakeSmuBehavior) -> (DynSerial, FakeSmu) {
    let (host, device) = tokio::io::duplex(1024);
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();

    let task = tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(device);
        let mut pending = String::new();
        let mut buf = [0u8; 512];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            pending.push_str(&String::from_utf8_lossy(&buf[..n]));

            let mut commands = Vec::new();
            while let Some(pos) = pending.find('\n') {
                let line: String = pending.drain(..=pos).collect();
                commands.push(line.trim().to_string());
            }

            for (index, command) in commands.iter().enumerate() {
                log.lock().unwrap().push(command.clone());
                let reply = behavior.respond(command);
                if reply.is_some() && index + 1 < commands.len() {
                    panic!(
                        "wire discipline violated: '{}' sent before the reply to '{command}' was read",
                        commands[index + 1]
                    );
                }
                if let Some(reply) = reply {
                    if writer.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    (Box::new(host), FakeSmu { received, task })
}

/// Link options tightened for in-memory transports.
pub fn test_link_options() -> LinkOptions {
    LinkOptions {
        read_timeout: std::time::Duration::from_millis(100),
        ..LinkOptions::default()
    }
}

/// A verified link over a fresh fake SMU.
pub async fn connected_link(
    behavior: FakeSmuBehavior,
    port_name: &str,
) -> (Arc<InstrumentLink>, FakeSmu) {
    let (port, fake) = spawn_fake_smu(behavior);
    let link = Arc::new(InstrumentLink::from_port(port, port_name, test_link_options()));
    link.verify().await.expect("handshake with fake SMU");
    (link, fake)
}

/// Settings with intervals tightened so integration tests finish fast.
pub fn test_settings() -> Settings {
    let settings: Settings = toml::from_str(
        r#"
        [connection]
        read_timeout = "100ms"

        [poll]
        interval = "20ms"

        [reconnect]
        max_attempts = 3
        initial_delay = "10ms"
        backoff_factor = 1.5
        max_delay = "40ms"

        [storage]
        interval = "20ms"
        "#,
    )
    .expect("test settings parse");
    settings.validate().expect("test settings valid");
    settings
}
