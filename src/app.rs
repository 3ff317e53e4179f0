//! Application wiring.
//!
//! [`SmuApp`] owns one instrument session: the link, the shared state,
//! the poller, the recorder, and the command interpreter, plus the watch
//! channel that tears them all down. Front ends hold an `Arc<SmuApp>`
//! and talk to it through `interpret` and the state handle.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::info;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::commands::{CommandInterpreter, Host};
use crate::config::Settings;
use crate::error::AppResult;
use crate::link::{InstrumentLink, LinkOptions};
use crate::poller::{Poller, PollerExit};
use crate::recorder::{Recorder, RecorderSettings};
use crate::state::{ConnectionState, SharedState};
use crate::supervisor::{ConnectionSupervisor, ReconnectPolicy};

pub struct SmuApp {
    state: SharedState,
    link: Arc<InstrumentLink>,
    recorder: Arc<Recorder>,
    interpreter: CommandInterpreter,
    shutdown_tx: watch::Sender<bool>,
    poller: StdMutex<Option<JoinHandle<PollerExit>>>,
}

impl SmuApp {
    /// Open and verify the instrument at `port`, then start the poller.
    pub async fn connect(settings: &Settings, port: &str) -> AppResult<Self> {
        let state = SharedState::new();
        state.set_status(ConnectionState::Connecting);
        let link = match InstrumentLink::open(port, LinkOptions::from(&settings.connection)).await
        {
            Ok(link) => Arc::new(link),
            Err(err) => {
                state.set_status(ConnectionState::Disconnected);
                return Err(err);
            }
        };
        state.set_status(ConnectionState::Connected);
        state.push_message(&format!("Connected to {port}"));
        Ok(Self::assemble(settings, state, link))
    }

    /// Wire a session around an already-established link. Used by tests
    /// and by front ends that manage port selection themselves.
    pub fn with_link(settings: &Settings, link: Arc<InstrumentLink>) -> Self {
        let state = SharedState::new();
        state.set_status(ConnectionState::Connecting);
        state.set_status(ConnectionState::Connected);
        Self::assemble(settings, state, link)
    }

    fn assemble(settings: &Settings, state: SharedState, link: Arc<InstrumentLink>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let recorder = Arc::new(Recorder::new(
            link.clone(),
            RecorderSettings::from(&settings.storage),
        ));
        let poller = Poller::new(
            link.clone(),
            state.clone(),
            ConnectionSupervisor::new(ReconnectPolicy::from(&settings.reconnect)),
            settings.poll.interval,
            shutdown_rx,
        );
        let interpreter = CommandInterpreter::new(link.clone(), state.clone(), recorder.clone());
        Self {
            state,
            link,
            recorder,
            interpreter,
            shutdown_tx,
            poller: StdMutex::new(Some(poller.spawn())),
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn link(&self) -> &Arc<InstrumentLink> {
        &self.link
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub async fn interpret(&self, input: &str, host: &dyn Host) {
        self.interpreter.interpret(input, host).await;
    }

    /// Hand the poller's join handle to the caller, e.g. so a front end
    /// can await a critical-disconnect exit. After this, `shutdown` no
    /// longer joins the poller.
    pub fn take_poller(&self) -> Option<JoinHandle<PollerExit>> {
        match self.poller.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Orderly teardown: signal every background task, join them with
    /// bounded waits, release the port. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(true);
        self.recorder.shutdown().await;
        if let Some(handle) = self.take_poller() {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
        self.link.close().await;
        self.state.set_status(ConnectionState::Disconnected);
    }
}
