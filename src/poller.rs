//! Background status poller.
//!
//! Samples voltage and current on a fixed cadence and publishes each pair
//! to [`SharedState`] atomically. On a link failure the poller hands the
//! link to the reconnect supervisor; if the supervisor exhausts its
//! schedule the poller marks the state `Failed` and exits so the host can
//! surface a critical alert.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::SmuError;
use crate::link::{InstrumentLink, SourceMeasure};
use crate::state::{ConnectionState, Measurement, SharedState};
use crate::supervisor::ConnectionSupervisor;

/// Why the polling task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    /// Shutdown was requested; the instrument may still be healthy.
    Shutdown,
    /// Reconnection was exhausted; operator intervention is required.
    CriticalDisconnect,
}

pub struct Poller {
    link: Arc<InstrumentLink>,
    state: SharedState,
    supervisor: ConnectionSupervisor,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Poller {
    pub fn new(
        link: Arc<InstrumentLink>,
        state: SharedState,
        supervisor: ConnectionSupervisor,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            link,
            state,
            supervisor,
            interval,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<PollerExit> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> PollerExit {
        debug!("poller running every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return PollerExit::Shutdown,
                _ = ticker.tick() => {}
            }
            if *self.shutdown.borrow() {
                return PollerExit::Shutdown;
            }

            match self.sample().await {
                Ok(measurement) => {
                    self.state.publish(measurement, ConnectionState::Connected);
                }
                Err(err) if !err.is_link_failure() => {
                    // a garbled reply costs one sample, not the connection
                    warn!("skipping unreadable sample: {err}");
                }
                Err(err) => {
                    warn!("instrument link lost: {err}");
                    self.state.set_status(ConnectionState::Reconnecting);
                    self.state.push_message(&format!("Connection lost: {err}"));

                    let link = self.link.clone();
                    let reconnect = move || {
                        let link = link.clone();
                        async move { link.reconnect().await }
                    };
                    match self.supervisor.run(reconnect, &mut self.shutdown).await {
                        Ok(attempts) => {
                            self.state.set_status(ConnectionState::Connected);
                            self.state.push_message(&format!(
                                "Reconnected after {attempts} attempt(s). \
                                 Output settings may have reset; re-apply limits if needed."
                            ));
                        }
                        Err(SmuError::Cancelled) => return PollerExit::Shutdown,
                        Err(err) => {
                            self.state.set_status(ConnectionState::Failed);
                            self.state
                                .push_message(&format!("CRITICAL: {err}. Reconnect manually."));
                            return PollerExit::CriticalDisconnect;
                        }
                    }
                }
            }
        }
    }

    async fn sample(&self) -> crate::error::AppResult<Measurement> {
        let voltage = self.link.measure_voltage().await?;
        let current = self.link.measure_current().await?;
        Ok(Measurement {
            voltage,
            current,
            timestamp: Utc::now(),
        })
    }
}
