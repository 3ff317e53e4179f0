//! CSV data recorder.
//!
//! Appends timestamped voltage/current rows to a per-day file named after
//! the serial port. The recorder shares the instrument link with the
//! poller but never manages it: when a sample fails the row is skipped
//! and reconnection is left entirely to the poller's supervisor.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::StorageSettings;
use crate::error::AppResult;
use crate::link::{InstrumentLink, SourceMeasure};
use crate::supervisor::wait_or_cancel;

/// Column order of every data file.
pub const CSV_HEADERS: [&str; 4] = [
    "timestamp_utc",
    "timestamp_epoch_ms",
    "voltage_v",
    "current_a",
];

/// Runtime-adjustable recording parameters.
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub data_dir: PathBuf,
    pub interval: Duration,
    pub log_voltage: bool,
    pub log_current: bool,
}

impl From<&StorageSettings> for RecorderSettings {
    fn from(settings: &StorageSettings) -> Self {
        Self {
            data_dir: settings.data_dir.clone(),
            interval: settings.interval,
            log_voltage: settings.log_voltage,
            log_current: settings.log_current,
        }
    }
}

/// Port identifiers contain path separators on every platform; flatten
/// them so the file lands inside the data directory.
pub fn sanitize_port_id(port: &str) -> String {
    port.replace(['/', '\\'], "_")
}

/// `<data_dir>/<sanitized-port>-<yyyy-mm-dd>.csv`
pub fn data_file_path(data_dir: &Path, port: &str, date: NaiveDate) -> PathBuf {
    data_dir.join(format!(
        "{}-{}.csv",
        sanitize_port_id(port),
        date.format("%Y-%m-%d")
    ))
}

struct RecorderShared {
    settings: StdMutex<RecorderSettings>,
    enabled: AtomicBool,
}

/// Handle controlling the background recording task.
pub struct Recorder {
    link: Arc<InstrumentLink>,
    shared: Arc<RecorderShared>,
    handle: StdMutex<Option<JoinHandle<()>>>,
    term_tx: watch::Sender<bool>,
}

impl Recorder {
    pub fn new(link: Arc<InstrumentLink>, settings: RecorderSettings) -> Self {
        let (term_tx, _term_rx) = watch::channel(false);
        Self {
            link,
            shared: Arc::new(RecorderShared {
                settings: StdMutex::new(settings),
                enabled: AtomicBool::new(false),
            }),
            handle: StdMutex::new(None),
            term_tx,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Enable recording, spawning the background loop if it is not
    /// already alive. Idempotent.
    pub fn start(&self) {
        self.shared.enabled.store(true, Ordering::SeqCst);
        let mut guard = lock_unpoisoned(&self.handle);
        let alive = guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if !alive {
            let worker = RecorderLoop {
                link: self.link.clone(),
                shared: self.shared.clone(),
                term: self.term_tx.subscribe(),
                port_id: self.link.port_name().to_string(),
            };
            *guard = Some(tokio::spawn(worker.run()));
        }
        info!("data recording enabled");
    }

    /// Pause recording. The loop stays alive so a later `start` resumes
    /// without respawning.
    pub fn stop(&self) {
        self.shared.enabled.store(false, Ordering::SeqCst);
        info!("data recording paused");
    }

    /// Adjust parameters; `None` leaves a field unchanged. Takes effect
    /// on the next recording cycle.
    pub fn set_parameters(
        &self,
        interval: Option<Duration>,
        log_voltage: Option<bool>,
        log_current: Option<bool>,
    ) {
        let mut settings = lock_unpoisoned(&self.shared.settings);
        if let Some(interval) = interval {
            settings.interval = interval;
        }
        if let Some(log_voltage) = log_voltage {
            settings.log_voltage = log_voltage;
        }
        if let Some(log_current) = log_current {
            settings.log_current = log_current;
        }
    }

    /// Stop recording and join the background task, waiting at most one
    /// second. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shared.enabled.store(false, Ordering::SeqCst);
        let _ = self.term_tx.send(true);
        let handle = lock_unpoisoned(&self.handle).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                warn!("recorder task did not stop within 1s");
            }
        }
    }
}

fn lock_unpoisoned<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct RecorderLoop {
    link: Arc<InstrumentLink>,
    shared: Arc<RecorderShared>,
    term: watch::Receiver<bool>,
    port_id: String,
}

impl RecorderLoop {
    async fn run(mut self) {
        debug!("recorder loop started for {}", self.port_id);
        let mut session: Option<RecorderSession> = None;

        loop {
            if *self.term.borrow() {
                break;
            }
            if !self.shared.enabled.load(Ordering::SeqCst) {
                if wait_or_cancel(Duration::from_millis(200), &mut self.term).await {
                    break;
                }
                continue;
            }

            let started = tokio::time::Instant::now();
            let (interval, log_voltage, log_current, data_dir) = {
                let settings = lock_unpoisoned(&self.shared.settings);
                (
                    settings.interval,
                    settings.log_voltage,
                    settings.log_current,
                    settings.data_dir.clone(),
                )
            };

            // rotate at UTC midnight
            let today = Utc::now().date_naive();
            if session.as_ref().map(|s| s.date) != Some(today) {
                session = match RecorderSession::open(&data_dir, &self.port_id, today) {
                    Ok(new) => Some(new),
                    Err(err) => {
                        warn!("cannot open data file: {err}");
                        None
                    }
                };
            }

            match self.sample(log_voltage, log_current).await {
                Ok((timestamp, voltage, current)) => {
                    if let Some(session) = session.as_mut() {
                        if let Err(err) = session.append(timestamp, voltage, current) {
                            warn!("failed to append data row: {err}");
                        }
                    }
                }
                // the poller owns recovery; just skip this row
                Err(err) => debug!("data sample skipped: {err}"),
            }

            let wait = interval.saturating_sub(started.elapsed());
            if wait_or_cancel(wait, &mut self.term).await {
                break;
            }
        }
        debug!("recorder loop exited for {}", self.port_id);
    }

    async fn sample(
        &self,
        log_voltage: bool,
        log_current: bool,
    ) -> AppResult<(DateTime<Utc>, Option<f64>, Option<f64>)> {
        let timestamp = Utc::now();
        let voltage = if log_voltage {
            Some(self.link.measure_voltage().await?)
        } else {
            None
        };
        let current = if log_current {
            Some(self.link.measure_current().await?)
        } else {
            None
        };
        Ok((timestamp, voltage, current))
    }
}

struct RecorderSession {
    date: NaiveDate,
    writer: csv::Writer<std::fs::File>,
}

impl RecorderSession {
    /// Open (or create) today's file in append mode, writing the header
    /// only when the file is new or empty.
    fn open(data_dir: &Path, port_id: &str, date: NaiveDate) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_file_path(data_dir, port_id, date);
        let needs_header = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        let mut writer = csv::Writer::from_writer(file);
        if needs_header {
            writer.write_record(CSV_HEADERS)?;
            writer.flush()?;
        }
        info!("recording to {}", path.display());
        Ok(Self { date, writer })
    }

    /// Disabled channels record as empty cells so the column layout never
    /// shifts.
    fn append(
        &mut self,
        timestamp: DateTime<Utc>,
        voltage: Option<f64>,
        current: Option<f64>,
    ) -> AppResult<()> {
        self.writer.write_record([
            timestamp.to_rfc3339(),
            timestamp.timestamp_millis().to_string(),
            voltage.map(|v| v.to_string()).unwrap_or_default(),
            current.map(|c| c.to_string()).unwrap_or_default(),
        ])?;
        self.writer.flush()?;
        Ok(())
    }
}
