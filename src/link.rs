//! Serial channel to the source-measure unit.
//!
//! [`InstrumentLink`] owns a single buffered serial port behind a tokio
//! mutex, so every write/query exchange is serialized end to end: a caller
//! holds the port for the full round trip and responses can never be
//! attributed to the wrong command. The transport is type-erased
//! (`AsyncRead + AsyncWrite`), which lets tests drive the link over
//! in-memory duplex streams instead of hardware.

use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::config::ConnectionSettings;
use crate::error::{AppResult, SmuError};

/// Trait alias for async serial port I/O.
///
/// Satisfied by `tokio_serial::SerialStream` (real hardware) and
/// `tokio::io::DuplexStream` (tests) alike.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Factory producing a fresh transport for each (re)connect attempt.
pub type TransportFactory =
    Box<dyn Fn() -> BoxFuture<'static, AppResult<DynSerial>> + Send + Sync>;

/// Transport and handshake parameters of a link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub baud_rate: u32,
    /// Deadline for each expected response line.
    pub read_timeout: Duration,
    /// Substring the `*IDN?` reply must contain (case-insensitive).
    pub idn_marker: String,
    /// Attempts made by [`InstrumentLink::open`] before giving up.
    pub open_retries: u32,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(200),
            idn_marker: "SMU".into(),
            open_retries: 3,
        }
    }
}

impl From<&ConnectionSettings> for LinkOptions {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            baud_rate: settings.baud_rate,
            read_timeout: settings.read_timeout,
            idn_marker: settings.idn_marker.clone(),
            open_retries: settings.open_retries,
        }
    }
}

/// A serial port visible to the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

/// Enumerate serial ports present on this machine.
pub fn discover_ports() -> AppResult<Vec<PortInfo>> {
    let ports = tokio_serial::available_ports().map_err(|e| SmuError::PortOpen {
        port: "<enumeration>".into(),
        reason: e.to_string(),
    })?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let description = match p.port_type {
                tokio_serial::SerialPortType::UsbPort(usb) => {
                    usb.product.unwrap_or_else(|| "USB serial device".into())
                }
                tokio_serial::SerialPortType::BluetoothPort => "Bluetooth serial".into(),
                tokio_serial::SerialPortType::PciPort => "PCI serial".into(),
                tokio_serial::SerialPortType::Unknown => "serial device".into(),
            };
            PortInfo {
                name: p.port_name,
                description,
            }
        })
        .collect())
}

/// Open a serial port with spawn_blocking, applying 8N1 and no flow control.
async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    let result = spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| (path, e.to_string()))
    })
    .await
    .map_err(|e| SmuError::PortOpen {
        port: port_path.to_string(),
        reason: format!("spawn_blocking failed: {e}"),
    })?;

    result.map_err(|(port, reason)| SmuError::PortOpen { port, reason })
}

/// Read and discard whatever is already sitting in the receive buffer.
async fn drain_input<R: AsyncRead + Unpin>(port: &mut R, budget: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + budget;
    let mut total = 0usize;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }
    total
}

/// Capability of a source-measure channel: program an output level and
/// read the measured values back.
#[async_trait::async_trait]
pub trait SourceMeasure {
    async fn set_voltage(&self, volts: f64) -> AppResult<()>;
    async fn set_current(&self, amps: f64) -> AppResult<()>;
    async fn measure_voltage(&self) -> AppResult<f64>;
    async fn measure_current(&self) -> AppResult<f64>;
    async fn voltage_limit(&self) -> AppResult<f64>;
    async fn current_limit(&self) -> AppResult<f64>;
}

enum HandshakeFailure {
    /// No usable reply; worth retrying on a fresh open.
    Silent(SmuError),
    /// The device identified itself as something else entirely.
    WrongDevice(SmuError),
}

impl HandshakeFailure {
    fn into_error(self) -> SmuError {
        match self {
            HandshakeFailure::Silent(e) | HandshakeFailure::WrongDevice(e) => e,
        }
    }
}

struct ConnectFailure {
    error: SmuError,
    retryable: bool,
}

/// Exclusive serial channel to one SMU.
pub struct InstrumentLink {
    port_name: String,
    options: LinkOptions,
    transport: TransportFactory,
    /// `None` means the link has been invalidated or never established.
    port: Mutex<Option<BufReader<DynSerial>>>,
}

impl fmt::Debug for InstrumentLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentLink")
            .field("port_name", &self.port_name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl InstrumentLink {
    /// Open `path`, verify the instrument identifies as an SMU, and return
    /// an established link. Transient failures (port busy, no identify
    /// reply) are retried up to `options.open_retries` times; a device
    /// that identifies as something else fails immediately.
    pub async fn open(path: &str, options: LinkOptions) -> AppResult<Self> {
        let owned = path.to_string();
        let baud = options.baud_rate;
        let transport: TransportFactory = Box::new(move || {
            let path = owned.clone();
            async move {
                let stream = open_serial_async(&path, baud).await?;
                Ok(Box::new(stream) as DynSerial)
            }
            .boxed()
        });
        let link = Self::with_transport(path, options, transport);
        link.connect().await?;
        Ok(link)
    }

    /// Build a link over a caller-supplied transport factory. The link
    /// starts unconnected; call [`connect`](Self::connect) to establish it.
    pub fn with_transport(name: &str, options: LinkOptions, transport: TransportFactory) -> Self {
        Self {
            port_name: name.to_string(),
            options,
            transport,
            port: Mutex::new(None),
        }
    }

    /// Wrap an already-open transport, without running the handshake.
    /// Such a link cannot be reopened after invalidation; call
    /// [`verify`](Self::verify) to run the identify handshake.
    pub fn from_port(port: DynSerial, name: &str, options: LinkOptions) -> Self {
        let owned = name.to_string();
        let transport: TransportFactory = Box::new(move || {
            let port = owned.clone();
            async move {
                Err(SmuError::PortOpen {
                    port,
                    reason: "in-memory transport cannot be reopened".into(),
                })
            }
            .boxed()
        });
        Self {
            port_name: name.to_string(),
            options,
            transport,
            port: Mutex::new(Some(BufReader::new(port))),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub async fn is_connected(&self) -> bool {
        self.port.lock().await.is_some()
    }

    /// Establish the link: open a fresh transport and run the identify
    /// handshake, with bounded retries for transient failures.
    pub async fn connect(&self) -> AppResult<()> {
        let retries = self.options.open_retries.max(1);
        let mut last = None;
        for attempt in 1..=retries {
            match self.attempt_connect().await {
                Ok(()) => return Ok(()),
                Err(ConnectFailure { error, retryable }) => {
                    if !retryable {
                        return Err(error);
                    }
                    debug!(
                        "open attempt {attempt}/{retries} on {} failed: {error}",
                        self.port_name
                    );
                    last = Some(error);
                }
            }
            if attempt < retries {
                tokio::time::sleep(Duration::from_millis(120)).await;
            }
        }
        Err(last.unwrap_or(SmuError::NotConnected))
    }

    /// One reconnect attempt: drop any stale handle, reopen, re-verify.
    /// Retry scheduling is the supervisor's job, so this makes exactly
    /// one attempt.
    pub async fn reconnect(&self) -> AppResult<()> {
        self.close().await;
        self.attempt_connect().await.map_err(|f| f.error)
    }

    /// Drop the port handle, releasing the OS device. Safe to call twice.
    pub async fn close(&self) {
        let mut guard = self.port.lock().await;
        if guard.take().is_some() {
            debug!("closed serial port {}", self.port_name);
        }
    }

    async fn attempt_connect(&self) -> Result<(), ConnectFailure> {
        let raw = (self.transport)().await.map_err(|error| ConnectFailure {
            error,
            retryable: true,
        })?;
        let mut reader = BufReader::new(raw);
        let drained = drain_input(reader.get_mut(), Duration::from_millis(20)).await;
        if drained > 0 {
            debug!("drained {drained} stale bytes from {}", self.port_name);
        }
        match self.verify_reader(&mut reader).await {
            Ok(identity) => {
                info!("connected to '{identity}' on {}", self.port_name);
                *self.port.lock().await = Some(reader);
                Ok(())
            }
            // dropping `reader` here closes the handle
            Err(HandshakeFailure::WrongDevice(error)) => Err(ConnectFailure {
                error,
                retryable: false,
            }),
            Err(HandshakeFailure::Silent(error)) => Err(ConnectFailure {
                error,
                retryable: true,
            }),
        }
    }

    /// Run the `*IDN?` handshake on the installed port. On failure the
    /// port is dropped, so a rejected device never lingers half-open.
    pub async fn verify(&self) -> AppResult<String> {
        let mut guard = self.port.lock().await;
        let reader = guard.as_mut().ok_or(SmuError::NotConnected)?;
        match self.verify_reader(reader).await {
            Ok(identity) => Ok(identity),
            Err(failure) => {
                *guard = None;
                Err(failure.into_error())
            }
        }
    }

    async fn verify_reader(
        &self,
        reader: &mut BufReader<DynSerial>,
    ) -> Result<String, HandshakeFailure> {
        let silent = |msg: String| HandshakeFailure::Silent(SmuError::Handshake(msg));

        reader
            .get_mut()
            .write_all(b"*IDN?\n")
            .await
            .map_err(|e| silent(format!("identify write failed: {e}")))?;
        reader
            .get_mut()
            .flush()
            .await
            .map_err(|e| silent(format!("identify flush failed: {e}")))?;

        let mut line = String::new();
        let n = tokio::time::timeout(self.options.read_timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| {
                silent(format!(
                    "no response to *IDN? within {:?}",
                    self.options.read_timeout
                ))
            })?
            .map_err(|e| silent(format!("identify read failed: {e}")))?;
        if n == 0 {
            return Err(silent("port closed during identify".into()));
        }

        let identity = line.trim();
        if identity.is_empty() {
            return Err(silent("empty identify response".into()));
        }
        if !identity
            .to_uppercase()
            .contains(&self.options.idn_marker.to_uppercase())
        {
            return Err(HandshakeFailure::WrongDevice(SmuError::Handshake(format!(
                "device '{identity}' does not identify as {}",
                self.options.idn_marker
            ))));
        }
        debug!("identify ok on {}: {identity}", self.port_name);
        Ok(identity.to_string())
    }

    /// Send a command that expects no reply. A transport failure
    /// invalidates the link.
    #[tracing::instrument(skip(self), fields(port = %self.port_name), err)]
    pub async fn write(&self, command: &str) -> AppResult<()> {
        let mut guard = self.port.lock().await;
        let reader = guard.as_mut().ok_or(SmuError::NotConnected)?;
        let framed = format!("{command}\n");
        if let Err(e) = reader.get_mut().write_all(framed.as_bytes()).await {
            *guard = None;
            return Err(SmuError::Link(format!("write failed: {e}")));
        }
        if let Err(e) = reader.get_mut().flush().await {
            *guard = None;
            return Err(SmuError::Link(format!("flush failed: {e}")));
        }
        Ok(())
    }

    /// Send a query and read one response line, holding the port for the
    /// whole round trip. Timeouts and I/O failures invalidate the link;
    /// the caller sees the error and the next call fails fast with
    /// `NotConnected`.
    #[tracing::instrument(skip(self), fields(port = %self.port_name), err)]
    pub async fn query(&self, command: &str) -> AppResult<String> {
        let mut guard = self.port.lock().await;
        let reader = guard.as_mut().ok_or(SmuError::NotConnected)?;

        let framed = format!("{command}\n");
        if let Err(e) = reader.get_mut().write_all(framed.as_bytes()).await {
            *guard = None;
            return Err(SmuError::Link(format!("write failed: {e}")));
        }
        if let Err(e) = reader.get_mut().flush().await {
            *guard = None;
            return Err(SmuError::Link(format!("flush failed: {e}")));
        }

        let mut line = String::new();
        let n = match tokio::time::timeout(self.options.read_timeout, reader.read_line(&mut line))
            .await
        {
            Err(_) => {
                *guard = None;
                return Err(SmuError::Link(format!(
                    "no response to '{command}' within {:?}",
                    self.options.read_timeout
                )));
            }
            Ok(Err(e)) => {
                *guard = None;
                return Err(SmuError::Link(format!("read failed: {e}")));
            }
            Ok(Ok(n)) => n,
        };
        if n == 0 {
            *guard = None;
            return Err(SmuError::UnexpectedEof);
        }

        Ok(line.trim().to_string())
    }

    /// Ask the instrument for its identity string.
    pub async fn identify(&self) -> AppResult<String> {
        self.query("*IDN?").await
    }

    /// Query a single numeric value.
    pub async fn query_f64(&self, command: &str) -> AppResult<f64> {
        let response = self.query(command).await?;
        response
            .trim()
            .parse::<f64>()
            .map_err(|_| SmuError::Parse {
                command: command.to_string(),
                response,
            })
    }
}

#[async_trait::async_trait]
impl SourceMeasure for InstrumentLink {
    async fn set_voltage(&self, volts: f64) -> AppResult<()> {
        self.write(&format!(":SOUR:VOLT {volts}")).await
    }

    async fn set_current(&self, amps: f64) -> AppResult<()> {
        self.write(&format!(":SOUR:CURR {amps}")).await
    }

    async fn measure_voltage(&self) -> AppResult<f64> {
        self.query_f64(":MEAS:VOLT?").await
    }

    async fn measure_current(&self) -> AppResult<f64> {
        self.query_f64(":MEAS:CURR?").await
    }

    async fn voltage_limit(&self) -> AppResult<f64> {
        self.query_f64(":SOUR:VOLT:LIM?").await
    }

    async fn current_limit(&self) -> AppResult<f64> {
        self.query_f64(":SOUR:CURR:LIM?").await
    }
}
