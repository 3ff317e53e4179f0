//! Error taxonomy for the SMU agent.
//!
//! Every fallible operation in the crate returns [`AppResult`]. Transport
//! failures are split by recovery strategy: failures that invalidate the
//! serial link (`Link`, `UnexpectedEof`, `NotConnected`) trigger the
//! reconnect supervisor, while `Parse` failures leave the link open and
//! only skip the affected sample.

use thiserror::Error;

/// Convenient alias used throughout the crate.
pub type AppResult<T> = Result<T, SmuError>;

/// All error conditions the agent can surface.
#[derive(Error, Debug)]
pub enum SmuError {
    /// The operating system refused to open the serial device.
    #[error("Could not open port '{port}': {reason}")]
    PortOpen { port: String, reason: String },

    /// The device answered the identify query incorrectly, or not at all.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A read or write on an established link failed. The link is
    /// invalidated when this is returned.
    #[error("Serial link error: {0}")]
    Link(String),

    /// An operation was attempted while no serial port is attached.
    #[error("Instrument is not connected")]
    NotConnected,

    /// The peer closed the connection mid-exchange.
    #[error("Unexpected end of stream from instrument")]
    UnexpectedEof,

    /// The instrument replied, but the payload was not understood.
    #[error("Malformed response to '{command}': '{response}'")]
    Parse { command: String, response: String },

    /// A user command was syntactically or semantically invalid.
    #[error("Command error: {0}")]
    Command(String),

    /// Reconnection was attempted and exhausted without success.
    #[error("Instrument lost: {attempts} reconnect attempts failed")]
    CriticalDisconnect { attempts: u32 },

    /// A blocking operation was abandoned because shutdown was requested.
    #[error("Operation cancelled by shutdown")]
    Cancelled,

    /// Configuration could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration was loaded but failed validation.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// CSV serialization failed while recording data.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Filesystem-level failure (data directory, log files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SmuError {
    /// Whether this error means the serial link can no longer be trusted
    /// and the reconnect supervisor should take over.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            SmuError::Link(_) | SmuError::NotConnected | SmuError::UnexpectedEof
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_failures_are_flagged_for_reconnect() {
        assert!(SmuError::NotConnected.is_link_failure());
        assert!(SmuError::UnexpectedEof.is_link_failure());
        assert!(SmuError::Link("broken pipe".into()).is_link_failure());
    }

    #[test]
    fn parse_errors_do_not_invalidate_the_link() {
        let err = SmuError::Parse {
            command: ":MEAS:VOLT?".into(),
            response: "garbage".into(),
        };
        assert!(!err.is_link_failure());
        assert!(!SmuError::Handshake("no reply".into()).is_link_failure());
    }

    #[test]
    fn display_includes_context() {
        let err = SmuError::PortOpen {
            port: "/dev/ttyUSB0".into(),
            reason: "permission denied".into(),
        };
        assert!(err.to_string().contains("/dev/ttyUSB0"));

        let err = SmuError::CriticalDisconnect { attempts: 5 };
        assert!(err.to_string().contains('5'));
    }
}
