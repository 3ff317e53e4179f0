//! Telemetry and control agent for serial-attached source-measure units.
//!
//! The agent opens a serial channel to an SCPI-speaking SMU, verifies its
//! identity, then runs three cooperating tasks over one shared link:
//!
//! - a [`poller`](crate::poller) sampling voltage/current on a fixed
//!   cadence and driving reconnection on link failure,
//! - a [`recorder`](crate::recorder) appending samples to daily CSV files,
//! - a [`commands`](crate::commands) interpreter executing operator input.
//!
//! All observable state (connection status, latest sample, message
//! history) lives in [`state::SharedState`], which any front end can
//! poll without touching the instrument.

pub mod app;
pub mod commands;
pub mod config;
pub mod error;
pub mod link;
pub mod poller;
pub mod recorder;
pub mod state;
pub mod supervisor;

pub use error::{AppResult, SmuError};
