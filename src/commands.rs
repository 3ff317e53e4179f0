//! Interactive command interpreter.
//!
//! Commands arrive as free text from whatever front end is attached. The
//! interpreter tokenizes shell-style (quotes group words), dispatches on
//! the first token case-insensitively, and reports every outcome through
//! the shared message history; it never panics and never returns errors
//! to the caller.

use std::sync::Arc;

use crate::error::{AppResult, SmuError};
use crate::link::{InstrumentLink, SourceMeasure};
use crate::recorder::Recorder;
use crate::state::SharedState;

/// Shown for `help`.
pub const HELP_TEXT: &str = "\
Commands:
  vmode|vlimit <V>    Set source voltage (e.g. vlimit 5.0)
  cmode|climit <I>    Set source current (e.g. climit 0.05)
  logdata <on|off>    Enable or disable CSV data recording
  mode?               Query programmed voltage/current limits
  help, h             Show this help message
  clear, cls          Clear the message history
  exit, quit          Exit the program";

/// The front end attached to the interpreter. `exit` asks the host to
/// begin an orderly shutdown; it must not block.
pub trait Host: Send + Sync {
    fn request_exit(&self);
}

/// Split into whitespace-separated tokens, honoring single and double
/// quotes. An unterminated quote is an error.
pub fn split_tokens(input: &str) -> AppResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for ch in input.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None => match ch {
                '"' | '\'' => {
                    quote = Some(ch);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                c => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err(SmuError::Command("unterminated quote".into()));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[derive(Clone, Copy)]
enum SourceChannel {
    Voltage,
    Current,
}

pub struct CommandInterpreter {
    link: Arc<InstrumentLink>,
    state: SharedState,
    recorder: Arc<Recorder>,
}

impl CommandInterpreter {
    pub fn new(link: Arc<InstrumentLink>, state: SharedState, recorder: Arc<Recorder>) -> Self {
        Self {
            link,
            state,
            recorder,
        }
    }

    /// Execute one line of user input. All feedback, including errors,
    /// goes to the message history.
    pub async fn interpret(&self, input: &str, host: &dyn Host) {
        let tokens = match split_tokens(input) {
            Ok(tokens) => tokens,
            Err(err) => {
                self.state.push_message(&format!("Syntax error: {err}"));
                return;
            }
        };
        self.state.push_message(&format!("> {input}"));

        let Some(first) = tokens.first() else {
            self.state
                .push_message("Unknown command: ''. Type 'help' for options.");
            return;
        };
        match first.to_lowercase().as_str() {
            "exit" | "quit" | "q" => host.request_exit(),
            "help" | "h" | "?" => self.state.push_message(HELP_TEXT),
            "clear" | "cls" => self.state.clear_messages(),
            "vmode" | "vlimit" => self.set_source(&tokens, SourceChannel::Voltage).await,
            "cmode" | "climit" => self.set_source(&tokens, SourceChannel::Current).await,
            "logdata" => self.logdata(&tokens),
            "mode?" => self.query_limits().await,
            other => self.state.push_message(&format!(
                "Unknown command: '{other}'. Type 'help' for options."
            )),
        }
    }

    async fn set_source(&self, tokens: &[String], channel: SourceChannel) {
        let usage = match channel {
            SourceChannel::Voltage => "Usage: vlimit <voltage>",
            SourceChannel::Current => "Usage: climit <current>",
        };
        if tokens.len() != 2 {
            self.state.push_message(usage);
            return;
        }
        let value: f64 = match tokens[1].parse() {
            Ok(value) => value,
            Err(_) => {
                self.state
                    .push_message(&format!("Invalid number: '{}'", tokens[1]));
                return;
            }
        };
        let result = match channel {
            SourceChannel::Voltage => self.link.set_voltage(value).await,
            SourceChannel::Current => self.link.set_current(value).await,
        };
        match (result, channel) {
            (Ok(()), SourceChannel::Voltage) => {
                self.state.push_message(&format!("Set Voltage: {value} V"));
            }
            (Ok(()), SourceChannel::Current) => {
                self.state.push_message(&format!("Set Current: {value} A"));
            }
            (Err(err), _) => self.state.push_message(&format!("Serial error: {err}")),
        }
    }

    fn logdata(&self, tokens: &[String]) {
        if tokens.len() != 2 {
            self.state.push_message("Usage: logdata <on|off>");
            return;
        }
        match tokens[1].to_lowercase().as_str() {
            "on" => {
                self.recorder.start();
                self.state.push_message("Logdata -> on");
            }
            "off" => {
                self.recorder.stop();
                self.state.push_message("Logdata -> off");
            }
            other => self
                .state
                .push_message(&format!("Invalid state '{other}', use 'on' or 'off'")),
        }
    }

    async fn query_limits(&self) {
        let limits = async {
            let voltage = self.link.voltage_limit().await?;
            let current = self.link.current_limit().await?;
            Ok::<_, SmuError>((voltage, current))
        }
        .await;
        match limits {
            Ok((voltage, current)) => self
                .state
                .push_message(&format!("Limits -> V: {voltage} V, I: {current} A")),
            Err(err) => self.state.push_message(&format!("Serial error: {err}")),
        }
    }
}
