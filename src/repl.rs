//! Remote Lua REPL over the control channel.
//!
//! Each fragment is base64-encoded and sent to the companion REPL plugin,
//! which answers with a one-element JSON array:
//!
//! ```json
//! [{"error": "", "ret": 2, "out": ["printed line"]}]
//! ```
//!
//! The only state kept between submissions is whether the previous fragment
//! left a statement open. Callers are responsible for gluing continuation
//! lines together before resubmitting.

use std::fmt;
use std::io::{self, BufRead, IsTerminal, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use colored::Colorize;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::device::control::{ControlError, ControlTransport, RemoteControlClient};

/// Error text the REPL plugin uses for a statement that needs more lines.
pub const INCOMPLETE_SENTINEL: &str = "code is incomplete";

pub const PRIMARY_PROMPT: &str = ">>> ";
pub const CONTINUATION_PROMPT: &str = "... ";

#[derive(Error, Debug)]
pub enum ReplError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("could not decode REPL response ({detail}): {body}")]
    Decode { detail: String, body: String },
}

/// One chunk of source text sent for evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplFragment {
    pub source_text: String,
}

impl ReplFragment {
    pub fn new(source_text: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
        }
    }

    /// Standard base64 of the raw source bytes.
    pub fn encode(&self) -> String {
        STANDARD.encode(self.source_text.as_bytes())
    }
}

/// What a completed fragment evaluated to.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnValue {
    /// Nothing worth printing.
    Absent,
    Value(Value),
}

impl ReturnValue {
    fn from_wire(ret: Option<Value>) -> Self {
        match ret {
            None | Some(Value::Null) => Self::Absent,
            Some(Value::String(s)) if s == "<nil>" => Self::Absent,
            Some(Value::Object(map)) if is_empty_pack(&map) => Self::Absent,
            Some(value) => Self::Value(value),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// `table.pack()` of zero results serializes as `{"n": 0}`.
fn is_empty_pack(map: &serde_json::Map<String, Value>) -> bool {
    map.len() == 1 && map.get("n").and_then(Value::as_u64) == Some(0)
}

impl fmt::Display for ReturnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => Ok(()),
            Self::Value(Value::String(s)) => f.write_str(s),
            Self::Value(other) => write!(f, "{other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplOutcome {
    Complete {
        return_value: ReturnValue,
        output_lines: Vec<String>,
    },
    Incomplete,
    Failed {
        message: String,
    },
}

#[derive(Deserialize)]
struct ReplRecord {
    #[serde(default)]
    error: String,
    #[serde(default)]
    ret: Option<Value>,
    #[serde(default, deserialize_with = "output_lines")]
    out: Vec<String>,
}

/// Lua serializes an empty table as `{}`, so an empty output list can arrive
/// as an object.
fn output_lines<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Shape {
        Lines(Vec<String>),
        Table(serde_json::Map<String, Value>),
    }

    match Shape::deserialize(deserializer)? {
        Shape::Lines(lines) => Ok(lines),
        Shape::Table(map) if map.is_empty() => Ok(Vec::new()),
        Shape::Table(_) => Err(serde::de::Error::custom(
            "`out` must be a list of strings or an empty table",
        )),
    }
}

/// Decode a REPL response body into an outcome.
pub fn decode_response(body: &[u8]) -> Result<ReplOutcome, ReplError> {
    let decode_err = |detail: String| ReplError::Decode {
        detail,
        body: String::from_utf8_lossy(body).into_owned(),
    };

    let mut records: Vec<ReplRecord> =
        serde_json::from_slice(body).map_err(|e| decode_err(e.to_string()))?;
    if records.len() != 1 {
        return Err(decode_err(format!(
            "expected exactly one record, got {}",
            records.len()
        )));
    }
    let Some(record) = records.pop() else {
        return Err(decode_err("empty response".into()));
    };

    Ok(match record.error.as_str() {
        INCOMPLETE_SENTINEL => ReplOutcome::Incomplete,
        "" => ReplOutcome::Complete {
            return_value: ReturnValue::from_wire(record.ret),
            output_lines: record.out,
        },
        _ => ReplOutcome::Failed {
            message: record.error,
        },
    })
}

/// Submission state for one interactive session.
pub struct ReplSession<'a, T: ControlTransport> {
    client: &'a RemoteControlClient<T>,
    incomplete: bool,
}

impl<'a, T: ControlTransport> ReplSession<'a, T> {
    pub fn new(client: &'a RemoteControlClient<T>) -> Self {
        Self {
            client,
            incomplete: false,
        }
    }

    /// Evaluate `source_text` on the device.
    ///
    /// Any `Err` leaves the session expecting a fresh statement.
    pub fn submit(&mut self, source_text: &str) -> Result<ReplOutcome, ReplError> {
        let fragment = ReplFragment::new(source_text);
        let outcome = self
            .client
            .submit_repl_fragment(&fragment.encode())
            .map_err(ReplError::from)
            .and_then(|body| decode_response(&body));

        self.incomplete = matches!(outcome, Ok(ReplOutcome::Incomplete));
        outcome
    }

    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn prompt(&self) -> &'static str {
        if self.incomplete {
            CONTINUATION_PROMPT
        } else {
            PRIMARY_PROMPT
        }
    }

    /// Discard any statement the device is still holding open.
    pub fn reset(&mut self) -> Result<(), ReplError> {
        self.incomplete = false;
        self.client.reset_repl()?;
        Ok(())
    }
}

/// Where the interactive loop reads lines from.
pub trait LineSource {
    /// `Ok(None)` ends the session.
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>>;
}

/// Line editor on an interactive terminal.
pub struct TerminalLines;

impl LineSource for TerminalLines {
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        let input = dialoguer::Input::<String>::new()
            .with_prompt(prompt.trim_end())
            .allow_empty(true)
            .report(false)
            .interact_text();
        match input {
            Ok(line) => Ok(Some(line)),
            Err(dialoguer::Error::IO(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::UnexpectedEof
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

/// Plain buffered reader, used when stdin is piped.
pub struct ReaderLines<R> {
    reader: R,
}

impl<R: BufRead> ReaderLines<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> LineSource for ReaderLines<R> {
    fn read_line(&mut self, _prompt: &str) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }
}

/// Pick the terminal editor when attached to a TTY, a plain reader otherwise.
pub fn stdin_lines() -> Box<dyn LineSource> {
    if io::stdin().is_terminal() {
        Box::new(TerminalLines)
    } else {
        Box::new(ReaderLines::new(io::stdin().lock()))
    }
}

fn is_exit_command(line: &str) -> bool {
    matches!(line, "exit" | "quit")
}

/// Print the return value and captured output of a completed fragment.
pub fn render_outcome(
    return_value: &ReturnValue,
    output_lines: &[String],
    out: &mut impl Write,
) -> io::Result<()> {
    for line in output_lines {
        writeln!(out, "[OUT] {line}")?;
    }
    if !return_value.is_absent() {
        writeln!(out, "[RET] {return_value}")?;
    }
    Ok(())
}

/// Read-eval-print until the input ends or the user types `exit`/`quit`.
///
/// Evaluation errors and transport failures are printed to `err` and the
/// loop carries on with a fresh statement.
pub fn run_loop<T: ControlTransport>(
    session: &mut ReplSession<'_, T>,
    lines: &mut dyn LineSource,
    out: &mut impl Write,
    err: &mut impl Write,
) -> io::Result<()> {
    let mut pending = String::new();

    loop {
        let Some(line) = lines.read_line(session.prompt())? else {
            break;
        };
        let trimmed = line.trim();
        if is_exit_command(trimmed) {
            break;
        }
        if trimmed.is_empty() {
            continue;
        }

        let source = if session.is_incomplete() {
            format!("{pending}\n{line}")
        } else {
            line
        };

        match session.submit(&source) {
            Ok(ReplOutcome::Incomplete) => {
                debug!("statement incomplete, waiting for more input");
                pending = source;
            }
            Ok(ReplOutcome::Complete {
                return_value,
                output_lines,
            }) => {
                pending.clear();
                render_outcome(&return_value, &output_lines, out)?;
            }
            Ok(ReplOutcome::Failed { message }) => {
                pending.clear();
                writeln!(err, "{}", format!("Error from KOReader: {message}").red())?;
            }
            Err(e) => {
                pending.clear();
                warn!(error = %e, "REPL submission failed");
                writeln!(err, "{}", format!("Error: {e}").red())?;
            }
        }
        out.flush()?;
    }

    writeln!(out, "Exiting REPL.")?;
    Ok(())
}
