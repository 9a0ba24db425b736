//! HTTP control channel client.
//!
//! The device runs the KOReader HTTP inspector plugin, which exposes the
//! running application's UI modules as URL paths under `/koreader/`. Every
//! call is a single blocking `GET`; there are no retries, and the first
//! network failure is handed straight back to the caller.
//!
//! The actual HTTP client sits behind [`ControlTransport`] so the bootstrap,
//! REPL and version-gate state machines can be driven by a scripted
//! transport in tests.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::DeviceEndpoint;

/// Fixed timeout for control channel requests.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Substring the inspector returns when a requested field does not exist.
pub const NO_SUCH_KEY_SENTINEL: &str = "no such key";

/// Control channel paths, relative to the inspector base URL.
pub mod endpoints {
    pub const SSH_STOP: &str = "ui/SSH/stop/";
    pub const SSH_START: &str = "ui/SSH/start/";
    pub const SSH_PORT: &str = "ui/SSH/SSH_port";
    pub const SSH_ALLOW_NO_PASSWORD: &str = "ui/SSH/allow_no_password";
    pub const SSH_SET_ALLOW_NO_PASSWORD: &str = "ui/SSH/setAllowNoPassword/";
    pub const RESTART: &str = "broadcast/Restart";
    pub const REPL_EVAL: &str = "ui/Repl/repl/";
    pub const REPL_CLEAN: &str = "ui/Repl/clean/";
}

/// Errors raised by the control channel.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("device unreachable at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("control channel returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("control channel request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected response from {path}: {body}")]
    Unexpected { path: String, body: String },
}

/// A raw request/response channel to the device.
pub trait ControlTransport {
    /// Issue `GET <base>/<path>` and return the raw body.
    fn get(&self, path: &str) -> Result<Vec<u8>, ControlError>;
}

/// Blocking HTTP implementation of [`ControlTransport`].
pub struct HttpTransport {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(endpoint: &DeviceEndpoint, timeout: Duration) -> Result<Self, ControlError> {
        let base_url = endpoint.base_url();
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("kopl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|source| ControlError::Request {
                url: base_url.clone(),
                source,
            })?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl ControlTransport for HttpTransport {
    fn get(&self, path: &str) -> Result<Vec<u8>, ControlError> {
        let url = self.url_for(path);
        debug!(url = %url, "control request");

        let response = self.client.get(&url).send().map_err(|source| {
            if source.is_connect() || source.is_timeout() {
                ControlError::Unreachable {
                    url: url.clone(),
                    source,
                }
            } else {
                ControlError::Request {
                    url: url.clone(),
                    source,
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ControlError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .map_err(|source| ControlError::Request { url, source })?;
        Ok(body.to_vec())
    }
}

/// Semantic operations on top of a [`ControlTransport`].
pub struct RemoteControlClient<T: ControlTransport = HttpTransport> {
    transport: T,
}

impl RemoteControlClient<HttpTransport> {
    /// Build a client talking HTTP to `endpoint`.
    pub fn connect(endpoint: &DeviceEndpoint, timeout: Duration) -> Result<Self, ControlError> {
        Ok(Self::new(HttpTransport::new(endpoint, timeout)?))
    }
}

impl<T: ControlTransport> RemoteControlClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Raw access to the channel.
    pub fn get(&self, path: &str) -> Result<Vec<u8>, ControlError> {
        self.transport.get(path)
    }

    /// Stop the device's SSH daemon. Stopping an already stopped daemon is fine.
    pub fn stop_shell_daemon(&self) -> Result<(), ControlError> {
        self.get(endpoints::SSH_STOP).map(drop)
    }

    /// Start the SSH daemon and return the port the device bound it to.
    ///
    /// Zero means the device did not report a usable port.
    pub fn start_shell_daemon(&self) -> Result<u16, ControlError> {
        self.get(endpoints::SSH_START)?;
        let body = self.get(endpoints::SSH_PORT)?;
        decode_port(&body).ok_or_else(|| unexpected(endpoints::SSH_PORT, &body))
    }

    pub fn passwordless_allowed(&self) -> Result<bool, ControlError> {
        let body = self.get(endpoints::SSH_ALLOW_NO_PASSWORD)?;
        decode_bool(&body).ok_or_else(|| unexpected(endpoints::SSH_ALLOW_NO_PASSWORD, &body))
    }

    pub fn set_passwordless(&self, allow: bool) -> Result<(), ControlError> {
        let path = format!("{}{}", endpoints::SSH_SET_ALLOW_NO_PASSWORD, allow);
        self.get(&path).map(drop)
    }

    pub fn restart_application(&self) -> Result<(), ControlError> {
        self.get(endpoints::RESTART).map(drop)
    }

    /// Submit one base64-encoded REPL fragment and return the undecoded body.
    pub fn submit_repl_fragment(&self, payload: &str) -> Result<Vec<u8>, ControlError> {
        self.get(&format!("{}{}", endpoints::REPL_EVAL, payload))
    }

    /// Drop any half-entered statement held by the remote REPL.
    pub fn reset_repl(&self) -> Result<(), ControlError> {
        self.get(endpoints::REPL_CLEAN).map(drop)
    }

    /// Read a field of a UI module, returning `None` when the key does not exist.
    pub fn plugin_field(&self, module: &str, field: &str) -> Result<Option<String>, ControlError> {
        let body = self.get(&format!("ui/{module}/{field}"))?;
        Ok(decode_field(&body))
    }
}

fn unexpected(path: &str, body: &[u8]) -> ControlError {
    ControlError::Unexpected {
        path: path.to_string(),
        body: String::from_utf8_lossy(body).into_owned(),
    }
}

/// Unwrap the single-element array the inspector uses for method results.
fn scalar(body: &[u8]) -> Option<Value> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Array(mut items)) if items.len() == 1 => items.pop(),
        Ok(value) => Some(value),
        Err(_) => std::str::from_utf8(body)
            .ok()
            .map(|s| Value::String(s.trim().to_string())),
    }
}

pub(crate) fn decode_port(body: &[u8]) -> Option<u16> {
    match scalar(body)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as u64))
            .and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => match s.trim() {
            "" | "nil" => Some(0),
            text => text.parse().ok(),
        },
        Value::Null => Some(0),
        _ => None,
    }
}

pub(crate) fn decode_bool(body: &[u8]) -> Option<bool> {
    match scalar(body)? {
        Value::Bool(b) => Some(b),
        Value::Null => Some(false),
        Value::String(s) => match s.trim() {
            "true" => Some(true),
            "false" | "nil" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Decode a text field; `None` marks a missing key.
pub(crate) fn decode_field(body: &[u8]) -> Option<String> {
    let text = match scalar(body)? {
        Value::Null => return None,
        Value::String(s) => s,
        other => other.to_string(),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() || is_no_such_key(trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn is_no_such_key(text: &str) -> bool {
    text.to_ascii_lowercase().contains(NO_SUCH_KEY_SENTINEL)
}
