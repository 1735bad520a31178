use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Verbosity of the trace hook.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    #[default]
    Off,
    Messages,
    Compact,
    Verbose,
}

impl TraceLevel {
    /// Whether params/results accompany the trace line at this level.
    pub fn includes_payloads(self) -> bool {
        matches!(self, TraceLevel::Compact | TraceLevel::Verbose)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            TraceLevel::Off => 0,
            TraceLevel::Messages => 1,
            TraceLevel::Compact => 2,
            TraceLevel::Verbose => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => TraceLevel::Messages,
            2 => TraceLevel::Compact,
            3 => TraceLevel::Verbose,
            _ => TraceLevel::Off,
        }
    }
}

impl FromStr for TraceLevel {
    type Err = std::convert::Infallible;

    /// Unknown values fall back to `Off`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "messages" => TraceLevel::Messages,
            "compact" => TraceLevel::Compact,
            "verbose" => TraceLevel::Verbose,
            _ => TraceLevel::Off,
        })
    }
}

impl fmt::Display for TraceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceLevel::Off => "off",
            TraceLevel::Messages => "messages",
            TraceLevel::Compact => "compact",
            TraceLevel::Verbose => "verbose",
        };
        f.write_str(name)
    }
}

/// Output encoding handed to the tracer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TraceFormat {
    #[default]
    Text,
    Json,
}

/// Sink for engine trace output.
pub trait Tracer: Send + Sync {
    /// One trace line; `data` carries serialized payloads when the level
    /// includes them.
    fn log(&self, message: &str, data: Option<&str>);

    /// Peer trace output received through `$/logTrace`.
    fn log_trace(&self, message: &str, verbose: Option<&str>) {
        self.log(message, verbose);
    }
}

/// Params of `$/setTrace`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetTraceParams {
    pub value: TraceLevel,
}

/// Params of `$/logTrace`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogTraceParams {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose: Option<String>,
}

/// Options accepted by [`crate::Connection::trace`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceOptions {
    /// Announce the change to the peer through `$/setTrace`.
    pub send_notification: bool,
    pub format: TraceFormat,
}

/// Serialises a payload for a trace line: dense for `compact`, pretty for
/// `verbose`, absent otherwise.
pub(crate) fn format_payload(level: TraceLevel, payload: &Value) -> Option<String> {
    match level {
        TraceLevel::Compact => serde_json::to_string(payload).ok(),
        TraceLevel::Verbose => serde_json::to_string_pretty(payload).ok(),
        _ => None,
    }
}
