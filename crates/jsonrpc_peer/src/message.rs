use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::error;

/// Version string stamped on every emitted envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Notification cancelling an in-flight request.
pub const METHOD_CANCEL_REQUEST: &str = "$/cancelRequest";
/// Notification carrying an out-of-band progress update for a token.
pub const METHOD_PROGRESS: &str = "$/progress";
/// Notification asking the peer to change its trace level.
pub const METHOD_SET_TRACE: &str = "$/setTrace";
/// Notification carrying peer trace output.
pub const METHOD_LOG_TRACE: &str = "$/logTrace";

/// JSON-RPC reserved error codes plus the engine-defined ones.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The payload is not a valid request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// No handler is registered for the method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// The params do not match the declared parameter structure.
    pub const INVALID_PARAMS: i32 = -32602;
    /// A handler failed without supplying its own response error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// The request envelope could not be written to the transport.
    pub const MESSAGE_WRITE_ERROR: i32 = -32099;
    /// The pending response was rejected because the connection went away.
    pub const PENDING_RESPONSE_REJECTED: i32 = -32097;
    /// The caller cancelled the request.
    pub const REQUEST_CANCELLED: i32 = -32800;
    /// The receiving side cancelled the request.
    pub const SERVER_CANCELLED: i32 = -32802;
}

/// Identifier correlating a request with its response; integer or string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Debug for strings keeps `92` and `"92"` distinguishable.
            RequestId::Number(id) => fmt::Display::fmt(id, f),
            RequestId::String(id) => fmt::Debug::fmt(id, f),
        }
    }
}

/// Opaque token correlating `$/progress` notifications with a request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    Number(i64),
    String(String),
}

impl From<i64> for ProgressToken {
    fn from(token: i64) -> Self {
        ProgressToken::Number(token)
    }
}

impl From<&str> for ProgressToken {
    fn from(token: &str) -> Self {
        ProgressToken::String(token.to_string())
    }
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressToken::Number(token) => fmt::Display::fmt(token, f),
            ProgressToken::String(token) => fmt::Debug::fmt(token, f),
        }
    }
}

/// Wire form of request/notification parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Array(Vec<Value>),
    Object(Map<String, Value>),
}

impl Params {
    pub fn into_value(self) -> Value {
        match self {
            Params::Array(values) => Value::Array(values),
            Params::Object(map) => Value::Object(map),
        }
    }

    /// Accepts only the two shapes JSON-RPC allows; `null` counts as absent.
    fn from_value(value: Value) -> Option<Params> {
        match value {
            Value::Array(values) => Some(Params::Array(values)),
            Value::Object(map) => Some(Params::Object(map)),
            _ => None,
        }
    }
}

/// Error payload carried by a failed response.
///
/// Implements [`std::error::Error`] so handler code can bubble one up with `?`
/// and have the engine forward it verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Error)]
#[error("jsonrpc error {code}: {message}")]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i32, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    pub(crate) fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Unhandled method {method}"),
        )
    }
}

/// A call that expects a response correlated by id.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestMessage {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Params>,
}

/// Reply to a request; exactly one of result or error goes on the wire.
///
/// A void success is represented as `Ok(Value::Null)` and serialised as
/// `"result": null`. An id of `None` marks a parse-level failure that cannot
/// be correlated.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseMessage {
    pub id: Option<RequestId>,
    pub outcome: Result<Value, ResponseError>,
}

/// A one-way call with no response.
#[derive(Clone, Debug, PartialEq)]
pub struct NotificationMessage {
    pub method: String,
    pub params: Option<Params>,
}

/// Envelope that lacks the required JSON-RPC discriminants.
#[derive(Clone, Debug, PartialEq)]
pub struct MalformedMessage {
    /// Recoverable id, used to reject a matching pending response.
    pub id: Option<RequestId>,
    pub raw: Value,
}

/// Discriminated JSON-RPC envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Request(RequestMessage),
    Response(ResponseMessage),
    Notification(NotificationMessage),
    Malformed(MalformedMessage),
}

impl Message {
    /// Discriminates a decoded JSON value into an envelope variant.
    ///
    /// A `method` plus a string or integer `id` wins over everything else, a
    /// bare `method` is a notification, and an `id` (including `null`) with a
    /// `result` or `error` member is a response. Anything else is malformed.
    pub fn from_value(value: Value) -> Message {
        let Value::Object(ref fields) = value else {
            return Message::Malformed(MalformedMessage { id: None, raw: value });
        };

        let method = fields.get("method").and_then(Value::as_str).map(str::to_string);
        let has_id = fields.contains_key("id");
        let id = fields.get("id").and_then(parse_request_id);
        let params = fields.get("params").cloned().and_then(Params::from_value);

        match (method, id) {
            (Some(method), Some(id)) => Message::Request(RequestMessage { id, method, params }),
            (Some(method), None) if !has_id => {
                Message::Notification(NotificationMessage { method, params })
            }
            // `method` with `id: null` lands here and is checked as a
            // response.
            (_, id) => {
                if has_id {
                    if let Some(error) = fields.get("error") {
                        if let Ok(error) = serde_json::from_value::<ResponseError>(error.clone()) {
                            return Message::Response(ResponseMessage {
                                id,
                                outcome: Err(error),
                            });
                        }
                    } else if let Some(result) = fields.get("result") {
                        return Message::Response(ResponseMessage {
                            id,
                            outcome: Ok(result.clone()),
                        });
                    }
                }
                Message::Malformed(MalformedMessage { id, raw: value })
            }
        }
    }

    /// Builds the wire value, stamping `jsonrpc: "2.0"`.
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request(request) => {
                let mut value = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": request.id,
                    "method": request.method,
                });
                if let Some(params) = &request.params {
                    value["params"] = params.clone().into_value();
                }
                value
            }
            Message::Notification(notification) => {
                let mut value = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "method": notification.method,
                });
                if let Some(params) = &notification.params {
                    value["params"] = params.clone().into_value();
                }
                value
            }
            Message::Response(response) => {
                let id = match &response.id {
                    Some(id) => json!(id),
                    None => Value::Null,
                };
                match &response.outcome {
                    Ok(result) => json!({
                        "jsonrpc": JSONRPC_VERSION,
                        "id": id,
                        "result": result,
                    }),
                    Err(error) => json!({
                        "jsonrpc": JSONRPC_VERSION,
                        "id": id,
                        "error": error,
                    }),
                }
            }
            Message::Malformed(malformed) => malformed.raw.clone(),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            _ => None,
        }
    }
}

/// `None` for an explicit `null` or any other non-id shape.
fn parse_request_id(value: &Value) -> Option<RequestId> {
    match value {
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        Value::String(s) => Some(RequestId::String(s.clone())),
        _ => None,
    }
}

/// How caller-side arguments map onto wire `params`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParameterStructures {
    /// A single object argument goes by name, anything else by position.
    #[default]
    Auto,
    ByPosition,
    ByName,
}

/// Declared calling convention of a method, shared by requests and
/// notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodType {
    pub method: String,
    pub parameter_structures: ParameterStructures,
    pub number_of_params: usize,
}

impl MethodType {
    pub fn new(
        method: impl Into<String>,
        parameter_structures: ParameterStructures,
        number_of_params: usize,
    ) -> Self {
        Self {
            method: method.into(),
            parameter_structures,
            number_of_params,
        }
    }

    /// Converts caller-side arguments into wire `params`.
    ///
    /// Zero declared params omit the field entirely. A single param follows
    /// the declared structure (a lone named object is sent unwrapped). More
    /// than one param is always positional, padded with `null` up to the
    /// declared count; surplus arguments are dropped.
    pub fn encode_args(&self, args: Vec<Value>) -> Result<Option<Params>, ResponseError> {
        match self.number_of_params {
            0 => Ok(None),
            1 => {
                let first = args.into_iter().next().unwrap_or(Value::Null);
                match self.parameter_structures {
                    ParameterStructures::Auto => match first {
                        Value::Object(map) => Ok(Some(Params::Object(map))),
                        other => Ok(Some(Params::Array(vec![other]))),
                    },
                    ParameterStructures::ByName => match first {
                        Value::Object(map) => Ok(Some(Params::Object(map))),
                        _ => Err(ResponseError::new(
                            error_codes::INVALID_PARAMS,
                            format!(
                                "method {} declares named parameters but the argument is not an object",
                                self.method
                            ),
                        )),
                    },
                    ParameterStructures::ByPosition => Ok(Some(Params::Array(vec![first]))),
                }
            }
            count => {
                let mut values = args;
                values.resize(count, Value::Null);
                values.truncate(count);
                Ok(Some(Params::Array(values)))
            }
        }
    }

    /// Matches inbound `params` against the declared structure.
    ///
    /// In strict mode (requests) a shape mismatch is an `InvalidParams`
    /// error. In non-strict mode (notifications) the mismatch is logged and
    /// the handler still runs with the wire shape as-is.
    pub fn convert_params(
        &self,
        params: Option<Params>,
        strict: bool,
    ) -> Result<Arguments, ResponseError> {
        let Some(params) = params else {
            return Ok(Arguments::None);
        };
        if self.number_of_params == 0 {
            error!(method = %self.method, "params received for a method declaring none");
            return Ok(Arguments::None);
        }
        match params {
            Params::Array(values) => {
                if self.parameter_structures == ParameterStructures::ByName {
                    let detail = format!(
                        "method {} declares named parameters but received positional ones",
                        self.method
                    );
                    if strict {
                        return Err(ResponseError::new(error_codes::INVALID_PARAMS, detail));
                    }
                    error!("{detail}");
                }
                Ok(Arguments::Positional(values))
            }
            Params::Object(map) => {
                if self.parameter_structures == ParameterStructures::ByPosition {
                    let detail = format!(
                        "method {} declares positional parameters but received named ones",
                        self.method
                    );
                    if strict {
                        return Err(ResponseError::new(error_codes::INVALID_PARAMS, detail));
                    }
                    error!("{detail}");
                }
                Ok(Arguments::Named(map))
            }
        }
    }
}

impl From<&str> for MethodType {
    /// Bare method names get the auto structure with a single params slot.
    fn from(method: &str) -> Self {
        MethodType::new(method, ParameterStructures::Auto, 1)
    }
}

impl From<String> for MethodType {
    fn from(method: String) -> Self {
        MethodType::new(method, ParameterStructures::Auto, 1)
    }
}

/// Converted caller-side view of inbound `params`.
#[derive(Clone, Debug, PartialEq)]
pub enum Arguments {
    None,
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Arguments {
    /// Wire shape without validation, as seen by star handlers.
    pub fn from_params(params: Option<Params>) -> Arguments {
        match params {
            None => Arguments::None,
            Some(Params::Array(values)) => Arguments::Positional(values),
            Some(Params::Object(map)) => Arguments::Named(map),
        }
    }

    /// First positional argument, or the whole named object.
    pub fn first(&self) -> Option<Value> {
        match self {
            Arguments::None => None,
            Arguments::Positional(values) => values.first().cloned(),
            Arguments::Named(map) => Some(Value::Object(map.clone())),
        }
    }

    pub fn positional(&self) -> Option<&[Value]> {
        match self {
            Arguments::Positional(values) => Some(values),
            _ => None,
        }
    }

    pub fn named(&self) -> Option<&Map<String, Value>> {
        match self {
            Arguments::Named(map) => Some(map),
            _ => None,
        }
    }
}

/// Params of `$/cancelRequest`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: RequestId,
}

/// Params of `$/progress`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressParams {
    pub token: ProgressToken,
    pub value: Value,
}
