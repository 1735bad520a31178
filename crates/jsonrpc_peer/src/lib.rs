#![forbid(unsafe_code)]
//! Bidirectional JSON-RPC 2.0 peer with header-delimited framing, request
//! cancellation, and out-of-band progress.
//!
//! Either end of a connection may initiate requests and notifications, both
//! ends can cancel in-flight requests (inline `$/cancelRequest` or a
//! shared-memory fast path), and long-running operations report progress
//! through `$/progress` multiplexed by token. The engine is payload-agnostic:
//! params and results are [`serde_json::Value`]s; schema validation belongs
//! to the layer above.
//!
//! Messages travel as `Content-Length`-framed JSON bodies on any
//! [`tokio::io::AsyncRead`]/[`tokio::io::AsyncWrite`] pair, so process
//! pipes, TCP sockets, and in-memory duplex streams all work unchanged. The
//! content-type codec and optional content encodings are injected through
//! [`Runtime`].
//!
//! ```rust,no_run
//! use jsonrpc_peer::{Connection, Runtime};
//! use serde_json::{json, Value};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//! let (client_read, client_write) = tokio::io::split(client_io);
//! let (server_read, server_write) = tokio::io::split(server_io);
//!
//! let client = Connection::new(client_read, client_write, Runtime::new());
//! let server = Connection::new(server_read, server_write, Runtime::new());
//!
//! server.on_request("echo", |args, _token| async move {
//!     Ok(args.first().unwrap_or(Value::Null))
//! });
//! server.listen()?;
//! client.listen()?;
//!
//! let reply = client.send_request("echo", vec![json!("ping")]).await?;
//! assert_eq!(reply, json!("ping"));
//! # Ok(()) }
//! ```
//!
//! Ordering guarantees: outbound frames reach the transport in `send_*` call
//! order and are never interleaved; inbound messages dispatch in arrival
//! order, one per scheduler tick; responses go out in handler resolution
//! order.

mod cancellation;
mod codec;
mod connection;
mod message;
mod reader;
mod runtime;
mod shared_cell;
mod trace;
mod writer;

pub use cancellation::{
    CancellationReceiverStrategy, CancellationSenderStrategy, CancellationSource,
    CancellationStrategy, CancellationToken, MessageReceiverStrategy, MessageSenderStrategy,
};
pub use codec::{
    accept_encoding_value, content_type_matches, header_value, write_frame_headers, CodecError,
    ContentEncoding, ContentTypeCodec, FramingBuffer, FramingError, JsonContentCodec,
    CONTENT_ENCODING_HEADER, CONTENT_LENGTH_HEADER, CONTENT_TYPE_HEADER, DEFAULT_CONTENT_TYPE,
};
pub use connection::{
    CancelUndispatchedHook, Connection, ConnectionError, ConnectionFault, ConnectionOptions,
    ErrorEvent, HandlerError, HandlerOutcome, Registration, SendError,
};
pub use message::{
    error_codes, Arguments, CancelParams, MalformedMessage, Message, MethodType,
    NotificationMessage, ParameterStructures, Params, ProgressParams, ProgressToken, RequestId,
    RequestMessage, ResponseError, ResponseMessage, JSONRPC_VERSION, METHOD_CANCEL_REQUEST,
    METHOD_LOG_TRACE, METHOD_PROGRESS, METHOD_SET_TRACE,
};
pub use reader::{
    AlreadyListening, MessageReader, PartialMessageInfo, ReadError, ReaderEvent, ReaderOptions,
};
pub use runtime::Runtime;
pub use shared_cell::{
    shared_cell_strategy, SharedCancellationCells, SharedCellReceiverStrategy,
    SharedCellSenderStrategy,
};
pub use trace::{LogTraceParams, SetTraceParams, TraceFormat, TraceLevel, TraceOptions, Tracer};
pub use writer::{MessageWriter, WriteError};

#[cfg(test)]
mod tests;
