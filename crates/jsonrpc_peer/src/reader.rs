use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::codec::{
    content_type_matches, header_value, CodecError, FramingBuffer, FramingError,
    CONTENT_ENCODING_HEADER, CONTENT_LENGTH_HEADER, CONTENT_TYPE_HEADER,
};
use crate::message::Message;
use crate::runtime::Runtime;

const READ_CHUNK: usize = 8192;

/// Errors that end the read loop; the stream is not resynchronised.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("transport read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    #[error("unsupported content type {0:?}")]
    UnsupportedContentType(String),
    #[error("unknown content encoding {0:?}")]
    UnknownContentEncoding(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// The callback was already installed.
#[derive(Debug, Error)]
#[error("reader is already listening")]
pub struct AlreadyListening;

/// Advisory notice that a message body is overdue.
#[derive(Clone, Copy, Debug)]
pub struct PartialMessageInfo {
    /// Ordinal of the message whose headers were parsed.
    pub message_token: u64,
    /// Total time spent waiting for the body so far.
    pub waiting_time: Duration,
}

/// Events published by the read loop to its single subscriber.
#[derive(Debug)]
pub enum ReaderEvent {
    Message(Message),
    /// Fires repeatedly while a parsed header block waits for its body;
    /// never aborts the stream.
    Partial(PartialMessageInfo),
    Error(ReadError),
    Closed,
}

/// Knobs for [`MessageReader`].
#[derive(Clone, Copy, Debug)]
pub struct ReaderOptions {
    /// Watchdog interval between header parse and body arrival; zero
    /// disables the watchdog.
    pub partial_message_timeout: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            partial_message_timeout: Duration::from_secs(10),
        }
    }
}

/// Drives the framing codec against a byte stream.
///
/// The loop alternates between awaiting a header block and awaiting the body
/// length the block announced. Decoded messages, advisory partial-message
/// notices, errors, and the close signal all flow through the one callback
/// installed by [`MessageReader::listen`].
pub struct MessageReader<R> {
    stream: Option<R>,
    runtime: Runtime,
    options: ReaderOptions,
    task: Option<JoinHandle<()>>,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(stream: R, runtime: Runtime) -> Self {
        Self::with_options(stream, runtime, ReaderOptions::default())
    }

    pub fn with_options(stream: R, runtime: Runtime, options: ReaderOptions) -> Self {
        Self {
            stream: Some(stream),
            runtime,
            options,
            task: None,
        }
    }

    /// Installs the single event callback and starts the read loop.
    ///
    /// Fails if a callback was installed before, even after [`dispose`].
    ///
    /// [`dispose`]: MessageReader::dispose
    pub fn listen(
        &mut self,
        callback: impl FnMut(ReaderEvent) + Send + 'static,
    ) -> Result<(), AlreadyListening> {
        let Some(stream) = self.stream.take() else {
            return Err(AlreadyListening);
        };
        let runtime = self.runtime.clone();
        let options = self.options;
        self.task = Some(tokio::spawn(read_loop(stream, runtime, options, callback)));
        Ok(())
    }

    /// Stops the loop. The underlying stream is dropped with the task; the
    /// reader never shuts the transport down itself.
    pub fn dispose(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<R> Drop for MessageReader<R> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn read_loop<R, F>(mut stream: R, runtime: Runtime, options: ReaderOptions, mut callback: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(ReaderEvent),
{
    let mut buffer = FramingBuffer::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut next_token: u64 = 0;

    loop {
        // Awaiting headers.
        let headers = loop {
            match buffer.try_read_headers() {
                Ok(Some(headers)) => break headers,
                Ok(None) => match stream.read(&mut chunk).await {
                    Ok(0) => {
                        callback(ReaderEvent::Closed);
                        return;
                    }
                    Ok(n) => buffer.append(&chunk[..n]),
                    Err(err) => {
                        callback(ReaderEvent::Error(err.into()));
                        return;
                    }
                },
                Err(err) => {
                    callback(ReaderEvent::Error(err.into()));
                    return;
                }
            }
        };

        let Some(raw_length) = header_value(&headers, CONTENT_LENGTH_HEADER) else {
            callback(ReaderEvent::Error(ReadError::MissingContentLength));
            return;
        };
        let length: usize = match raw_length.parse() {
            Ok(length) => length,
            Err(_) => {
                callback(ReaderEvent::Error(ReadError::InvalidContentLength(
                    raw_length.to_string(),
                )));
                return;
            }
        };

        if let Some(content_type) = header_value(&headers, CONTENT_TYPE_HEADER) {
            if !content_type_matches(content_type, runtime.content_codec().content_type()) {
                callback(ReaderEvent::Error(ReadError::UnsupportedContentType(
                    content_type.to_string(),
                )));
                return;
            }
        }

        let decoder = match header_value(&headers, CONTENT_ENCODING_HEADER) {
            Some(name) => match runtime.encoding(name) {
                Some(encoding) => Some(encoding.clone()),
                None => {
                    callback(ReaderEvent::Error(ReadError::UnknownContentEncoding(
                        name.to_string(),
                    )));
                    return;
                }
            },
            None => None,
        };

        // Awaiting the body; `length` is fixed until it is consumed.
        let message_token = next_token;
        next_token += 1;
        let started = Instant::now();
        let body = loop {
            if let Some(body) = buffer.try_read_body(length) {
                break body;
            }
            let read = if options.partial_message_timeout.is_zero() {
                stream.read(&mut chunk).await
            } else {
                match timeout(options.partial_message_timeout, stream.read(&mut chunk)).await {
                    Ok(read) => read,
                    Err(_) => {
                        callback(ReaderEvent::Partial(PartialMessageInfo {
                            message_token,
                            waiting_time: started.elapsed(),
                        }));
                        continue;
                    }
                }
            };
            match read {
                Ok(0) => {
                    callback(ReaderEvent::Closed);
                    return;
                }
                Ok(n) => buffer.append(&chunk[..n]),
                Err(err) => {
                    callback(ReaderEvent::Error(err.into()));
                    return;
                }
            }
        };

        // Inbound pipeline: bytes -> content decoder -> content-type codec.
        let body = match &decoder {
            Some(decoder) => match decoder.decode(body) {
                Ok(body) => body,
                Err(err) => {
                    callback(ReaderEvent::Error(err.into()));
                    return;
                }
            },
            None => body,
        };
        match runtime.content_codec().decode(&body) {
            Ok(message) => callback(ReaderEvent::Message(message)),
            Err(err) => {
                callback(ReaderEvent::Error(err.into()));
                return;
            }
        }
    }
}
