use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::codec::{write_frame_headers, CodecError, DEFAULT_CONTENT_TYPE};
use crate::message::Message;
use crate::runtime::Runtime;

/// Errors surfaced per attempted write.
#[derive(Debug, Error)]
pub enum WriteError {
    /// `count` is the writer's running failure total, so callers can back
    /// off.
    #[error("transport write failed (failure #{count}): {source}")]
    Io {
        #[source]
        source: std::io::Error,
        count: u32,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("writer is closed")]
    Closed,
}

/// Serialises whole frames onto the write half of a stream.
///
/// A single-slot async lock is held for the full header+body sequence, so
/// the byte ranges of two messages are never interleaved regardless of how
/// many tasks write concurrently.
pub struct MessageWriter<W> {
    stream: Mutex<Option<W>>,
    runtime: Runtime,
    error_count: AtomicU32,
}

impl<W> MessageWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(stream: W, runtime: Runtime) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            runtime,
            error_count: AtomicU32::new(0),
        }
    }

    /// Encodes and writes one message; completes when the transport has
    /// accepted the whole frame.
    ///
    /// Outbound pipeline: content-type codec -> content encoder -> framed
    /// headers + body.
    pub async fn write(&self, message: &Message) -> Result<(), WriteError> {
        let body = self.runtime.content_codec().encode(message)?;
        let (body, encoding_name) = match self.runtime.outbound_encoding() {
            Some(encoding) => (encoding.encode(body)?, Some(encoding.name().to_string())),
            None => (body, None),
        };

        let content_type = self.runtime.content_codec().content_type();
        let announced_type = (content_type != DEFAULT_CONTENT_TYPE).then_some(content_type);

        let mut frame = Vec::with_capacity(body.len() + 64);
        write_frame_headers(&mut frame, body.len(), announced_type, encoding_name.as_deref());
        frame.extend_from_slice(&body);

        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(WriteError::Closed);
        };
        let written = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        }
        .await;
        written.map_err(|source| {
            let count = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
            WriteError::Io { source, count }
        })
    }

    /// Number of failed writes so far.
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Shuts down the write half; subsequent writes fail with
    /// [`WriteError::Closed`].
    pub async fn end(&self) -> Result<(), std::io::Error> {
        let mut guard = self.stream.lock().await;
        match guard.take() {
            Some(mut stream) => stream.shutdown().await,
            None => Ok(()),
        }
    }
}
