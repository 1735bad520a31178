use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::{Connection, ConnectionOptions, Runtime};

/// Two connections joined by an in-memory duplex stream.
pub(super) fn pair() -> (Connection, Connection) {
    let (left_io, right_io) = tokio::io::duplex(64 * 1024);
    let (left_read, left_write) = tokio::io::split(left_io);
    let (right_read, right_write) = tokio::io::split(right_io);
    (
        Connection::new(left_read, left_write, Runtime::new()),
        Connection::new(right_read, right_write, Runtime::new()),
    )
}

pub(super) fn listening_pair() -> (Connection, Connection) {
    let (left, right) = pair();
    left.listen().expect("listen left");
    right.listen().expect("listen right");
    (left, right)
}

/// A connection whose peer end is driven by hand with raw frames.
pub(super) fn raw_peer() -> (Connection, DuplexStream) {
    raw_peer_with_options(ConnectionOptions::default())
}

pub(super) fn raw_peer_with_options(options: ConnectionOptions) -> (Connection, DuplexStream) {
    let (io, raw) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(io);
    (
        Connection::with_options(read, write, Runtime::new(), options),
        raw,
    )
}

pub(super) async fn write_frame(stream: &mut DuplexStream, body: &str) {
    let frame = format!("Content-Length: {}\r\n\r\n{body}", body.len());
    stream
        .write_all(frame.as_bytes())
        .await
        .expect("write frame");
}

pub(super) async fn read_frame(stream: &mut DuplexStream) -> Value {
    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.expect("read header byte");
        assert!(n > 0, "stream closed while reading headers");
        header.push(byte[0]);
    }
    let header = String::from_utf8(header).expect("ascii header block");
    let length: usize = header
        .split("\r\n")
        .find_map(|line| line.strip_prefix("Content-Length:"))
        .map(|value| value.trim().parse().expect("numeric length"))
        .expect("Content-Length header");

    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.expect("read body");
    serde_json::from_slice(&body).expect("json body")
}

/// Guards awaited futures so a broken dispatch loop fails fast.
pub(super) async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
