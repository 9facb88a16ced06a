//! Progress streams for long-running handlers.
//!
//! A handler spawns its work with a [`StreamWriter`] and returns the body built
//! by [`keepalive_body`]. The body forwards everything the writer sends and
//! emits a filler chunk whenever nothing was written for one interval. When
//! the client goes away the receiver is dropped and `StreamWriter::closed`
//! resolves, which lets the task stop early.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::Response,
};
use bytes::Bytes;
use common::api::{JSON_STREAM_CONTENT_TYPE, StreamFrame};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};

/// Content type of plain-text deploy output.
pub const TEXT_CONTENT_TYPE: &str = "text";

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filler {
    Text,
    Json,
}

impl Filler {
    fn bytes(self) -> Bytes {
        match self {
            Filler::Text => Bytes::from_static(b"please wait...\n"),
            Filler::Json => Bytes::from_static(b"{}\n"),
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Filler::Text => TEXT_CONTENT_TYPE,
            Filler::Json => JSON_STREAM_CONTENT_TYPE,
        }
    }
}

/// Sending half of a progress stream. Writes after the client left are dropped.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    tx: mpsc::Sender<Bytes>,
}

impl StreamWriter {
    pub async fn write(&self, chunk: impl Into<Bytes>) -> bool {
        self.tx.send(chunk.into()).await.is_ok()
    }

    pub async fn line(&self, text: &str) -> bool {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.write(line).await
    }

    pub async fn frame(&self, frame: &StreamFrame) -> bool {
        match serde_json::to_vec(frame) {
            Ok(mut encoded) => {
                encoded.push(b'\n');
                self.write(encoded).await
            }
            Err(err) => {
                tracing::warn!(?err, "failed to encode stream frame");
                false
            }
        }
    }

    pub async fn message(&self, msg: impl Into<String>) -> bool {
        self.frame(&StreamFrame::message(msg)).await
    }

    pub async fn error(&self, msg: impl Into<String>) -> bool {
        self.frame(&StreamFrame::error(msg)).await
    }

    /// Resolves once the response body was dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn channel() -> (StreamWriter, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (StreamWriter { tx }, rx)
}

/// Body that forwards `rx` and fills silent periods of `every` with `filler`.
pub fn keepalive_body(mut rx: mpsc::Receiver<Bytes>, every: Duration, filler: Filler) -> Body {
    let every = every.max(Duration::from_millis(10));
    let stream = async_stream::stream! {
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(chunk) => {
                        ticker.reset();
                        yield Ok::<Bytes, Infallible>(chunk);
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    yield Ok(filler.bytes());
                }
            }
        }
    };
    Body::from_stream(stream)
}

/// 200 response streaming `rx` with keep-alive filler.
pub fn stream_response(rx: mpsc::Receiver<Bytes>, every: Duration, filler: Filler) -> Response {
    let mut response = Response::new(keepalive_body(rx, every, filler));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(filler.content_type()),
    );
    response
}

/// Complete JSON-stream response made of the given frames.
pub fn frames_response(frames: &[StreamFrame]) -> Response {
    let mut body = Vec::new();
    for frame in frames {
        if let Ok(encoded) = serde_json::to_vec(frame) {
            body.extend_from_slice(&encoded);
            body.push(b'\n');
        }
    }
    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(JSON_STREAM_CONTENT_TYPE),
    );
    response
}
