//! Newline-delimited JSON-RPC over a byte stream pair
//!
//! The read loop only frames and parses; every message is dispatched on its
//! own task, and each task writes its own response line when it finishes.
//! Responses are therefore written in completion order, not input order.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{Dispatch, PendingRequests};
use crate::error::rpc_codes;
use crate::protocol::{IncomingMessage, JsonRpcResponse, RequestId};
use crate::{Error, Result};

/// Bytes reserved per read
const READ_CHUNK: usize = 8 * 1024;

type SharedWriter<W> = Arc<Mutex<W>>;

/// One unit produced by the framer
#[derive(Debug, PartialEq)]
enum Frame {
    /// A complete line, terminator included
    Line(Bytes),
    /// A line longer than the limit was dropped
    TooLarge,
}

/// Splits the input stream on `\n`, keeping the trailing partial line
#[derive(Debug)]
struct LineFramer {
    buf: BytesMut,
    /// Prefix of `buf` already known to hold no newline
    scanned: usize,
    /// Dropping the rest of an oversized line
    discarding: bool,
    max_line_bytes: usize,
}

impl LineFramer {
    fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            scanned: 0,
            discarding: false,
            max_line_bytes,
        }
    }

    fn buffer_mut(&mut self) -> &mut BytesMut {
        self.buf.reserve(READ_CHUNK);
        &mut self.buf
    }

    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') else {
                if self.discarding {
                    self.buf.clear();
                    self.scanned = 0;
                } else if self.buf.len() > self.max_line_bytes {
                    self.buf.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    return Some(Frame::TooLarge);
                } else {
                    self.scanned = self.buf.len();
                }
                return None;
            };

            let end = self.scanned + offset;
            let line = self.buf.split_to(end + 1);
            self.scanned = 0;

            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if end > self.max_line_bytes {
                return Some(Frame::TooLarge);
            }
            return Some(Frame::Line(line.freeze()));
        }
    }

    /// Trailing unterminated line at end of input
    fn finish(&mut self) -> Option<Frame> {
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) || self.buf.is_empty() {
            self.buf.clear();
            return None;
        }
        Some(Frame::Line(self.buf.split().freeze()))
    }
}

/// Bridges a line-oriented client to a [`Dispatch`] implementation
pub struct LineBridge<D> {
    dispatcher: Arc<D>,
    pending: Arc<PendingRequests>,
    max_line_bytes: usize,
}

impl<D: Dispatch> LineBridge<D> {
    /// Create a bridge
    pub fn new(dispatcher: Arc<D>, pending: Arc<PendingRequests>, max_line_bytes: usize) -> Self {
        Self {
            dispatcher,
            pending,
            max_line_bytes,
        }
    }

    /// Serve until `reader` reaches end of input and every dispatched
    /// message has been answered
    ///
    /// # Errors
    ///
    /// Returns an error if reading the input fails.
    pub async fn run<R, W>(&self, mut reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer: SharedWriter<W> = Arc::new(Mutex::new(writer));
        let mut framer = LineFramer::new(self.max_line_bytes);

        loop {
            let n = reader
                .read_buf(framer.buffer_mut())
                .await
                .map_err(|e| Error::Transport(format!("Failed to read input: {e}")))?;
            if n == 0 {
                break;
            }

            while let Some(frame) = framer.next_frame() {
                self.handle_frame(frame, &writer).await;
            }
        }

        if let Some(frame) = framer.finish() {
            self.handle_frame(frame, &writer).await;
        }

        let outstanding = self.pending.len();
        if outstanding > 0 {
            info!(outstanding, "End of input, waiting for pending requests");
            for (id, age) in self.pending.outstanding() {
                debug!(id = %id, age_ms = age.as_millis(), "Pending");
            }
        }
        self.pending.wait_drained().await;
        info!("All requests answered");

        Ok(())
    }

    async fn handle_frame<W>(&self, frame: Frame, writer: &SharedWriter<W>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let line = match frame {
            Frame::Line(line) => line,
            Frame::TooLarge => {
                warn!(max_line_bytes = self.max_line_bytes, "Dropped oversized input line");
                let response = JsonRpcResponse::error(
                    RequestId::Null,
                    rpc_codes::INVALID_REQUEST,
                    "message too large",
                );
                write_response(writer, &response).await;
                return;
            }
        };

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            return;
        }

        let value: Value = match serde_json::from_slice(trimmed) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "Unparseable input line");
                let response =
                    JsonRpcResponse::error(RequestId::Null, rpc_codes::PARSE_ERROR, "Parse error");
                write_response(writer, &response).await;
                return;
            }
        };

        let message = match IncomingMessage::from_value(value) {
            Ok(message) => message,
            Err(invalid) => {
                debug!(reason = %invalid.reason, "Invalid request");
                let response = JsonRpcResponse::error_with_data(
                    invalid.id,
                    rpc_codes::INVALID_REQUEST,
                    "Invalid Request",
                    Value::String(invalid.reason),
                );
                write_response(writer, &response).await;
                return;
            }
        };

        self.spawn_dispatch(message, line, writer);
    }

    fn spawn_dispatch<W>(&self, message: IncomingMessage, line: Bytes, writer: &SharedWriter<W>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = message.id().cloned();
        let method = message.method().to_string();
        let ticket = self
            .pending
            .register(id.clone().unwrap_or(RequestId::Null), line);

        let dispatcher = Arc::clone(&self.dispatcher);
        let pending = Arc::clone(&self.pending);
        let writer = Arc::clone(writer);

        tokio::spawn(async move {
            // Inner task so a panicking handler surfaces as a JoinError
            let outcome = tokio::spawn(async move { dispatcher.dispatch(message).await }).await;

            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    error!(method = %method, panicked = e.is_panic(), "Dispatch task failed");
                    id.map(|id| {
                        JsonRpcResponse::error(id, rpc_codes::INTERNAL_ERROR, "Internal error")
                    })
                }
            };

            if let Some(response) = response {
                write_response(&writer, &response).await;
            }
            pending.complete(ticket);
        });
    }
}

/// Write one response line and flush it
async fn write_response<W>(writer: &SharedWriter<W>, response: &JsonRpcResponse)
where
    W: AsyncWrite + Unpin + Send,
{
    let mut line = match serde_json::to_vec(response) {
        Ok(line) => line,
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            return;
        }
    };
    line.push(b'\n');

    let mut writer = writer.lock().await;
    let result = async {
        writer.write_all(&line).await?;
        writer.flush().await
    }
    .await;

    if let Err(e) = result {
        // Nobody left to answer; the request still counts as handled
        error!(error = %e, id = %response.id, "Failed to write response");
    }
}
