//! One open byte stream, seen as a route.
//!
//! The read half belongs to the dispatcher; this is the write half. Writes
//! are serialized by a lock so frames from concurrent senders never
//! interleave, and a failed write retires the connection for good.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

use tessera_core::codec::CDR;
use tessera_core::wire::{self, ControlMessage, Frame};
use tessera_core::Bundle;

use crate::route::{ConnId, Route, TransportError};

pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How bundles are framed on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Bare frames, as on TCP.
    Stream,
    /// Frames wrapped in PARCEL control messages, as on a subprocess pipe.
    Pipe,
}

pub struct ConnectionRoute {
    id: ConnId,
    kind: FrameKind,
    writer: Mutex<Option<BoxWriter>>,
    closed: watch::Sender<bool>,
}

impl ConnectionRoute {
    pub fn new(id: ConnId, kind: FrameKind, writer: BoxWriter) -> Self {
        Self {
            id,
            kind,
            writer: Mutex::new(Some(writer)),
            closed: watch::channel(false).0,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Flag the connection dead. Later sends fail with `Closed`.
    pub fn mark_closed(&self) {
        if !self.closed.send_replace(true) {
            tracing::debug!(conn = self.id, "connection closed");
        }
    }

    /// Resolves once the connection is closed, even if that happened earlier.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Write a control message. Only meaningful on pipes.
    pub async fn send_control(&self, message: &ControlMessage) -> Result<(), TransportError> {
        self.write_all(&wire::encode_control(message)).await
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TransportError::Closed);
        };
        if !self.is_available() {
            return Err(TransportError::Closed);
        }
        let mut in_flight = InFlight {
            conn: self,
            done: false,
        };
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        in_flight.done = true;
        if let Err(e) = result {
            tracing::warn!(conn = self.id, error = %e, "write failed");
            *guard = None;
            self.mark_closed();
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Shut down the write half. Idempotent.
    pub async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
        self.mark_closed();
    }
}

/// Retires the connection if a write is dropped before it finishes.
/// A frame cut short leaves the peer's reader out of step.
struct InFlight<'a> {
    conn: &'a ConnectionRoute,
    done: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(conn = self.conn.id, "write abandoned mid-frame");
            self.conn.mark_closed();
        }
    }
}

#[async_trait]
impl Route for ConnectionRoute {
    fn key(&self) -> String {
        format!("conn:{}", self.id)
    }

    fn is_available(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn send(&self, bundle: &Bundle) -> Result<(), TransportError> {
        let payload = bundle.encode()?;
        let bytes = match self.kind {
            FrameKind::Stream => wire::encode_frame(CDR, &payload),
            FrameKind::Pipe => wire::encode_control(&ControlMessage::Parcel(Frame::new(CDR, payload))),
        };
        self.write_all(&bytes).await
    }

    fn connection_id(&self) -> Option<ConnId> {
        Some(self.id)
    }

    async fn report_exception(&self, summary: &str, trace_lines: &[String]) {
        if self.kind != FrameKind::Pipe {
            return;
        }
        let message = ControlMessage::Exception {
            summary: summary.to_string(),
            trace_lines: trace_lines.to_vec(),
        };
        if let Err(e) = self.send_control(&message).await {
            tracing::warn!(conn = self.id, error = %e, "could not report exception");
        }
    }
}
