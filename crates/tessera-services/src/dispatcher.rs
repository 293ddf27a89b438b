//! The dispatcher: one task multiplexing reads over every open connection.
//!
//! Transports hand each new connection's read half to the dispatcher
//! through a cheap cloneable [`Dispatcher`] handle and keep the write half
//! as a [`ConnectionRoute`]. The [`DispatcherTask`] reads every connection
//! concurrently, splits frames off as they complete, decodes bundles, and
//! hands events to a single [`InboundHandler`] in arrival order per
//! connection.
//!
//! A frame that decodes badly is dropped and the connection carries on.
//! A corrupt frame header or EOF ends the connection: its route is marked
//! unavailable and the handler sees `Closed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use futures::stream::{BoxStream, SelectAll};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc, oneshot};

use tessera_core::codec::CodecRegistry;
use tessera_core::wire::{self, ControlMessage, Frame};
use tessera_core::{Bundle, Object};

use crate::connection::{BoxWriter, ConnectionRoute, FrameKind};
use crate::route::{ConnId, SharedRoute};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

const READ_CHUNK: usize = 16 * 1024;

/// What the dispatcher reports upward.
pub enum Inbound {
    /// A decoded bundle and the route that reaches whoever sent it.
    Bundle {
        conn: ConnId,
        reply: SharedRoute,
        bundle: Bundle,
    },
    Exception {
        conn: ConnId,
        summary: String,
        trace_lines: Vec<String>,
    },
    Stop {
        conn: ConnId,
    },
    Closed {
        conn: ConnId,
    },
}

/// Receives dispatcher events. Called from the dispatcher task; must not block.
pub trait InboundHandler: Send + Sync {
    fn handle(&self, event: Inbound);
}

enum Control {
    Register {
        route: Arc<ConnectionRoute>,
        reader: BoxReader,
    },
    Deregister(ConnId),
}

// ── Handle ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Dispatcher {
    control: mpsc::UnboundedSender<Control>,
    next_id: Arc<AtomicU64>,
}

/// The receiving end of a dispatcher handle, consumed by [`DispatcherTask::new`].
pub struct DispatcherInbox(mpsc::UnboundedReceiver<Control>);

impl Dispatcher {
    /// A handle and the inbox its task will drain. Registrations made before
    /// the task starts are queued.
    pub fn channel() -> (Self, DispatcherInbox) {
        let (control, inbox) = mpsc::unbounded_channel();
        let dispatcher = Self {
            control,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (dispatcher, DispatcherInbox(inbox))
    }

    /// Reserve a connection id ahead of registering it.
    pub fn next_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(
        &self,
        reader: BoxReader,
        writer: BoxWriter,
        kind: FrameKind,
    ) -> Arc<ConnectionRoute> {
        self.register_as(self.next_id(), reader, writer, kind)
    }

    /// Register under an id obtained from [`Dispatcher::next_id`].
    pub fn register_as(
        &self,
        id: ConnId,
        reader: BoxReader,
        writer: BoxWriter,
        kind: FrameKind,
    ) -> Arc<ConnectionRoute> {
        let route = Arc::new(ConnectionRoute::new(id, kind, writer));
        let control = Control::Register {
            route: route.clone(),
            reader,
        };
        if self.control.send(control).is_err() {
            tracing::warn!(conn = id, "dispatcher gone, connection dropped");
            route.mark_closed();
        } else {
            tracing::debug!(conn = id, ?kind, "connection registered");
        }
        route
    }

    /// Stop reading a connection. The handler still sees `Closed`.
    pub fn deregister(&self, id: ConnId) {
        let _ = self.control.send(Control::Deregister(id));
    }
}

// ── Read side ─────────────────────────────────────────────────────────────────

enum ReadEvent {
    Bundle(Bundle),
    /// A complete frame that could not be decoded. The stream stays in sync.
    Malformed(String),
    Exception {
        summary: String,
        trace_lines: Vec<String>,
    },
    Stop,
    Failed(String),
    Eof,
}

impl ReadEvent {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Eof)
    }
}

struct ReadState {
    reader: BoxReader,
    buf: BytesMut,
    kind: FrameKind,
    codecs: CodecRegistry,
    done: bool,
}

impl ReadState {
    async fn next_event(&mut self) -> ReadEvent {
        loop {
            if let Some(event) = self.try_decode() {
                return event;
            }
            self.buf.reserve(READ_CHUNK);
            match self.reader.read_buf(&mut self.buf).await {
                Ok(0) if self.buf.is_empty() => return ReadEvent::Eof,
                Ok(0) => {
                    return ReadEvent::Failed(format!(
                        "eof with {} bytes of a partial message",
                        self.buf.len()
                    ))
                }
                Ok(_) => {}
                Err(e) => return ReadEvent::Failed(e.to_string()),
            }
        }
    }

    fn try_decode(&mut self) -> Option<ReadEvent> {
        match self.kind {
            FrameKind::Stream => match wire::decode_frame(&mut self.buf) {
                Ok(Some(frame)) => Some(self.decode_bundle(frame)),
                Ok(None) => None,
                Err(e) => Some(ReadEvent::Failed(e.to_string())),
            },
            FrameKind::Pipe => match wire::decode_control(&mut self.buf) {
                Ok(Some(ControlMessage::Parcel(frame))) => Some(self.decode_bundle(frame)),
                Ok(Some(ControlMessage::Exception {
                    summary,
                    trace_lines,
                })) => Some(ReadEvent::Exception {
                    summary,
                    trace_lines,
                }),
                Ok(Some(ControlMessage::Stop)) => Some(ReadEvent::Stop),
                Ok(None) => None,
                Err(e) => Some(ReadEvent::Failed(e.to_string())),
            },
        }
    }

    fn decode_bundle(&self, frame: Frame) -> ReadEvent {
        let codec = match self.codecs.get(&frame.encoding) {
            Ok(codec) => codec,
            Err(e) => return ReadEvent::Malformed(e.to_string()),
        };
        match codec
            .decode(&Bundle::schema(), &frame.payload)
            .and_then(Bundle::from_value)
        {
            Ok(bundle) => ReadEvent::Bundle(bundle),
            Err(e) => ReadEvent::Malformed(e.to_string()),
        }
    }
}

fn read_stream(
    id: ConnId,
    kind: FrameKind,
    reader: BoxReader,
    codecs: CodecRegistry,
    cancel: oneshot::Receiver<()>,
) -> BoxStream<'static, (ConnId, ReadEvent)> {
    let state = ReadState {
        reader,
        buf: BytesMut::with_capacity(READ_CHUNK),
        kind,
        codecs,
        done: false,
    };
    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        let event = state.next_event().await;
        state.done = event.is_terminal();
        Some((event, state))
    })
    .map(move |event| (id, event))
    .take_until(cancel)
    .boxed()
}

// ── Task ──────────────────────────────────────────────────────────────────────

pub struct DispatcherTask {
    inbox: mpsc::UnboundedReceiver<Control>,
    handler: Arc<dyn InboundHandler>,
    codecs: CodecRegistry,
    shutdown: broadcast::Receiver<()>,
}

impl DispatcherTask {
    pub fn new(
        inbox: DispatcherInbox,
        handler: Arc<dyn InboundHandler>,
        codecs: CodecRegistry,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            inbox: inbox.0,
            handler,
            codecs,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut streams: SelectAll<BoxStream<'static, (ConnId, ReadEvent)>> = SelectAll::new();
        let mut open: HashMap<ConnId, (Arc<ConnectionRoute>, oneshot::Sender<()>)> = HashMap::new();
        let mut inbox_open = true;

        tracing::info!("dispatcher started");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(open = open.len(), "dispatcher shutting down");
                    for (route, _) in open.values() {
                        route.close().await;
                    }
                    return Ok(());
                }

                control = self.inbox.recv(), if inbox_open => match control {
                    Some(Control::Register { route, reader }) => {
                        let (cancel_tx, cancel_rx) = oneshot::channel();
                        streams.push(read_stream(
                            route.id(),
                            route.kind(),
                            reader,
                            self.codecs.clone(),
                            cancel_rx,
                        ));
                        open.insert(route.id(), (route, cancel_tx));
                    }
                    Some(Control::Deregister(id)) => {
                        if let Some((route, cancel)) = open.remove(&id) {
                            let _ = cancel.send(());
                            route.mark_closed();
                            self.handler.handle(Inbound::Closed { conn: id });
                        }
                    }
                    None => inbox_open = false,
                },

                Some((id, event)) = streams.next(), if !streams.is_empty() => {
                    self.on_event(id, event, &mut open);
                }
            }
        }
    }

    fn on_event(
        &self,
        id: ConnId,
        event: ReadEvent,
        open: &mut HashMap<ConnId, (Arc<ConnectionRoute>, oneshot::Sender<()>)>,
    ) {
        let Some((route, _)) = open.get(&id) else {
            return;
        };
        match event {
            ReadEvent::Bundle(bundle) => {
                let reply: SharedRoute = route.clone();
                self.handler.handle(Inbound::Bundle {
                    conn: id,
                    reply,
                    bundle,
                });
            }
            ReadEvent::Malformed(reason) => {
                tracing::warn!(conn = id, reason = %reason, "dropping undecodable frame");
            }
            ReadEvent::Exception {
                summary,
                trace_lines,
            } => {
                self.handler.handle(Inbound::Exception {
                    conn: id,
                    summary,
                    trace_lines,
                });
            }
            ReadEvent::Stop => self.handler.handle(Inbound::Stop { conn: id }),
            ReadEvent::Failed(reason) => {
                tracing::warn!(conn = id, reason = %reason, "connection failed");
                self.close(id, open);
            }
            ReadEvent::Eof => {
                tracing::debug!(conn = id, "connection reached eof");
                self.close(id, open);
            }
        }
    }

    fn close(
        &self,
        id: ConnId,
        open: &mut HashMap<ConnId, (Arc<ConnectionRoute>, oneshot::Sender<()>)>,
    ) {
        if let Some((route, _)) = open.remove(&id) {
            route.mark_closed();
            self.handler.handle(Inbound::Closed { conn: id });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::route::Route;
    use tessera_core::codec::CDR;
    use tessera_core::Capsule;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Bundle(ConnId, Bundle),
        Exception(ConnId, String),
        Stop(ConnId),
        Closed(ConnId),
    }

    struct Collect(mpsc::UnboundedSender<Seen>);

    impl InboundHandler for Collect {
        fn handle(&self, event: Inbound) {
            let seen = match event {
                Inbound::Bundle { conn, bundle, .. } => Seen::Bundle(conn, bundle),
                Inbound::Exception { conn, summary, .. } => Seen::Exception(conn, summary),
                Inbound::Stop { conn } => Seen::Stop(conn),
                Inbound::Closed { conn } => Seen::Closed(conn),
            };
            let _ = self.0.send(seen);
        }
    }

    fn sample_bundle(text: &str) -> Bundle {
        let capsule = Capsule::new("tessera.text", CDR, text.as_bytes().to_vec());
        Bundle {
            roots: vec![capsule.make_ref()],
            aux_roots: vec![],
            capsule_list: vec![capsule],
        }
    }

    fn start() -> (Dispatcher, mpsc::UnboundedReceiver<Seen>, broadcast::Sender<()>) {
        let (dispatcher, inbox) = Dispatcher::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = DispatcherTask::new(
            inbox,
            Arc::new(Collect(events_tx)),
            CodecRegistry::default(),
            shutdown_tx.subscribe(),
        );
        tokio::spawn(task.run());
        (dispatcher, events_rx, shutdown_tx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn frames_split_across_reads_decode_in_order() {
        let (dispatcher, mut events, _shutdown) = start();
        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(ours);
        let route = dispatcher.register(Box::new(read), Box::new(write), FrameKind::Stream);

        let mut bytes = wire::encode_frame(CDR, &sample_bundle("one").encode().unwrap());
        bytes.extend(wire::encode_frame(CDR, &sample_bundle("two").encode().unwrap()));
        let (head, tail) = bytes.split_at(5);
        theirs.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        theirs.write_all(tail).await.unwrap();

        assert_eq!(next(&mut events).await, Seen::Bundle(route.id(), sample_bundle("one")));
        assert_eq!(next(&mut events).await, Seen::Bundle(route.id(), sample_bundle("two")));

        drop(theirs);
        assert_eq!(next(&mut events).await, Seen::Closed(route.id()));
        assert!(!route.is_available());
    }

    #[tokio::test]
    async fn undecodable_frame_is_dropped_without_closing() {
        let (dispatcher, mut events, _shutdown) = start();
        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(ours);
        let route = dispatcher.register(Box::new(read), Box::new(write), FrameKind::Stream);

        theirs.write_all(&wire::encode_frame(CDR, b"\xff\xff")).await.unwrap();
        theirs.write_all(&wire::encode_frame("nope", b"")).await.unwrap();
        theirs
            .write_all(&wire::encode_frame(CDR, &sample_bundle("ok").encode().unwrap()))
            .await
            .unwrap();

        assert_eq!(next(&mut events).await, Seen::Bundle(route.id(), sample_bundle("ok")));
        assert!(route.is_available());
    }

    #[tokio::test]
    async fn corrupt_header_closes_connection() {
        let (dispatcher, mut events, _shutdown) = start();
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(ours);
        let route = dispatcher.register(Box::new(read), Box::new(write), FrameKind::Stream);

        theirs.write_all(&u64::MAX.to_be_bytes()).await.unwrap();
        assert_eq!(next(&mut events).await, Seen::Closed(route.id()));
        assert!(!route.is_available());
    }

    #[tokio::test]
    async fn pipe_control_messages_surface() {
        let (dispatcher, mut events, _shutdown) = start();
        let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(ours);
        let route = dispatcher.register(Box::new(read), Box::new(write), FrameKind::Pipe);

        let parcel = ControlMessage::Parcel(Frame::new(CDR, sample_bundle("p").encode().unwrap()));
        let exception = ControlMessage::Exception {
            summary: "worker died".into(),
            trace_lines: vec!["at step 3".into()],
        };
        theirs.write_all(&wire::encode_control(&parcel)).await.unwrap();
        theirs.write_all(&wire::encode_control(&exception)).await.unwrap();
        theirs.write_all(&wire::encode_control(&ControlMessage::Stop)).await.unwrap();

        let id = route.id();
        assert_eq!(next(&mut events).await, Seen::Bundle(id, sample_bundle("p")));
        assert_eq!(next(&mut events).await, Seen::Exception(id, "worker died".into()));
        assert_eq!(next(&mut events).await, Seen::Stop(id));
    }

    #[tokio::test]
    async fn connections_are_independent() {
        let (dispatcher, mut events, _shutdown) = start();
        let (a, a_far) = tokio::io::duplex(1024);
        let (b, mut b_far) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let route_a = dispatcher.register(Box::new(ar), Box::new(aw), FrameKind::Stream);
        let route_b = dispatcher.register(Box::new(br), Box::new(bw), FrameKind::Stream);
        assert_ne!(route_a.id(), route_b.id());

        drop(a_far);
        assert_eq!(next(&mut events).await, Seen::Closed(route_a.id()));

        b_far
            .write_all(&wire::encode_frame(CDR, &sample_bundle("b").encode().unwrap()))
            .await
            .unwrap();
        assert_eq!(next(&mut events).await, Seen::Bundle(route_b.id(), sample_bundle("b")));
        assert!(route_b.is_available());
    }

    #[tokio::test]
    async fn deregister_reports_closed() {
        let (dispatcher, mut events, _shutdown) = start();
        let (ours, _theirs) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(ours);
        let route = dispatcher.register(Box::new(read), Box::new(write), FrameKind::Stream);
        dispatcher.deregister(route.id());
        assert_eq!(next(&mut events).await, Seen::Closed(route.id()));
    }

    #[tokio::test]
    async fn shutdown_marks_routes_unavailable() {
        let (dispatcher, _events, shutdown) = start();
        let (ours, _theirs) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(ours);
        let route = dispatcher.register(Box::new(read), Box::new(write), FrameKind::Stream);
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!route.is_available());
    }
}
