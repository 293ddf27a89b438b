//! TCP transport.
//!
//! The server side accepts connections and hands them to the dispatcher;
//! each accepted socket becomes the reply route for whoever writes to it.
//! The client side is a [`TcpRoute`] built from a published
//! [`TcpRouteAddress`]: it connects lazily on first send and reconnects
//! after the connection drops.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};

use tessera_core::codec::{DecodeError, Schema, Value};
use tessera_core::{Bundle, Object};

use crate::association::RouteFactory;
use crate::connection::{ConnectionRoute, FrameKind};
use crate::dispatcher::Dispatcher;
use crate::route::{ConnId, Route, SharedRoute, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Route record ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpRouteAddress {
    pub host: String,
    pub port: u16,
}

impl TcpRouteAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Object for TcpRouteAddress {
    const TYPE_NAME: &'static str = "tessera.tcp_route";

    fn schema() -> Schema {
        Schema::record([("host", Schema::String), ("port", Schema::Int)])
    }

    fn to_value(&self) -> Value {
        Value::Record(vec![
            Value::string(self.host.clone()),
            Value::Int(i64::from(self.port)),
        ])
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut f = value.into_fields(Self::TYPE_NAME)?;
        let host = f.string("host")?;
        let port = f.next("port", |v| {
            let port = v.into_int()?;
            u16::try_from(port).map_err(|_| DecodeError::invalid(format!("port {port} out of range")))
        })?;
        Ok(Self { host, port })
    }
}

// ── Client route ──────────────────────────────────────────────────────────────

pub struct TcpRoute {
    address: TcpRouteAddress,
    dispatcher: Dispatcher,
    current: Mutex<Option<Arc<ConnectionRoute>>>,
    current_id: AtomicU64,
}

impl TcpRoute {
    pub fn new(address: TcpRouteAddress, dispatcher: Dispatcher) -> Self {
        Self {
            address,
            dispatcher,
            current: Mutex::new(None),
            current_id: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> &TcpRouteAddress {
        &self.address
    }

    async fn connect(&self) -> Result<Arc<ConnectionRoute>, TransportError> {
        let addr = format!("{}:{}", self.address.host, self.address.port);
        let connected = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")));
        let stream = connected.map_err(|source| TransportError::Connect {
            addr: addr.clone(),
            source,
        })?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let conn = self
            .dispatcher
            .register(Box::new(read), Box::new(write), FrameKind::Stream);
        tracing::info!(addr = %addr, conn = conn.id(), "tcp route connected");
        Ok(conn)
    }
}

#[async_trait]
impl Route for TcpRoute {
    fn key(&self) -> String {
        format!("tcp:{}:{}", self.address.host, self.address.port)
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn send(&self, bundle: &Bundle) -> Result<(), TransportError> {
        // Held across the write so sends on this route stay ordered. Callers
        // bound the whole send; dropping it mid-write retires the connection.
        let mut current = self.current.lock().await;
        let conn = match current.as_ref().filter(|c| c.is_available()) {
            Some(conn) => conn.clone(),
            None => {
                let conn = self.connect().await?;
                self.current_id.store(conn.id(), Ordering::Release);
                *current = Some(conn.clone());
                conn
            }
        };
        conn.send(bundle).await
    }

    fn connection_id(&self) -> Option<ConnId> {
        match self.current_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }
}

pub struct TcpRouteFactory {
    dispatcher: Dispatcher,
}

impl TcpRouteFactory {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

impl RouteFactory for TcpRouteFactory {
    fn route_type(&self) -> &'static str {
        TcpRouteAddress::TYPE_NAME
    }

    fn build(&self, record: Value) -> Result<SharedRoute, String> {
        let address = TcpRouteAddress::from_value(record).map_err(|e| e.to_string())?;
        Ok(Arc::new(TcpRoute::new(address, self.dispatcher.clone())))
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct TcpServer {
    listener: TcpListener,
    dispatcher: Dispatcher,
    shutdown: broadcast::Receiver<()>,
}

impl TcpServer {
    /// Port 0 picks a free port; see [`TcpServer::local_addr`].
    pub async fn bind(
        host: &str,
        port: u16,
        dispatcher: Dispatcher,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("failed to bind {host}:{port}"))?;
        Ok(Self {
            listener,
            dispatcher,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "tcp server listening");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("tcp server shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(error = %e, "set_nodelay failed");
                    }
                    let (read, write) = stream.into_split();
                    let conn = self.dispatcher.register(Box::new(read), Box::new(write), FrameKind::Stream);
                    tracing::info!(remote = %remote, conn = conn.id(), "accepted connection");
                }
            }
        }
    }
}
