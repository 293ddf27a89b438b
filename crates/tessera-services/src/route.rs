//! Routes and the route table.
//!
//! A route is a transport-owned handle that can deliver a bundle to one
//! peer. The table maps a peer ref to every route known for it. Entries are
//! never pruned; a route that has gone stale reports itself unavailable and
//! is skipped at send time.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use tessera_core::codec::EncodeError;
use tessera_core::{Bundle, Ref};

/// Identifies one open connection within a dispatcher.
pub type ConnId = u64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("{0}")]
    Other(String),
}

/// Something that can deliver a bundle.
#[async_trait]
pub trait Route: Send + Sync {
    /// Stable identity; two routes with the same key are the same path.
    fn key(&self) -> String;

    fn is_available(&self) -> bool;

    /// Sends issued on one route are delivered in order.
    async fn send(&self, bundle: &Bundle) -> Result<(), TransportError>;

    /// The connection currently backing this route, if any.
    fn connection_id(&self) -> Option<ConnId> {
        None
    }

    /// Report a local failure to the other end, on transports that can.
    async fn report_exception(&self, _summary: &str, _trace_lines: &[String]) {}
}

pub type SharedRoute = Arc<dyn Route>;

// ── Route table ───────────────────────────────────────────────────────────────

/// Peer ref → routes, in the order they were learned.
#[derive(Default)]
pub struct RouteTable {
    routes: DashMap<Ref, Vec<SharedRoute>>,
}

pub type SharedRouteTable = Arc<RouteTable>;

pub fn new_route_table() -> SharedRouteTable {
    Arc::new(RouteTable::default())
}

impl RouteTable {
    /// Returns `false` if a route with the same key is already present.
    pub fn add_route(&self, peer: Ref, route: SharedRoute) -> bool {
        let key = route.key();
        let mut entry = self.routes.entry(peer).or_default();
        if entry.iter().any(|r| r.key() == key) {
            return false;
        }
        tracing::debug!(peer = %peer.short(), route = %key, "route added");
        entry.push(route);
        true
    }

    /// Every route known for `peer`, available or not.
    pub fn routes_for(&self, peer: &Ref) -> Vec<SharedRoute> {
        self.routes
            .get(peer)
            .map(|routes| routes.clone())
            .unwrap_or_default()
    }

    pub fn available_routes_for(&self, peer: &Ref) -> Vec<SharedRoute> {
        let mut routes = self.routes_for(peer);
        routes.retain(|r| r.is_available());
        routes
    }

    pub fn peers(&self) -> Vec<Ref> {
        self.routes.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
