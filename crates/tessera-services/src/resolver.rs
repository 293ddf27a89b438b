//! Route resolution.
//!
//! Local routes win outright. Only when the table has nothing for a peer
//! are the pluggable sources asked, in order, and everything they return
//! is added to the table. The whole lookup runs under its own timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use tessera_core::Ref;

use crate::route::{SharedRoute, SharedRouteTable};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no route to peer {0}")]
    NoRoute(Ref),

    #[error("route resolution for {0} timed out")]
    Timeout(Ref),
}

/// A place to ask for routes the local table does not know.
#[async_trait]
pub trait RouteSource: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, peer: &Ref) -> Vec<SharedRoute>;
}

pub struct RouteResolver {
    table: SharedRouteTable,
    sources: Vec<Arc<dyn RouteSource>>,
    timeout: Duration,
}

impl RouteResolver {
    pub fn new(table: SharedRouteTable, timeout: Duration) -> Self {
        Self {
            table,
            sources: Vec::new(),
            timeout,
        }
    }

    /// Sources are consulted in the order they were added.
    pub fn with_source(mut self, source: Arc<dyn RouteSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn table(&self) -> &SharedRouteTable {
        &self.table
    }

    pub async fn resolve(&self, peer: &Ref) -> Result<Vec<SharedRoute>, ResolveError> {
        let local = self.table.routes_for(peer);
        if !local.is_empty() {
            return Ok(local);
        }

        let lookup = async {
            for source in &self.sources {
                let found = source.lookup(peer).await;
                tracing::debug!(
                    peer = %peer.short(),
                    source = source.name(),
                    found = found.len(),
                    "route source consulted"
                );
                for route in found {
                    self.table.add_route(*peer, route);
                }
            }
        };

        let timed_out = tokio::time::timeout(self.timeout, lookup).await.is_err();
        let routes = self.table.routes_for(peer);
        match (routes.is_empty(), timed_out) {
            (false, _) => Ok(routes),
            (true, true) => {
                tracing::warn!(peer = %peer.short(), "route resolution timed out");
                Err(ResolveError::Timeout(*peer))
            }
            (true, false) => Err(ResolveError::NoRoute(*peer)),
        }
    }
}
