//! Remoting: RPC calls carried as encrypted parcels over routes.
//!
//! Outbound, a call stores its request, bundles it with everything it
//! references, seals the bundle into a parcel for the target peer, bundles
//! the parcel, and sends it down the first route that takes it. The pending
//! slot is in place before the first byte leaves, so a fast response is
//! never lost.
//!
//! Inbound, every bundle from the dispatcher is unbundled. Parcels
//! addressed to us are verified and opened; the connection they arrived on
//! becomes a route back to their signer. Requests go to servants, responses
//! complete pending calls. A bare peer as a bundle root is a hello: a
//! child we are waiting on introducing itself over its pipe.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use tessera_core::{Bundler, Identity, Mosaic, Object, Parcel, Peer, Ref, Unbundler};

use crate::dispatcher::{Inbound, InboundHandler};
use crate::resolver::RouteResolver;
use crate::route::{ConnId, Route, SharedRoute, SharedRouteTable};
use crate::rpc::{
    CallState, Endpoint, RpcError, RpcRequest, RpcResponse, RpcResult, Servant, ServantContext,
};
use crate::supervisor::Services;

type CallOutcome = Result<RpcResponse, RpcError>;

struct PendingCall {
    tx: oneshot::Sender<CallOutcome>,
    /// Connection the request went out on, once known.
    conn: Option<ConnId>,
}

struct Inner {
    identity: Arc<Identity>,
    peer: Peer,
    peer_ref: Ref,
    mosaic: Arc<Mosaic>,
    bundler: Bundler,
    unbundler: Arc<Unbundler>,
    routes: SharedRouteTable,
    resolver: Arc<RouteResolver>,
    endpoint: Arc<Endpoint>,
    services: Services,
    reply_timeout: Duration,
    pending: DashMap<String, PendingCall>,
    hellos: DashMap<ConnId, oneshot::Sender<Ref>>,
    /// The pipe to our parent; 0 when we have none.
    parent_conn: AtomicU64,
}

#[derive(Clone)]
pub struct Remoting {
    inner: Arc<Inner>,
}

impl Remoting {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<Identity>,
        mosaic: Arc<Mosaic>,
        bundler: Bundler,
        unbundler: Arc<Unbundler>,
        resolver: Arc<RouteResolver>,
        endpoint: Arc<Endpoint>,
        services: Services,
        reply_timeout: Duration,
    ) -> Result<Self, RpcError> {
        let peer = identity.peer();
        let peer_ref = mosaic.put(&peer)?;
        Ok(Self {
            inner: Arc::new(Inner {
                identity,
                peer,
                peer_ref,
                routes: resolver.table().clone(),
                mosaic,
                bundler,
                unbundler,
                resolver,
                endpoint,
                services,
                reply_timeout,
                pending: DashMap::new(),
                hellos: DashMap::new(),
                parent_conn: AtomicU64::new(0),
            }),
        })
    }

    pub fn peer_ref(&self) -> Ref {
        self.inner.peer_ref
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Call `servant_path` on `peer`. The peer's record must already be in
    /// the mosaic, typically from an imported ref file.
    pub async fn call(
        &self,
        peer: Ref,
        servant_path: Vec<String>,
        params: Vec<Ref>,
        timeout: Duration,
    ) -> Result<Ref, RpcError> {
        let path = servant_path.join("/");
        let outcome = self.call_inner(peer, servant_path, params, timeout).await;
        tracing::debug!(
            peer = %peer.short(),
            path = %path,
            state = ?CallState::of(&outcome),
            "call finished"
        );
        outcome
    }

    async fn call_inner(
        &self,
        peer: Ref,
        servant_path: Vec<String>,
        params: Vec<Ref>,
        timeout: Duration,
    ) -> Result<Ref, RpcError> {
        let inner = &self.inner;
        if let Some(reason) = inner.services.failure() {
            return Err(RpcError::ServicesFailed(reason));
        }

        let request = RpcRequest::new(servant_path, params, inner.peer_ref);
        let id = request.request_id.clone();
        let request_ref = inner.mosaic.put(&request)?;

        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id.clone(), PendingCall { tx, conn: None });

        // One deadline covers resolving, sending, and waiting.
        let deadline = Instant::now() + timeout;
        let exchange = async {
            let conn = match self.deliver(&peer, request_ref).await {
                Ok(conn) => conn,
                Err(e) => return Err(e),
            };
            if let Some(mut call) = inner.pending.get_mut(&id) {
                call.conn = conn;
            }
            rx.await.unwrap_or(Err(RpcError::TransportClosed))
        };
        let outcome = tokio::select! {
            outcome = tokio::time::timeout_at(deadline, exchange) => outcome,
            reason = inner.services.failed() => Ok(Err(RpcError::ServicesFailed(reason))),
        };
        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                inner.pending.remove(&id);
                return Err(e);
            }
            Err(_) => {
                inner.pending.remove(&id);
                tracing::warn!(request = %id, timeout_ms = timeout.as_millis() as u64, "call timed out");
                return Err(RpcError::Timeout);
            }
        };
        match response.result {
            RpcResult::Ok(value) => Ok(value),
            RpcResult::Error {
                error_type,
                message,
            } => Err(RpcError::Servant {
                error_type,
                message,
            }),
        }
    }

    /// Seal `root` and its closure into a parcel for `peer` and send it.
    /// Returns the connection it left on, when the route has one.
    async fn deliver(&self, peer: &Ref, root: Ref) -> Result<Option<ConnId>, RpcError> {
        let inner = &self.inner;
        let recipient: Peer = inner.mosaic.resolve_object(peer)?;
        let sealed = inner.bundler.bundle(&[root], &HashSet::new())?;
        let parcel = recipient.make_parcel(&sealed, &inner.identity)?;
        let parcel_ref = inner.mosaic.put(&parcel)?;
        let outer = inner.bundler.bundle(&[parcel_ref], &HashSet::new())?;

        let routes = inner.resolver.resolve(peer).await?;
        for route in routes.iter().filter(|r| r.is_available()) {
            match route.send(&outer).await {
                Ok(()) => {
                    tracing::trace!(peer = %peer.short(), route = %route.key(), "parcel sent");
                    return Ok(route.connection_id());
                }
                Err(e) => {
                    tracing::warn!(route = %route.key(), error = %e, "send failed, trying next route");
                }
            }
        }
        Err(RpcError::TransportClosed)
    }

    /// Introduce ourselves on `route`: a bundle rooted at our peer record,
    /// carrying our published route associations.
    pub async fn announce(&self, route: &dyn Route) -> Result<(), RpcError> {
        let hello = self
            .inner
            .bundler
            .bundle(&[self.inner.peer_ref], &HashSet::new())?;
        route
            .send(&hello)
            .await
            .map_err(|_| RpcError::TransportClosed)
    }

    /// Resolves with the peer ref of whoever says hello on `conn` first.
    pub fn expect_hello(&self, conn: ConnId) -> oneshot::Receiver<Ref> {
        let (tx, rx) = oneshot::channel();
        self.inner.hellos.insert(conn, tx);
        rx
    }

    /// Treat `conn` as the pipe to our parent. STOP is honoured there only.
    pub fn set_parent(&self, conn: ConnId) {
        self.inner.parent_conn.store(conn, Ordering::Release);
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    fn on_bundle(&self, conn: ConnId, reply: SharedRoute, bundle: tessera_core::Bundle) {
        let inner = &self.inner;
        if let Err(e) = inner.unbundler.unbundle(&bundle) {
            tracing::warn!(conn, error = %e, "dropping bundle that failed to unbundle");
            return;
        }
        for root in &bundle.roots {
            let type_name = match inner.mosaic.resolve(root) {
                Ok(capsule) => capsule.full_type_name,
                Err(e) => {
                    tracing::warn!(conn, error = %e, "bundle root vanished");
                    continue;
                }
            };
            if type_name == Parcel::TYPE_NAME {
                self.on_parcel(conn, root, &reply);
            } else if type_name == Peer::TYPE_NAME {
                self.on_hello(conn, *root, &reply);
            } else {
                tracing::debug!(conn, type_name = %type_name, "ignoring bundle root");
            }
        }
    }

    fn on_hello(&self, conn: ConnId, peer_ref: Ref, reply: &SharedRoute) {
        let inner = &self.inner;
        if let Err(e) = inner.mosaic.resolve_object::<Peer>(&peer_ref) {
            tracing::warn!(conn, error = %e, "malformed hello");
            return;
        }
        // Only a pipe we spawned and are waiting on may introduce itself.
        let Some((_, waiter)) = inner.hellos.remove(&conn) else {
            tracing::warn!(conn, peer = %peer_ref.short(), "unsolicited hello ignored");
            return;
        };
        inner.routes.add_route(peer_ref, reply.clone());
        tracing::info!(conn, peer = %peer_ref.short(), "peer said hello");
        let _ = waiter.send(peer_ref);
    }

    fn on_parcel(&self, conn: ConnId, root: &Ref, reply: &SharedRoute) {
        let inner = &self.inner;
        let parcel: Parcel = match inner.mosaic.resolve_object(root) {
            Ok(parcel) => parcel,
            Err(e) => {
                tracing::warn!(conn, error = %e, "malformed parcel");
                return;
            }
        };
        if parcel.receiver != inner.peer {
            tracing::debug!(conn, "parcel not addressed to us, dropped");
            return;
        }
        let sealed = match inner.identity.decrypt_parcel(&parcel) {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::warn!(conn, error = %e, "parcel rejected");
                return;
            }
        };
        let sender = match inner.mosaic.put(parcel.sender()) {
            Ok(sender) => sender,
            Err(e) => {
                tracing::warn!(conn, error = %e, "could not record parcel sender");
                return;
            }
        };
        // The connection a verified parcel arrived on reaches its signer.
        inner.routes.add_route(sender, reply.clone());

        if let Err(e) = inner.unbundler.unbundle(&sealed) {
            tracing::warn!(conn, error = %e, "parcel contents failed to unbundle");
            return;
        }
        for root in &sealed.roots {
            let type_name = match inner.mosaic.resolve(root) {
                Ok(capsule) => capsule.full_type_name,
                Err(_) => continue,
            };
            if type_name == RpcRequest::TYPE_NAME {
                match inner.mosaic.resolve_object::<RpcRequest>(root) {
                    Ok(request) if request.sender == sender => {
                        self.on_request(request, sender, reply.clone())
                    }
                    Ok(request) => tracing::warn!(
                        claimed = %request.sender.short(),
                        signer = %sender.short(),
                        "request sender does not match parcel signer, dropped"
                    ),
                    Err(e) => tracing::warn!(error = %e, "malformed request"),
                }
            } else if type_name == RpcResponse::TYPE_NAME {
                match inner.mosaic.resolve_object::<RpcResponse>(root) {
                    Ok(response) => self.on_response(response),
                    Err(e) => tracing::warn!(error = %e, "malformed response"),
                }
            } else {
                tracing::debug!(type_name = %type_name, "ignoring parcel root");
            }
        }
    }

    fn on_request(&self, request: RpcRequest, caller: Ref, reply: SharedRoute) {
        let Some(servant) = self.inner.endpoint.lookup(&request.servant_path) else {
            tracing::warn!(
                path = %request.servant_path.join("/"),
                caller = %caller.short(),
                "no such servant, request dropped"
            );
            return;
        };
        let this = self.clone();
        tokio::spawn(async move { this.serve(servant, request, caller, reply).await });
    }

    async fn serve(
        &self,
        servant: Arc<dyn Servant>,
        request: RpcRequest,
        caller: Ref,
        reply: SharedRoute,
    ) {
        let inner = &self.inner;
        let path = request.servant_path.join("/");
        let ctx = ServantContext {
            mosaic: inner.mosaic.clone(),
            caller,
        };
        let params = request.params;
        let outcome = tokio::spawn(async move { servant.call(&ctx, params).await }).await;

        let result = match outcome {
            Ok(Ok(value)) => RpcResult::Ok(value),
            Ok(Err(e)) => {
                tracing::debug!(path = %path, error_type = %e.error_type, "servant returned error");
                RpcResult::Error {
                    error_type: e.error_type,
                    message: e.message,
                }
            }
            Err(e) => {
                let summary = match e.try_into_panic() {
                    Ok(payload) => panic_message(payload.as_ref()),
                    Err(e) => e.to_string(),
                };
                tracing::error!(path = %path, summary = %summary, "servant panicked");
                reply
                    .report_exception(&summary, &[format!("in servant {path}")])
                    .await;
                RpcResult::Error {
                    error_type: "panic".into(),
                    message: summary,
                }
            }
        };

        let response = RpcResponse {
            request_id: request.request_id,
            result,
        };
        let response_ref = match inner.mosaic.put(&response) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "could not store response");
                return;
            }
        };
        match tokio::time::timeout(inner.reply_timeout, self.deliver(&caller, response_ref)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(caller = %caller.short(), error = %e, "could not deliver response")
            }
            Err(_) => tracing::warn!(caller = %caller.short(), "response delivery timed out"),
        }
    }

    fn on_response(&self, response: RpcResponse) {
        match self.inner.pending.remove(&response.request_id) {
            Some((_, call)) => {
                let _ = call.tx.send(Ok(response));
            }
            None => tracing::debug!(request = %response.request_id, "response for unknown or expired call"),
        }
    }

    fn fail_pending(&self, conn: ConnId, error: impl Fn() -> RpcError) {
        let pending = &self.inner.pending;
        let ids: Vec<String> = pending
            .iter()
            .filter(|call| call.conn == Some(conn))
            .map(|call| call.key().clone())
            .collect();
        for id in ids {
            if let Some((_, call)) = pending.remove(&id) {
                let _ = call.tx.send(Err(error()));
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "servant panicked".to_string()
    }
}

impl InboundHandler for Remoting {
    fn handle(&self, event: Inbound) {
        match event {
            Inbound::Bundle { conn, reply, bundle } => self.on_bundle(conn, reply, bundle),
            Inbound::Exception {
                conn,
                summary,
                trace_lines,
            } => {
                tracing::error!(conn, summary = %summary, trace = ?trace_lines, "remote exception");
                self.fail_pending(conn, || RpcError::RemoteException(summary.clone()));
            }
            Inbound::Stop { conn } if conn == self.inner.parent_conn.load(Ordering::Acquire) => {
                tracing::info!(conn, "stop requested by parent");
                self.inner.services.shutdown();
            }
            Inbound::Stop { conn } => tracing::warn!(conn, "stop from a non-parent ignored"),
            Inbound::Closed { conn } => {
                self.inner.hellos.remove(&conn);
                self.fail_pending(conn, || RpcError::TransportClosed);
            }
        }
    }
}
