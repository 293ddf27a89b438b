//! A node: one identity, one mosaic, and the services wired around them.
//!
//! Everything is constructed explicitly here and handed to its users; there
//! is no process-global state. [`Node::start`] must run inside a tokio
//! runtime because it spawns the dispatcher.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::runtime::Handle;

use tessera_core::bundle::{AssociationRegistry, BundleError, Bundler, Unbundler};
use tessera_core::codec::CodecRegistry;
use tessera_core::config::TesseraConfig;
use tessera_core::ref_file::{self, RefFileError};
use tessera_core::{Bundle, Identity, Mosaic, Object, Ref, TypeRegistry};

use crate::association::{publish_route, RouteAssociation, RouteAssociationHandler, RouteFactories};
use crate::cache::DiskCapsuleCache;
use crate::dispatcher::{Dispatcher, DispatcherTask};
use crate::remoting::Remoting;
use crate::resolver::{RouteResolver, RouteSource};
use crate::route::{new_route_table, SharedRouteTable};
use crate::rpc::{servant_path, Endpoint, RpcError, RpcRequest, RpcResponse, Servant};
use crate::supervisor::Services;
use crate::tcp::{TcpRouteAddress, TcpRouteFactory, TcpServer};

pub struct Node {
    config: TesseraConfig,
    identity: Arc<Identity>,
    types: Arc<TypeRegistry>,
    mosaic: Arc<Mosaic>,
    associations: Arc<AssociationRegistry>,
    bundler: Bundler,
    unbundler: Arc<Unbundler>,
    routes: SharedRouteTable,
    dispatcher: Dispatcher,
    endpoint: Arc<Endpoint>,
    remoting: Remoting,
    services: Services,
}

impl Node {
    pub fn start(config: TesseraConfig, identity: Identity) -> Result<Self> {
        Self::start_with_sources(config, identity, Vec::new())
    }

    /// `sources` are asked for routes the table doesn't have, in order.
    pub fn start_with_sources(
        config: TesseraConfig,
        identity: Identity,
        sources: Vec<Arc<dyn RouteSource>>,
    ) -> Result<Self> {
        let types = TypeRegistry::with_builtins();
        types.register::<RouteAssociation>();
        types.register::<TcpRouteAddress>();
        types.register::<RpcRequest>();
        types.register::<RpcResponse>();
        let types = Arc::new(types);

        let mut mosaic = Mosaic::with_codecs(CodecRegistry::with_defaults(config.codec.max_decode_len));
        if let Some(path) = &config.cache.path {
            let cache = DiskCapsuleCache::new(path)?;
            tracing::info!(path = %path.display(), "capsule cache enabled");
            mosaic = mosaic.with_spill(Arc::new(cache));
        }
        let mosaic = Arc::new(mosaic);

        let associations = Arc::new(AssociationRegistry::new());
        let bundler = Bundler::new(mosaic.clone(), types.clone(), associations.clone());
        let unbundler = Arc::new(Unbundler::new(mosaic.clone(), types.clone()));

        let routes = new_route_table();
        let (dispatcher, inbox) = Dispatcher::channel();
        let factories = Arc::new(RouteFactories::new());
        factories.register(Arc::new(TcpRouteFactory::new(dispatcher.clone())));
        unbundler.add_handler(
            RouteAssociation::TYPE_NAME,
            Arc::new(RouteAssociationHandler::new(
                mosaic.clone(),
                types.clone(),
                routes.clone(),
                factories,
            )),
        );

        let mut resolver = RouteResolver::new(routes.clone(), config.resolver.timeout());
        for source in sources {
            resolver = resolver.with_source(source);
        }

        let identity = Arc::new(identity);
        let endpoint = Arc::new(Endpoint::new());
        let services = Services::new();
        let remoting = Remoting::new(
            identity.clone(),
            mosaic.clone(),
            bundler.clone(),
            unbundler.clone(),
            Arc::new(resolver),
            endpoint.clone(),
            services.clone(),
            config.rpc.timeout(),
        )?;

        let task = DispatcherTask::new(
            inbox,
            Arc::new(remoting.clone()),
            mosaic.codecs().clone(),
            services.subscribe(),
        );
        services.supervise("dispatcher", tokio::spawn(task.run()));
        tracing::info!(peer = %remoting.peer_ref().short(), "node started");

        Ok(Self {
            config,
            identity,
            types,
            mosaic,
            associations,
            bundler,
            unbundler,
            routes,
            dispatcher,
            endpoint,
            remoting,
            services,
        })
    }

    pub fn peer_ref(&self) -> Ref {
        self.remoting.peer_ref()
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    pub fn mosaic(&self) -> &Arc<Mosaic> {
        &self.mosaic
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn routes(&self) -> &SharedRouteTable {
        &self.routes
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn remoting(&self) -> &Remoting {
        &self.remoting
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn register_servant(&self, path: &str, servant: Arc<dyn Servant>) {
        self.endpoint.register_servant(path, servant);
    }

    /// Listen on TCP and publish the address as a route to this node.
    /// Port 0 picks a free port; the bound address is returned.
    pub async fn serve_tcp(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let server = TcpServer::bind(host, port, self.dispatcher.clone(), self.services.subscribe()).await?;
        let addr = server.local_addr()?;
        self.services.supervise("tcp server", tokio::spawn(server.run()));

        publish_route(
            &self.mosaic,
            &self.associations,
            self.peer_ref(),
            &TcpRouteAddress::new(host, addr.port()),
        )?;
        Ok(addr)
    }

    /// Our peer ref with everything needed to reach us.
    pub fn export_peer(&self) -> Result<Bundle, BundleError> {
        self.bundler.bundle(&[self.peer_ref()], &HashSet::new())
    }

    pub fn import(&self, bundle: &Bundle) -> Result<HashSet<Ref>, BundleError> {
        self.unbundler.unbundle(bundle)
    }

    pub fn write_ref_file(&self, path: &Path) -> Result<()> {
        let bundle = self.export_peer()?;
        ref_file::save_ref_file(path, &bundle)
            .with_context(|| format!("failed to write ref file {}", path.display()))
    }

    /// Import a ref file and return its root.
    pub fn read_ref_file(&self, path: &Path) -> Result<Ref> {
        let bundle = ref_file::load_ref_file(path)?;
        let root = ref_file::root_of(&bundle)?;
        self.import(&bundle)
            .map_err(|e| RefFileError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(root)
    }

    pub async fn call(&self, peer: Ref, path: &str, params: Vec<Ref>) -> Result<Ref, RpcError> {
        self.call_with_timeout(peer, path, params, self.config.rpc.timeout())
            .await
    }

    pub async fn call_with_timeout(
        &self,
        peer: Ref,
        path: &str,
        params: Vec<Ref>,
        timeout: Duration,
    ) -> Result<Ref, RpcError> {
        self.remoting
            .call(peer, servant_path(path), params, timeout)
            .await
    }

    /// Call and decode the result as `R`.
    pub async fn call_object<R: Object>(
        &self,
        peer: Ref,
        path: &str,
        params: Vec<Ref>,
    ) -> Result<R, RpcError> {
        let result = self.call(peer, path, params).await?;
        Ok(self.mosaic.resolve_object(&result)?)
    }

    /// Drive a call from a thread outside the runtime.
    pub fn call_blocking(
        &self,
        handle: &Handle,
        peer: Ref,
        path: &str,
        params: Vec<Ref>,
    ) -> Result<Ref, RpcError> {
        handle.block_on(self.call(peer, path, params))
    }

    pub fn shutdown(&self) {
        self.services.shutdown();
    }
}
