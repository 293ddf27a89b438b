//! Tessera services: routing, transports, and RPC.
//!
//! Built on the synchronous core. A [`Node`] wires one identity and one
//! mosaic to a dispatcher task, a route table, and the remoting layer.

pub mod association;
pub mod cache;
pub mod connection;
pub mod dispatcher;
pub mod node;
pub mod pipe;
pub mod remoting;
pub mod resolver;
pub mod route;
pub mod rpc;
pub mod supervisor;
pub mod tcp;

pub use association::{publish_route, RouteAssociation, RouteFactories, RouteFactory};
pub use cache::DiskCapsuleCache;
pub use connection::{ConnectionRoute, FrameKind};
pub use dispatcher::{Dispatcher, DispatcherTask, Inbound, InboundHandler};
pub use node::Node;
pub use pipe::{serve_stdio, ChildProcess};
pub use remoting::Remoting;
pub use resolver::{ResolveError, RouteResolver, RouteSource};
pub use route::{ConnId, Route, RouteTable, SharedRoute, TransportError};
pub use rpc::{
    CallState, Endpoint, RpcError, RpcRequest, RpcResponse, RpcResult, Servant, ServantContext,
    ServantError,
};
pub use supervisor::Services;
pub use tcp::{TcpRoute, TcpRouteAddress, TcpServer};
