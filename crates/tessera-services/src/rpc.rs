//! RPC records, servants, and the endpoint that hosts them.
//!
//! A request names a servant by path and carries its arguments as refs; the
//! response carries either a result ref or an error description. Both are
//! ordinary objects, so they travel inside bundles like anything else and
//! drag their arguments and results along with them.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use tessera_core::codec::{DecodeError, Schema, Value};
use tessera_core::{BundleError, CryptoError, Mosaic, MosaicError, Object, Ref};

use crate::resolver::ResolveError;

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub request_id: String,
    pub servant_path: Vec<String>,
    pub params: Vec<Ref>,
    /// Peer ref of the caller; must match the parcel signer.
    pub sender: Ref,
}

impl RpcRequest {
    pub fn new(servant_path: Vec<String>, params: Vec<Ref>, sender: Ref) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            servant_path,
            params,
            sender,
        }
    }
}

impl Object for RpcRequest {
    const TYPE_NAME: &'static str = "tessera.rpc_request";

    fn schema() -> Schema {
        Schema::record([
            ("request_id", Schema::String),
            ("servant_path", Schema::list(Schema::String)),
            ("params", Schema::list(Schema::Ref)),
            ("sender", Schema::Ref),
        ])
    }

    fn to_value(&self) -> Value {
        Value::Record(vec![
            Value::string(self.request_id.clone()),
            Value::List(self.servant_path.iter().cloned().map(Value::String).collect()),
            Value::List(self.params.iter().copied().map(Value::Ref).collect()),
            Value::Ref(self.sender),
        ])
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut f = value.into_fields(Self::TYPE_NAME)?;
        Ok(Self {
            request_id: f.string("request_id")?,
            servant_path: f.strings("servant_path")?,
            params: f.refs("params")?,
            sender: f.reference("sender")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcResult {
    Ok(Ref),
    Error { error_type: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub request_id: String,
    pub result: RpcResult,
}

impl Object for RpcResponse {
    const TYPE_NAME: &'static str = "tessera.rpc_response";

    fn schema() -> Schema {
        Schema::record([
            ("request_id", Schema::String),
            (
                "result",
                Schema::union([
                    ("ok", vec![("value", Schema::Ref)]),
                    (
                        "error",
                        vec![("error_type", Schema::String), ("message", Schema::String)],
                    ),
                ]),
            ),
        ])
    }

    fn to_value(&self) -> Value {
        let result = match &self.result {
            RpcResult::Ok(value) => Value::variant("ok", vec![Value::Ref(*value)]),
            RpcResult::Error {
                error_type,
                message,
            } => Value::variant(
                "error",
                vec![
                    Value::string(error_type.clone()),
                    Value::string(message.clone()),
                ],
            ),
        };
        Value::Record(vec![Value::string(self.request_id.clone()), result])
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut f = value.into_fields(Self::TYPE_NAME)?;
        let request_id = f.string("request_id")?;
        let result = f.next("result", |v| {
            let (name, fields) = v.into_variant()?;
            let mut fields = Value::Record(fields).into_fields("result")?;
            match name.as_str() {
                "ok" => Ok(RpcResult::Ok(fields.reference("value")?)),
                "error" => Ok(RpcResult::Error {
                    error_type: fields.string("error_type")?,
                    message: fields.string("message")?,
                }),
                other => Err(DecodeError::invalid(format!("unknown result variant {other}"))),
            }
        })?;
        Ok(Self { request_id, result })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("call timed out")]
    Timeout,

    #[error("transport closed before a response arrived")]
    TransportClosed,

    #[error("remote exception: {0}")]
    RemoteException(String),

    #[error("servant raised {error_type}: {message}")]
    Servant { error_type: String, message: String },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Mosaic(#[from] MosaicError),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("services failed: {0}")]
    ServicesFailed(String),
}

/// Where a call ended up. `Pending` until exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Completed,
    TimedOut,
    TransportFailed,
    Failed,
}

impl CallState {
    pub fn of(outcome: &Result<Ref, RpcError>) -> Self {
        match outcome {
            Ok(_) | Err(RpcError::Servant { .. }) => Self::Completed,
            Err(RpcError::Timeout) => Self::TimedOut,
            Err(RpcError::TransportClosed | RpcError::RemoteException(_)) => Self::TransportFailed,
            Err(_) => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

// ── Servants ──────────────────────────────────────────────────────────────────

/// What a servant sees besides its arguments.
pub struct ServantContext {
    pub mosaic: Arc<Mosaic>,
    /// Verified peer ref of the caller.
    pub caller: Ref,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServantError {
    pub error_type: String,
    pub message: String,
}

impl ServantError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

impl From<MosaicError> for ServantError {
    fn from(e: MosaicError) -> Self {
        Self::new("mosaic", e.to_string())
    }
}

/// A callable object hosted by an endpoint. Results must be stored in
/// `ctx.mosaic` so they can be bundled back to the caller.
#[async_trait]
pub trait Servant: Send + Sync {
    async fn call(&self, ctx: &ServantContext, params: Vec<Ref>) -> Result<Ref, ServantError>;
}

/// Servant path → servant.
#[derive(Default)]
pub struct Endpoint {
    servants: DashMap<String, Arc<dyn Servant>>,
}

impl Endpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// `path` is slash-separated, e.g. `echo` or `files/read`.
    pub fn register_servant(&self, path: &str, servant: Arc<dyn Servant>) {
        tracing::debug!(path, "servant registered");
        self.servants.insert(path.to_string(), servant);
    }

    pub fn lookup(&self, servant_path: &[String]) -> Option<Arc<dyn Servant>> {
        self.servants
            .get(&servant_path.join("/"))
            .map(|s| Arc::clone(s.value()))
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.servants.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }
}

/// Split a slash-separated servant path.
pub fn servant_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
