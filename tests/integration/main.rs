//! Tessera integration test harness.
//!
//! Tests here run several nodes inside one process and talk between them
//! over real loopback TCP or in-memory pipes. Nothing needs root; every
//! node binds port 0.
//!
//!   cargo test --test integration

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tessera_core::codec::{DecodeError, Schema, Value};
use tessera_core::config::TesseraConfig;
use tessera_core::{Identity, Object, Ref, Text};
use tessera_services::{Node, Servant, ServantContext, ServantError};

mod bundling;
mod pipes;
mod routing;
mod rpc;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub fn config() -> TesseraConfig {
    let mut config = TesseraConfig::default();
    config.rpc.timeout_ms = CALL_TIMEOUT.as_millis() as u64;
    config.resolver.timeout_ms = 500;
    config
}

/// A node with the test servants and types registered.
pub fn node() -> Node {
    let node = Node::start(config(), Identity::generate()).expect("node failed to start");
    node.types().register::<Note>();
    node.register_servant("echo", Arc::new(Echo));
    node.register_servant("fail", Arc::new(Fail));
    node.register_servant("sleep", Arc::new(Sleep(Duration::from_secs(30))));
    node.register_servant("notes/reply", Arc::new(ReplyToNote));
    node
}

/// A node listening on loopback TCP.
pub async fn tcp_node() -> Node {
    let node = node();
    node.serve_tcp("127.0.0.1", 0)
        .await
        .expect("failed to listen on loopback");
    node
}

/// Hand `server`'s exported peer to `client`, as a ref file would.
pub fn introduce(client: &Node, server: &Node) -> Ref {
    let bundle = server.export_peer().expect("export failed");
    client.import(&bundle).expect("import failed");
    server.peer_ref()
}

pub fn text(node: &Node, s: &str) -> Ref {
    node.mosaic().put(&Text::new(s)).expect("put failed")
}

// ── Test objects ──────────────────────────────────────────────────────────────

/// A titled note whose body lives in its own capsule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub title: String,
    pub body: Ref,
}

impl Object for Note {
    const TYPE_NAME: &'static str = "test.note";

    fn schema() -> Schema {
        Schema::record([("title", Schema::String), ("body", Schema::Ref)])
    }

    fn to_value(&self) -> Value {
        Value::Record(vec![Value::string(self.title.clone()), Value::Ref(self.body)])
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut f = value.into_fields(Self::TYPE_NAME)?;
        Ok(Self {
            title: f.string("title")?,
            body: f.reference("body")?,
        })
    }
}

// ── Servants ──────────────────────────────────────────────────────────────────

pub struct Echo;

#[async_trait]
impl Servant for Echo {
    async fn call(&self, ctx: &ServantContext, params: Vec<Ref>) -> Result<Ref, ServantError> {
        let text: Text = ctx.mosaic.resolve_object(&params[0])?;
        Ok(ctx.mosaic.put(&Text::new(format!("{} to you too", text.as_str())))?)
    }
}

pub struct Fail;

#[async_trait]
impl Servant for Fail {
    async fn call(&self, _ctx: &ServantContext, _params: Vec<Ref>) -> Result<Ref, ServantError> {
        Err(ServantError::new("refused", "not today"))
    }
}

pub struct Sleep(pub Duration);

#[async_trait]
impl Servant for Sleep {
    async fn call(&self, ctx: &ServantContext, _params: Vec<Ref>) -> Result<Ref, ServantError> {
        tokio::time::sleep(self.0).await;
        Ok(ctx.mosaic.put(&Text::new("awake"))?)
    }
}

/// Reads a note's body and answers with a new note counting its words.
pub struct ReplyToNote;

#[async_trait]
impl Servant for ReplyToNote {
    async fn call(&self, ctx: &ServantContext, params: Vec<Ref>) -> Result<Ref, ServantError> {
        let note: Note = ctx.mosaic.resolve_object(&params[0])?;
        let body: Text = ctx.mosaic.resolve_object(&note.body)?;
        let words = body.as_str().split_whitespace().count();
        let reply = Note {
            title: format!("re: {}", note.title),
            body: ctx.mosaic.put(&Text::new(format!("{words} words")))?,
        };
        Ok(ctx.mosaic.put(&reply)?)
    }
}
