//! Subprocess pipe transport.
//!
//! The parent spawns a child with piped stdin/stdout and speaks control
//! messages over them: PARCEL carries bundles, STOP asks the child to
//! exit, EXCEPTION reports a failure the child could not handle. The child
//! opens by saying hello, a bundle rooted at its own peer, which tells the
//! parent who is on the other end and gives it a route there.
//!
//! The child must keep stdout for the protocol; its logs go to stderr.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};

use tessera_core::wire::ControlMessage;
use tessera_core::Ref;

use crate::connection::{BoxWriter, ConnectionRoute, FrameKind};
use crate::dispatcher::BoxReader;
use crate::node::Node;
use crate::route::Route;

/// Register one end of a pipe and wait for the other end's hello.
pub async fn attach_pipe(
    node: &Node,
    reader: BoxReader,
    writer: BoxWriter,
    hello_timeout: Duration,
) -> Result<(Arc<ConnectionRoute>, Ref)> {
    let dispatcher = node.dispatcher();
    let id = dispatcher.next_id();
    let hello = node.remoting().expect_hello(id);
    let route = dispatcher.register_as(id, reader, writer, FrameKind::Pipe);
    match tokio::time::timeout(hello_timeout, hello).await {
        Ok(Ok(peer)) => Ok((route, peer)),
        Ok(Err(_)) => bail!("pipe closed before hello"),
        Err(_) => {
            route.close().await;
            bail!("no hello within {} ms", hello_timeout.as_millis())
        }
    }
}

/// Serve the child side of a pipe until STOP, failure, or the parent hangs up.
pub async fn serve_pipe(node: &Node, reader: BoxReader, writer: BoxWriter) -> Result<()> {
    let dispatcher = node.dispatcher();
    let id = dispatcher.next_id();
    node.remoting().set_parent(id);
    let route = dispatcher.register_as(id, reader, writer, FrameKind::Pipe);
    let services = node.services();
    if let Err(e) = node.remoting().announce(route.as_ref()).await {
        if route.is_available() {
            return Err(e).context("failed to say hello");
        }
        tracing::info!("parent closed the pipe before hello");
        services.shutdown();
        return Ok(());
    }
    tracing::info!(peer = %node.peer_ref().short(), "serving on pipe");

    tokio::select! {
        _ = services.stopped() => {}
        _ = route.closed() => {
            tracing::info!("parent closed the pipe");
            services.shutdown();
        }
    }
    if let Some(reason) = services.failure() {
        route.report_exception(&reason, &[]).await;
    }
    route.close().await;
    Ok(())
}

/// [`serve_pipe`] over this process's stdin and stdout.
pub async fn serve_stdio(node: &Node) -> Result<()> {
    serve_pipe(node, Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout())).await
}

// ── Parent side ───────────────────────────────────────────────────────────────

pub struct ChildProcess {
    child: Child,
    route: Arc<ConnectionRoute>,
    peer: Ref,
}

impl ChildProcess {
    /// Spawn `command` and wait for its hello.
    pub async fn spawn(node: &Node, mut command: Command, hello_timeout: Duration) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command.spawn().context("failed to spawn child process")?;
        let stdin = child.stdin.take().context("child stdin was not captured")?;
        let stdout = child.stdout.take().context("child stdout was not captured")?;

        let (route, peer) = match attach_pipe(node, Box::new(stdout), Box::new(stdin), hello_timeout).await {
            Ok(attached) => attached,
            Err(e) => {
                let _ = child.start_kill();
                return Err(e.context("child did not start"));
            }
        };
        tracing::info!(pid = ?child.id(), peer = %peer.short(), "child process ready");
        Ok(Self { child, route, peer })
    }

    pub fn peer_ref(&self) -> Ref {
        self.peer
    }

    pub fn route(&self) -> &Arc<ConnectionRoute> {
        &self.route
    }

    /// Ask the child to exit; kill it if it hasn't within `grace`.
    pub async fn stop(mut self, grace: Duration) -> Result<ExitStatus> {
        if let Err(e) = self.route.send_control(&ControlMessage::Stop).await {
            tracing::debug!(error = %e, "stop not delivered");
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                tracing::warn!(pid = ?self.child.id(), "child ignored stop, killing");
                self.child.kill().await?;
                Ok(self.child.wait().await?)
            }
        }
    }
}
