//! tesserad: the Tessera node daemon.
//!
//! ```text
//! tesserad serve <ref-file>              host `echo` on TCP, write our ref file
//! tesserad call <ref-file> <message>     call `echo` on the node behind a ref file
//! tesserad child                         serve over stdin/stdout for a parent
//! tesserad spawn <servant> <message>     run a child and call one of its servants
//! ```
//!
//! Logs go to stderr; in child mode stdout belongs to the pipe protocol.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;

use tessera_core::config::TesseraConfig;
use tessera_core::{Identity, Text};
use tessera_services::{serve_stdio, ChildProcess, Node};

mod servants;

use servants::{Crash, Echo, Fail};

const USAGE: &str = "usage: tesserad serve <ref-file> | call <ref-file> <message> | child | spawn <servant> <message>";

const STOP_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = TesseraConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TesseraConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TesseraConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["serve", ref_file] => serve(config, PathBuf::from(*ref_file)).await,
        ["call", ref_file, message] => call(config, PathBuf::from(*ref_file), message).await,
        ["child"] => child(config).await,
        ["spawn", servant, message] => spawn(config, servant, message).await,
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn serve(config: TesseraConfig, ref_file: PathBuf) -> Result<()> {
    let identity = Identity::load_or_generate(&config.identity.key_path).with_context(|| {
        format!(
            "failed to load identity from {}",
            config.identity.key_path.display()
        )
    })?;
    let host = config.network.host.clone();
    let port = config.network.port;

    let node = Node::start(config, identity)?;
    tracing::info!(peer = %hex::encode(node.peer_ref().hash), "tesserad starting");
    node.register_servant("echo", Arc::new(Echo));

    let addr = node
        .serve_tcp(&host, port)
        .await
        .with_context(|| format!("failed to listen on {host}:{port}"))?;
    node.write_ref_file(&ref_file)?;
    tracing::info!(%addr, ref_file = %ref_file.display(), "serving");

    let services = node.services().clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
        reason = services.failed() => tracing::error!(reason = %reason, "services failed"),
    }
    node.shutdown();
    Ok(())
}

async fn call(config: TesseraConfig, ref_file: PathBuf, message: &str) -> Result<()> {
    let node = Node::start(config, Identity::generate())?;
    let peer = node.read_ref_file(&ref_file)?;
    let arg = node.mosaic().put(&Text::new(message))?;

    let answer: Text = node.call_object(peer, "echo", vec![arg]).await?;
    println!("{}", answer.as_str());
    node.shutdown();
    Ok(())
}

async fn child(config: TesseraConfig) -> Result<()> {
    let node = Node::start(config, Identity::generate())?;
    node.register_servant("echo", Arc::new(Echo));
    node.register_servant("fail", Arc::new(Fail));
    node.register_servant("crash", Arc::new(Crash));

    let served = serve_stdio(&node).await;
    let code = match (&served, node.services().failure()) {
        (Ok(()), None) => 0,
        (Err(e), _) => {
            tracing::error!(error = %e, "pipe service failed");
            1
        }
        (_, Some(reason)) => {
            tracing::error!(reason = %reason, "services failed");
            1
        }
    };
    // The blocking stdin reader would hold the runtime open.
    std::process::exit(code);
}

async fn spawn(config: TesseraConfig, servant: &str, message: &str) -> Result<()> {
    let hello_timeout = config.rpc.timeout();
    let node = Node::start(config, Identity::generate())?;

    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let mut command = Command::new(exe);
    command.arg("child");
    let child = ChildProcess::spawn(&node, command, hello_timeout).await?;

    let arg = node.mosaic().put(&Text::new(message))?;
    let outcome = node
        .call_object::<Text>(child.peer_ref(), servant, vec![arg])
        .await;

    let status = child.stop(STOP_GRACE).await?;
    tracing::info!(%status, "child exited");
    node.shutdown();

    println!("{}", outcome?.as_str());
    Ok(())
}
