//! Reflex server binary.
//!
//! A thin host around the inbound handler: loads a JSON configuration,
//! listens on a TCP port, and serves each accepted connection with the
//! direct TCP dispatcher.
//!
//! Usage: reflex-server --config <FILE>

use std::env;
use std::sync::Arc;

use serde::Deserialize;
use tokio::net::TcpListener;

use reflex::config::InboundConfig;
use reflex::dispatch::TcpDispatcher;
use reflex::inbound::Handler;

#[derive(Deserialize)]
struct ServerFile {
    /// Listen address, e.g. "0.0.0.0:8443".
    listen: String,
    /// Inbound protocol settings.
    inbound: InboundConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing — respects RUST_LOG env var (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    let config_path = match args.as_slice() {
        [_, flag, path] if flag == "-c" || flag == "--config" => path.clone(),
        _ => {
            print_usage();
            return Ok(());
        }
    };

    let raw = std::fs::read_to_string(&config_path)?;
    let file: ServerFile = serde_json::from_str(&raw)?;
    let handler = Arc::new(Handler::new(&file.inbound)?);

    let listener = TcpListener::bind(&file.listen).await?;
    tracing::info!("reflex server listening on {}", file.listen);

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                stream.set_nodelay(true)?;
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = handler.process(stream, &TcpDispatcher).await {
                        tracing::debug!("connection error from {peer_addr}: {e}");
                    }
                });
            }
            Err(e) => {
                tracing::warn!("accept error: {e}");
            }
        }
    }
}

fn print_usage() {
    println!(
        r#"Reflex server

USAGE:
    reflex-server --config <FILE>

CONFIG (JSON):
    {{
      "listen": "0.0.0.0:8443",
      "inbound": {{
        "clients": [{{"id": "<uuid>", "policy": "http2-api"}}],
        "fallback": {{"dest": 8080}}
      }}
    }}
"#
    );
}
