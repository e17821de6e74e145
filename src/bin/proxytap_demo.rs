//! Demo binary: runs the proxy in front of the in-memory fixture app.
//! Shape and `tracing_subscriber` init borrowed from
//! `examples/http_mitm_proxy.rs`'s `main()`.

use clap::Parser;
use proxytap::config::ProxyConfig;
use proxytap::middleware::{AuxAppTable, ProxyMiddleware};
use proxytap::resolver::IdentityResolver;
use proxytap::testing::FixtureApp;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "proxytap-demo")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:9080")]
    bind: SocketAddr,

    /// Disable on-demand TLS interception (plain HTTP proxying only).
    #[arg(long)]
    no_websockets: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = ProxyConfig {
        bind_addr: args.bind,
        enable_websockets: !args.no_websockets,
        ..ProxyConfig::default()
    };

    let middleware = ProxyMiddleware::new(
        config,
        Arc::new(IdentityResolver),
        Arc::new(FixtureApp),
        AuxAppTable::new(),
    )?;

    Arc::new(middleware).run().await?;
    Ok(())
}
