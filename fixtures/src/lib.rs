use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod network;

pub use network::{
    CounterSnapshot, Fixture, FixtureAccount, FixtureOptions, NonceMode, TokenOverrides,
};

/// Common CLI arguments for all fixture servers
#[derive(Parser, Debug, Clone)]
pub struct FixtureArgs {
    /// The port to listen on
    #[arg(short, long, default_value = "0")]
    pub port: u16,

    /// The host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,
}

/// Common function to run a fixture server.
///
/// `app` receives the bound address so the fixture can advertise its own URLs
/// when listening on an ephemeral port.
pub async fn run_server(
    args: FixtureArgs,
    app: impl FnOnce(SocketAddr) -> Router,
) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let addr = format!("{}:{}", args.host, args.port).parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;

    let app = app(addr).layer(TraceLayer::new_for_http());

    info!("Fixture server listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
