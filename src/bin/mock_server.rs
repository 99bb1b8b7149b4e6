//! Standalone OpenAI-compatible mock inference server.
//!
//! Pairs with the harness for local end-to-end runs: point
//! `server.base_url` at it and (optionally) a Prometheus instance at its
//! `/metrics` endpoint.
//!
//! ```bash
//! infbench-mock --port 8000 --ttft-ms 80 --itl-ms 15 --tokens 64
//! ```

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use infbench::mock::{router, MockServerConfig};

#[derive(Parser)]
#[command(name = "infbench-mock")]
#[command(about = "Mock OpenAI-compatible inference server", long_about = None)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, default_value = "8000")]
    port: u16,

    /// Delay before the first token, milliseconds
    #[arg(long, default_value = "50")]
    ttft_ms: u64,

    /// Delay between tokens, milliseconds
    #[arg(long, default_value = "10")]
    itl_ms: u64,

    /// Tokens generated per response (capped by request max_tokens)
    #[arg(long, default_value = "64")]
    tokens: u32,

    /// Probability of answering 500 instead of generating
    #[arg(long, default_value = "0.0")]
    fail_rate: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "infbench=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = MockServerConfig {
        ttft_ms: cli.ttft_ms,
        itl_ms: cli.itl_ms,
        tokens: cli.tokens,
        fail_rate: cli.fail_rate,
    };

    let app = router(config).layer(TraceLayer::new_for_http());
    let addr = SocketAddr::from((cli.host.parse::<std::net::IpAddr>()?, cli.port));
    tracing::info!("mock inference server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
