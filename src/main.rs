//! ShardMQ - Command Line Entry Point
//!
//! Publishes messages to, or consumes messages from, the shard queues of a
//! topic. Optionally serves `/health` and `/metrics` over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use prometheus::Registry;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use shardmq::api::{self, handlers::AppState};
use shardmq::{Envelope, MessageQueue, Metrics, MqConfig};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Serve /health and /metrics on this address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Give up when the broker is not reachable within this many seconds
    #[arg(long, default_value_t = 30)]
    connect_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish each BODY as one message
    Publish {
        #[arg(short, long)]
        topic: String,

        #[arg(required = true)]
        bodies: Vec<String>,
    },
    /// Print and acknowledge messages until Ctrl-C
    Listen {
        #[arg(short, long)]
        topic: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let config = MqConfig::from_env()?;

    info!("Starting ShardMQ v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.host,
        port = config.port,
        shards = config.shard_count,
        prefetch = config.prefetch,
        "Broker configuration loaded"
    );

    let registry = Registry::new();
    let metrics = Metrics::register(&registry)?;
    let mq = Arc::new(MessageQueue::new(config, metrics)?);

    if let Some(addr) = args.metrics_addr {
        let state = Arc::new(AppState {
            registry,
            mq: Arc::clone(&mq),
        });
        tokio::spawn(async move {
            if let Err(e) = serve(addr, state).await {
                error!(error = %e, "HTTP server failed");
            }
        });
    }

    let timeout = Duration::from_secs(args.connect_timeout_secs);
    tokio::time::timeout(timeout, mq.connect())
        .await
        .map_err(|_| anyhow!("broker not reachable within {}s", args.connect_timeout_secs))??;

    match args.command {
        Command::Publish { topic, bodies } => {
            for body in &bodies {
                mq.publish(&topic, body.as_bytes()).await?;
            }
            info!(topic = %topic, count = bodies.len(), "Published");
        }
        Command::Listen { topic } => {
            let mut listener = tokio::spawn({
                let mq = Arc::clone(&mq);
                async move { mq.listen(&topic, print_and_ack).await }
            });

            let interrupted = tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    true
                }
                joined = &mut listener => {
                    joined??;
                    false
                }
            };

            if interrupted {
                info!("Shutting down");
                mq.cancel();
                listener.await??;
            }
        }
    }

    mq.close().await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "shardmq=info,tower_http=debug".into()),
    );
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Logs go to stderr; stdout carries message bodies.
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn print_and_ack(envelope: Envelope) -> Result<()> {
    println!("{}", String::from_utf8_lossy(envelope.body()));
    envelope.acknowledge().await?;
    Ok(())
}

async fn serve(addr: SocketAddr, state: Arc<AppState>) -> Result<()> {
    let app = api::router(state);

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
