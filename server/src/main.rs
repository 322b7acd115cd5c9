use anyhow::Result;
use clap::Parser;
use crawler::fetch::build_client;
use crawler::supervisor::CrawlRegistry;
use search_core::store::PostingStore;
use server::config::AppConfig;
use server::{build_app, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "server")]
#[command(about = "Crawl configured sites and serve ranked lemma search")]
struct Args {
    /// Path to the JSON config file (site seeds + HTTP settings)
    #[arg(long, default_value = "./search_config.json")]
    config: String,
    /// Index database directory
    #[arg(long, default_value = "./data")]
    data: String,
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to bind
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let config = AppConfig::load(&args.config)?;
    let store = Arc::new(PostingStore::open(&args.data)?);
    let client = build_client(&config.http)?;
    let state = AppState {
        store,
        registry: Arc::new(CrawlRegistry::new()),
        config: Arc::new(config),
        client,
    };
    let app = build_app(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
