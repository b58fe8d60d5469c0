use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use depthwatch::api::{self, ApiState};
use depthwatch::config::{AppConfig, StoreKind};
use depthwatch::market_data::adapters::coinbase::{CoinbaseProtocol, WsConnector};
use depthwatch::market_data::adapters::ExchangeRegistry;
use depthwatch::market_data::scheduler::PollScheduler;
use depthwatch::market_data::session::StreamSession;
use depthwatch::persist::memory::MemoryStore;
use depthwatch::persist::postgres::PostgresStore;
use depthwatch::persist::sqlite::SqliteStore;
use depthwatch::persist::StateStore;
use depthwatch::push::WatchListPublisher;
use depthwatch::telemetry;

/// Collects order books from crypto exchanges and serves the latest view.
#[derive(Debug, Parser)]
#[command(name = "depthwatch", version)]
struct Cli {
    /// Config file (any format the `config` crate reads; extension optional).
    #[arg(long, default_value = "depthwatch")]
    config: String,
    #[arg(long, value_enum)]
    store: Option<StoreKind>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    listen: Option<SocketAddr>,
}

async fn open_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match cfg.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Sqlite => Arc::new(
            SqliteStore::open(cfg.sqlite_path(), &cfg.exchanges)
                .with_context(|| format!("opening sqlite store at {}", cfg.sqlite_path()))?,
        ),
        StoreKind::Postgres => Arc::new(
            PostgresStore::connect(&cfg.database_url, &cfg.exchanges)
                .await
                .context("connecting postgres store")?,
        ),
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env
    let cli = Cli::parse();
    telemetry::init_tracing("info");

    let mut cfg = AppConfig::load(&cli.config).context("loading configuration")?;
    if let Some(store) = cli.store {
        cfg.store = store;
    }
    if let Some(url) = cli.database_url {
        cfg.database_url = url;
    }
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    telemetry::init_metrics(cfg.metrics_port)?;

    let store = open_store(&cfg).await?;
    info!(store = ?cfg.store, symbols = ?cfg.symbols, "store ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    // REST polling
    let client = reqwest::Client::builder()
        .user_agent(concat!("depthwatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building http client")?;
    let fetchers = ExchangeRegistry::with_builtin_venues().build(&cfg.exchanges, &client, cfg.depth_limit);
    let scheduler = PollScheduler::new(
        fetchers,
        cfg.symbols.clone(),
        Arc::clone(&store),
        cfg.poll_interval(),
        cfg.fetch_timeout(),
    );
    let rx = shutdown_rx.clone();
    tasks.spawn(async move { scheduler.run(rx).await });

    // Authenticated stream; without a credential `run` returns before connecting
    let mut session = StreamSession::new(
        Arc::new(CoinbaseProtocol::new(&cfg.stream.exchange, &cfg.stream.channel)),
        Arc::new(WsConnector::new(&cfg.stream.url)),
        cfg.stream.credentials(),
        cfg.symbols.clone(),
        Arc::clone(&store),
        cfg.stream.session_settings(),
    );
    let rx = shutdown_rx.clone();
    tasks.spawn(async move {
        if let Err(e) = session.run(rx).await {
            warn!(error = %e, "streaming disabled");
        }
    });

    // Push channel + HTTP
    let publisher = WatchListPublisher::new(
        Arc::clone(&store),
        cfg.push.watch_list.clone(),
        cfg.push.quote.clone(),
        cfg.push_interval(),
    );
    let state = ApiState {
        store: Arc::clone(&store),
        quote: cfg.push.quote.clone(),
        exchanges: Arc::new(cfg.exchanges.clone()),
        updates: publisher.sender(),
    };
    let rx = shutdown_rx.clone();
    tasks.spawn(async move { publisher.run(rx).await });

    let listener = tokio::net::TcpListener::bind(cfg.listen)
        .await
        .with_context(|| format!("binding {}", cfg.listen))?;
    info!(addr = %cfg.listen, "http listening");
    let mut rx = shutdown_rx.clone();
    tasks.spawn(async move {
        let shutdown = async move {
            let _ = rx.wait_for(|stop| *stop).await;
        };
        if let Err(e) = axum::serve(listener, api::router(state)).with_graceful_shutdown(shutdown).await {
            error!(error = %e, "http server failed");
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    shutdown_tx.send(true).ok();
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!(error = %e, "task ended abnormally");
        }
    }
    Ok(())
}
