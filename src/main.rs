use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cherry_bot::config::Config;
use cherry_bot::engine::{self, Core};
use cherry_bot::gerrit::rest::RestGerrit;
use cherry_bot::recovery;
use cherry_bot::server::{build_router, AppState};
use cherry_bot::store::Store;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cherry_bot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            std::process::exit(1);
        }
    };

    let store = match Store::open(&config.database_path) {
        Ok(store) => store,
        Err(error) => {
            eprintln!(
                "cannot open database {}: {error}",
                config.database_path.display()
            );
            std::process::exit(1);
        }
    };

    let gerrit = Arc::new(RestGerrit::new(&config.gerrit));
    let (tx, rx) = mpsc::unbounded_channel();
    let core = Core::new(store, gerrit, config.admin_address.clone(), tx);

    let shutdown = CancellationToken::new();
    tokio::spawn(engine::run(Arc::clone(&core), rx, shutdown.clone()));

    match recovery::run(&core).await {
        Ok(summary) => tracing::info!(?summary, "recovery complete"),
        Err(error) => {
            eprintln!("startup recovery failed: {error}");
            std::process::exit(1);
        }
    }

    let app = build_router(AppState::new(core, config.allowed_callers.clone()));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}
