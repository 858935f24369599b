use axum::http::{HeaderValue, Method, header};
use scrivener_core::ownership::{Coordinator, NodeInfo, SqliteCoordinator};
use scrivener_core::storage::SqliteStorage;
use scrivener_server::{
    cluster,
    config::Config,
    router,
    sync::{SessionManager, SessionStores},
};
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scrivener_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Scrivener Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Node: {} advertised at {}", config.node_id, config.advertise_addr);
    info!("Database path: {:?}", config.database_path);
    info!("CORS origins: {:?}", config.cors_origins);

    // Initialize storage and coordination, shared by every node
    let storage = match SqliteStorage::open(&config.database_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };
    let coordinator: Arc<dyn Coordinator> =
        match SqliteCoordinator::open(&config.database_path, config.virtual_nodes) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                error!("Failed to open coordinator: {}", e);
                std::process::exit(1);
            }
        };

    let node = NodeInfo::new(config.node_id.clone(), config.advertise_addr.clone());
    let stores = SessionStores {
        log: storage.clone(),
        metadata: storage,
        coordinator: coordinator.clone(),
    };
    let manager = Arc::new(SessionManager::new(
        node.clone(),
        stores,
        config.session_config(),
    ));

    // Join the cluster
    if let Err(e) = coordinator
        .register_node(node)
        .and_then(|_| coordinator.heartbeat(&config.node_id, chrono::Utc::now()))
    {
        error!("Failed to join the cluster: {}", e);
        std::process::exit(1);
    }

    let tasks = [
        cluster::spawn_heartbeat(
            manager.clone(),
            config.heartbeat_interval,
            config.heartbeat_timeout,
        ),
        cluster::spawn_membership_watcher(manager.clone()),
        cluster::spawn_retired_sweeper(manager.clone(), config.retired_grace),
    ];

    // Build CORS layer
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    let cors = if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(AllowOrigin::list(origins))
    };

    let app = router(manager.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Hand documents off before connections are drained
    let shutdown_manager = manager.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_manager.shutdown().await;
        })
        .await;

    for task in tasks {
        task.abort();
    }
    if let Err(e) = result {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
