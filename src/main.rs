use std::net::SocketAddr;
use std::sync::Arc;

use sea_orm_migration::MigratorTrait;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ride_dispatch::{
    config::Config,
    db::{self, TransactionCoordinator},
    events::InMemoryBus,
    realtime::PassengerConnectionManager,
    routes,
    services::ride::{EventChannels, Repositories},
    services::RideService,
    utils::cancel::CancelToken,
    AppState,
};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ride_dispatch=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env().expect("Invalid configuration");
    tracing::info!("Starting server at {}", config.server_addr());

    // Connect to database
    let db = db::connect(&config)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Connected to database");

    // Run migrations
    migration::Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");
    tracing::info!("Migrations complete");

    // Loopback bus with the dispatch topology
    let bus = InMemoryBus::with_default_topology().await;
    let events = EventChannels::in_memory(&bus);
    events.start().await.expect("Failed to bind event queues");

    let shutdown = CancelToken::new();
    let passengers = Arc::new(PassengerConnectionManager::new(shutdown.child()));

    let rides = Arc::new(
        RideService::new(
            TransactionCoordinator::new(db),
            Repositories::sea_orm(),
            events,
            passengers.clone(),
        )
        .with_retry_policy(config.retry_policy())
        .with_workers(config.dispatch_workers),
    );
    let consumers = tokio::spawn(rides.clone().start(shutdown.child()));

    // Create app state
    let state = AppState {
        config: config.clone(),
        rides,
        passengers: passengers.clone(),
    };

    // Create router with middleware
    let app = routes::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr: SocketAddr = config.server_addr().parse().expect("Invalid address");
    let listener = TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", addr);

    // Cancelling the root token also closes live sockets, which lets the
    // server drain
    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            stop.cancel();
        })
        .await
        .expect("Failed to start server");

    if let Err(e) = consumers.await {
        tracing::warn!(error = %e, "Consumer task ended abnormally");
    }
    passengers.shutdown().await;
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Unable to listen for shutdown signal"),
    }
}
