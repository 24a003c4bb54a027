use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::handlers::{rides, ws};
use crate::middleware::auth::{auth_middleware, require_passenger};
use crate::middleware::request_id::request_context;
use crate::AppState;

pub fn create_router(state: AppState) -> Router {
    // Passenger routes (requires auth + passenger role)
    let ride_routes = Router::new()
        .route("/", post(rides::create_ride))
        .route("/{id}", get(rides::get_ride))
        .route("/{id}/cancel", post(rides::cancel_ride))
        .layer(middleware::from_fn(require_passenger))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    // Live channel; the in-band auth frame must repeat the bearer token
    let ws_routes = Router::new()
        .route("/passengers/{id}", get(ws::passenger_socket))
        .layer(middleware::from_fn(require_passenger))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .nest("/api/rides", ride_routes)
        .nest("/ws", ws_routes)
        .layer(middleware::from_fn(request_context))
        .with_state(state)
}
