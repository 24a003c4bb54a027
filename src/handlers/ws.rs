use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    response::Response,
    Extension,
};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthToken;
use crate::utils::jwt::Claims;
use crate::AppState;

/// Upgrade to the passenger's live channel. The client must then send
/// `{"type":"auth","token":...}` with the same bearer token.
pub async fn passenger_socket(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Extension(AuthToken(token)): Extension<AuthToken>,
    Path(passenger_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    if passenger_id != claims.sub {
        return Err(AppError::Forbidden(
            "Cannot open another passenger's channel".to_string(),
        ));
    }

    Ok(state.passengers.handle_connection(ws, passenger_id, token))
}
