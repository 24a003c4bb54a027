use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use uuid::Uuid;

use crate::entities::ride;
use crate::error::{AppError, AppResult};
use crate::middleware::request_id::RequestId;
use crate::services::ride::{CloseRideRequest, CloseRideResponse, CreateRideRequest, CreateRideResponse};
use crate::services::RequestContext;
use crate::utils::jwt::Claims;
use crate::AppState;

fn request_context(claims: &Claims, request_id: RequestId) -> RequestContext {
    RequestContext {
        passenger_id: claims.sub,
        correlation_id: request_id.0,
    }
}

fn validate_point(label: &str, lat: f64, lng: f64) -> AppResult<()> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return Err(AppError::Validation(format!(
            "{} coordinates out of range: ({}, {})",
            label, lat, lng
        )));
    }
    Ok(())
}

fn validate_trip(req: &CreateRideRequest) -> AppResult<()> {
    validate_point("pickup", req.pickup_latitude, req.pickup_longitude)?;
    validate_point("destination", req.destination_latitude, req.destination_longitude)?;

    if req.pickup_address.trim().is_empty() || req.destination_address.trim().is_empty() {
        return Err(AppError::Validation("Addresses are required".to_string()));
    }

    Ok(())
}

/// Request a ride
pub async fn create_ride(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Extension(request_id): Extension<RequestId>,
    Json(payload): Json<CreateRideRequest>,
) -> AppResult<(StatusCode, Json<CreateRideResponse>)> {
    validate_trip(&payload)?;

    let ctx = request_context(&claims, request_id);
    let ride = state.rides.create_ride(&ctx, payload).await?;

    Ok((StatusCode::CREATED, Json(ride)))
}

/// Get one of the caller's rides
pub async fn get_ride(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Extension(request_id): Extension<RequestId>,
    Path(ride_id): Path<Uuid>,
) -> AppResult<Json<ride::Model>> {
    let ctx = request_context(&claims, request_id);
    let ride = state.rides.get_ride(&ctx, ride_id).await?;
    Ok(Json(ride))
}

/// Cancel a ride that has not been matched yet. The body is optional.
pub async fn cancel_ride(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Extension(request_id): Extension<RequestId>,
    Path(ride_id): Path<Uuid>,
    body: Bytes,
) -> AppResult<Json<CloseRideResponse>> {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        CloseRideRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::Validation(format!("Invalid request body: {}", e)))?
    };

    let ctx = request_context(&claims, request_id);
    let closed = state.rides.close_ride(&ctx, ride_id, payload).await?;

    Ok(Json(closed))
}
