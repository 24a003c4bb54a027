//! Persistence ports the ride service depends on.
//!
//! Every method takes the [`Executor`] it must run on, so callers decide
//! whether a call joins an open unit of work or goes straight to the pool.

pub mod coordinate;
pub mod ride;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::Executor;
use crate::entities::coordinate::{self as coordinate_entity, EntityType};
use crate::entities::ride::{self as ride_entity, RideStatus, RideType};
use crate::error::AppResult;

pub use coordinate::SeaCoordinateRepository;
pub use ride::SeaRideRepository;

#[derive(Debug, Clone)]
pub struct NewCoordinate {
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub fare_amount: f64,
    pub distance_km: f64,
    pub duration_minutes: i32,
    pub is_current: bool,
}

#[derive(Debug, Clone)]
pub struct NewRide {
    pub ride_number: String,
    pub passenger_id: Uuid,
    pub vehicle_type: RideType,
    pub estimated_fare: f64,
    pub pickup_coordinate_id: Uuid,
    pub destination_coordinate_id: Uuid,
}

#[async_trait]
pub trait CoordinateRepository: Send + Sync {
    async fn create_coordinate(&self, exec: Executor<'_>, coordinate: NewCoordinate) -> AppResult<Uuid>;

    async fn get_coordinate(&self, exec: Executor<'_>, id: Uuid) -> AppResult<coordinate_entity::Model>;
}

#[async_trait]
pub trait RideRepository: Send + Sync {
    async fn create_ride(&self, exec: Executor<'_>, ride: NewRide) -> AppResult<Uuid>;

    async fn get_ride(&self, exec: Executor<'_>, id: Uuid) -> AppResult<ride_entity::Model>;

    /// Moves a ride to `status`. Only applies when the stored status may
    /// legally move there; the phase timestamp is written only if unset.
    async fn update_ride(
        &self,
        exec: Executor<'_>,
        id: Uuid,
        status: RideStatus,
        reason: Option<String>,
        at: Option<DateTime<Utc>>,
    ) -> AppResult<()>;

    /// Cancels a ride that is still `REQUESTED`. A ride that has moved on
    /// in the meantime is left alone and `InvalidState` is returned.
    async fn cancel_requested_ride(
        &self,
        exec: Executor<'_>,
        id: Uuid,
        reason: Option<String>,
        cancelled_at: DateTime<Utc>,
    ) -> AppResult<()>;

    /// Assigns a driver to a `REQUESTED` ride and marks it `MATCHED`
    async fn update_matched_ride(
        &self,
        exec: Executor<'_>,
        id: Uuid,
        driver_id: Uuid,
        matched_at: DateTime<Utc>,
    ) -> AppResult<()>;

    /// Next value of today's ride counter, allocated atomically
    async fn generate_ride_number(&self, exec: Executor<'_>) -> AppResult<i32>;
}
