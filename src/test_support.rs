//! Shared fixtures for the crate's unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::Executor;
use crate::entities::coordinate::{self, EntityType};
use crate::entities::ride::{self, RideStatus, RideType};
use crate::entities::ride_counter;
use crate::error::{AppError, AppResult};
use crate::events::{DriverLocationUpdate, EventPublisher, RideStatusUpdate};
use crate::repositories::{
    CoordinateRepository, NewCoordinate, NewRide, RideRepository, SeaCoordinateRepository,
    SeaRideRepository,
};
use crate::services::PassengerNotifier;
use crate::utils::cancel::CancelToken;
use crate::utils::jwt::{Claims, Role};

/// Fresh in-memory SQLite database with the service schema.
/// A single pooled connection keeps every query on the same database.
pub async fn memory_db() -> DatabaseConnection {
    let mut opts = ConnectOptions::new("sqlite::memory:");
    opts.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(opts).await.unwrap();

    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    db.execute(backend.build(&schema.create_table_from_entity(coordinate::Entity)))
        .await
        .unwrap();
    db.execute(backend.build(&schema.create_table_from_entity(ride::Entity)))
        .await
        .unwrap();
    db.execute(backend.build(&schema.create_table_from_entity(ride_counter::Entity)))
        .await
        .unwrap();

    db
}

/// Persists a `REQUESTED` economy ride for `passenger_id`
pub async fn seed_ride(db: &DatabaseConnection, passenger_id: Uuid) -> ride::Model {
    let exec = Executor::Pool(db);
    let place = |address: &str| NewCoordinate {
        entity_id: passenger_id,
        entity_type: EntityType::Passenger,
        address: address.to_string(),
        latitude: 43.2383,
        longitude: 76.9456,
        fare_amount: 1500.0,
        distance_km: 5.0,
        duration_minutes: 10,
        is_current: true,
    };

    let pickup = SeaCoordinateRepository
        .create_coordinate(exec, place("pickup"))
        .await
        .unwrap();
    let destination = SeaCoordinateRepository
        .create_coordinate(exec, place("destination"))
        .await
        .unwrap();
    let counter = SeaRideRepository.generate_ride_number(exec).await.unwrap();

    let id = SeaRideRepository
        .create_ride(
            exec,
            NewRide {
                ride_number: format!("RIDE_TEST_{:03}", counter),
                passenger_id,
                vehicle_type: RideType::Economy,
                estimated_fare: 1500.0,
                pickup_coordinate_id: pickup,
                destination_coordinate_id: destination,
            },
        )
        .await
        .unwrap();

    SeaRideRepository.get_ride(exec, id).await.unwrap()
}

/// Signs an HS256 token the way the identity service issues them
pub fn create_token(user_id: Uuid, role: Role, secret: &str, expiration_hours: i64) -> AppResult<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id,
        role,
        exp: (now + chrono::Duration::hours(expiration_hours)).timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("Failed to create token: {}", e)))
}

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// Publisher that records every message, or rejects all of them
#[derive(Default)]
pub struct RecordingPublisher {
    fail: bool,
    published: Mutex<Vec<Published>>,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            published: Mutex::default(),
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> AppResult<()> {
        if self.fail {
            return Err(AppError::Transport("broker unavailable".to_string()));
        }
        self.published.lock().unwrap().push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
        });
        Ok(())
    }
}

#[derive(Debug)]
pub enum Pushed {
    Status(Uuid, RideStatusUpdate),
    Location(Uuid, DriverLocationUpdate),
}

/// Notifier that forwards every push to a channel the test reads
pub struct RecordingNotifier {
    tx: mpsc::UnboundedSender<Pushed>,
}

impl RecordingNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Pushed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PassengerNotifier for RecordingNotifier {
    async fn send_ride_status_update(
        &self,
        _cancel: &CancelToken,
        passenger_id: Uuid,
        update: RideStatusUpdate,
    ) -> AppResult<()> {
        let _ = self.tx.send(Pushed::Status(passenger_id, update));
        Ok(())
    }

    async fn send_driver_location_update(
        &self,
        _cancel: &CancelToken,
        passenger_id: Uuid,
        update: DriverLocationUpdate,
    ) -> AppResult<()> {
        let _ = self.tx.send(Pushed::Location(passenger_id, update));
        Ok(())
    }
}

/// Coordinate repository whose n-th insert (1-based) fails after the
/// earlier ones went through to the database
pub struct FaultyCoordinates {
    fail_on: usize,
    calls: AtomicUsize,
}

impl FaultyCoordinates {
    pub fn failing_call(fail_on: usize) -> Self {
        Self {
            fail_on,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CoordinateRepository for FaultyCoordinates {
    async fn create_coordinate(&self, exec: Executor<'_>, c: NewCoordinate) -> AppResult<Uuid> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(AppError::Internal("injected coordinate failure".to_string()));
        }
        SeaCoordinateRepository.create_coordinate(exec, c).await
    }

    async fn get_coordinate(&self, exec: Executor<'_>, id: Uuid) -> AppResult<coordinate::Model> {
        SeaCoordinateRepository.get_coordinate(exec, id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideFault {
    RideNumber,
    CreateRide,
}

pub struct FaultyRides {
    fault: RideFault,
}

impl FaultyRides {
    pub fn new(fault: RideFault) -> Self {
        Self { fault }
    }
}

#[async_trait]
impl RideRepository for FaultyRides {
    async fn create_ride(&self, exec: Executor<'_>, r: NewRide) -> AppResult<Uuid> {
        if self.fault == RideFault::CreateRide {
            return Err(AppError::Internal("injected ride failure".to_string()));
        }
        SeaRideRepository.create_ride(exec, r).await
    }

    async fn get_ride(&self, exec: Executor<'_>, id: Uuid) -> AppResult<ride::Model> {
        SeaRideRepository.get_ride(exec, id).await
    }

    async fn update_ride(
        &self,
        exec: Executor<'_>,
        id: Uuid,
        status: RideStatus,
        reason: Option<String>,
        at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        SeaRideRepository.update_ride(exec, id, status, reason, at).await
    }

    async fn cancel_requested_ride(
        &self,
        exec: Executor<'_>,
        id: Uuid,
        reason: Option<String>,
        cancelled_at: DateTime<Utc>,
    ) -> AppResult<()> {
        SeaRideRepository
            .cancel_requested_ride(exec, id, reason, cancelled_at)
            .await
    }

    async fn update_matched_ride(
        &self,
        exec: Executor<'_>,
        id: Uuid,
        driver_id: Uuid,
        matched_at: DateTime<Utc>,
    ) -> AppResult<()> {
        SeaRideRepository
            .update_matched_ride(exec, id, driver_id, matched_at)
            .await
    }

    async fn generate_ride_number(&self, exec: Executor<'_>) -> AppResult<i32> {
        if self.fault == RideFault::RideNumber {
            return Err(AppError::Internal("injected counter failure".to_string()));
        }
        SeaRideRepository.generate_ride_number(exec).await
    }
}

/// Ride repository that assigns `driver_id` right after the first ride
/// read, as a driver match arriving between a caller's check and its write
pub struct MatchAfterRead {
    driver_id: Uuid,
    fired: AtomicBool,
}

impl MatchAfterRead {
    pub fn new(driver_id: Uuid) -> Self {
        Self {
            driver_id,
            fired: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RideRepository for MatchAfterRead {
    async fn create_ride(&self, exec: Executor<'_>, r: NewRide) -> AppResult<Uuid> {
        SeaRideRepository.create_ride(exec, r).await
    }

    async fn get_ride(&self, exec: Executor<'_>, id: Uuid) -> AppResult<ride::Model> {
        let ride = SeaRideRepository.get_ride(exec, id).await?;
        if !self.fired.swap(true, Ordering::SeqCst) {
            SeaRideRepository
                .update_matched_ride(exec, id, self.driver_id, Utc::now())
                .await?;
        }
        Ok(ride)
    }

    async fn update_ride(
        &self,
        exec: Executor<'_>,
        id: Uuid,
        status: RideStatus,
        reason: Option<String>,
        at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        SeaRideRepository.update_ride(exec, id, status, reason, at).await
    }

    async fn cancel_requested_ride(
        &self,
        exec: Executor<'_>,
        id: Uuid,
        reason: Option<String>,
        cancelled_at: DateTime<Utc>,
    ) -> AppResult<()> {
        SeaRideRepository
            .cancel_requested_ride(exec, id, reason, cancelled_at)
            .await
    }

    async fn update_matched_ride(
        &self,
        exec: Executor<'_>,
        id: Uuid,
        driver_id: Uuid,
        matched_at: DateTime<Utc>,
    ) -> AppResult<()> {
        SeaRideRepository
            .update_matched_ride(exec, id, driver_id, matched_at)
            .await
    }

    async fn generate_ride_number(&self, exec: Executor<'_>) -> AppResult<i32> {
        SeaRideRepository.generate_ride_number(exec).await
    }
}
