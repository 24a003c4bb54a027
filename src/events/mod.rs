//! Event bus ports and the payloads that cross them.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::entities::ride::{RideStatus, RideType};
use crate::error::AppResult;

pub use memory::{BusQueue, ExchangeKind, InMemoryBus};

pub const RIDE_EXCHANGE: &str = "ride_topic";
pub const DRIVER_EXCHANGE: &str = "driver_topic";
pub const LOCATION_EXCHANGE: &str = "location_fanout";

pub const DRIVER_RESPONSE_BINDING: &str = "driver.response.*";
pub const RIDE_STATUS_BINDING: &str = "ride.status.*";

/// Seconds a driver has to answer a match request
pub const MATCH_TIMEOUT_SECONDS: u32 = 30;

pub fn ride_request_key(ride_type: RideType) -> String {
    format!("ride.request.{}", ride_type)
}

pub fn ride_status_key(status: RideStatus) -> String {
    format!("ride.status.{}", status)
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> AppResult<()>;
}

/// One inbound topic.
///
/// `start` declares the queue and its binding; `subscribe` attaches a
/// consumer and hands back its delivery channel. The channel closing means
/// the subscription is gone and must be re-established.
#[async_trait]
pub trait EventSubscriber<T>: Send + Sync {
    async fn start(&self) -> AppResult<()>;

    async fn subscribe(&self) -> AppResult<mpsc::Receiver<T>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub lat: f64,
    pub lng: f64,
    pub address: String,
}

/// Match request sent to drivers for a newly created ride
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRequest {
    pub ride_id: Uuid,
    pub ride_number: String,
    pub pickup: Place,
    pub destination: Place,
    pub ride_type: RideType,
    pub estimated_fare: f64,
    pub max_distance_km: f64,
    pub timeout_seconds: u32,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub make: String,
    pub model: String,
    pub color: String,
    pub plate: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub name: String,
    pub rating: f64,
    pub vehicle: Vehicle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverResponseEvent {
    pub ride_id: Uuid,
    pub driver_id: Uuid,
    pub accepted: bool,
    pub estimated_arrival_minutes: i32,
    pub driver_location: GeoPoint,
    pub driver_info: DriverInfo,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverLocationUpdate {
    pub driver_id: Uuid,
    pub ride_id: Uuid,
    pub location: GeoPoint,
    pub speed_kmh: f64,
    pub heading_degrees: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideStatusUpdate {
    pub ride_id: Uuid,
    pub status: RideStatus,
    pub timestamp: DateTime<Utc>,
    pub driver_id: Option<Uuid>,
    pub correlation_id: String,
}

/// Inbound status events share the outbound update's shape
pub type RideStatusEvent = RideStatusUpdate;
