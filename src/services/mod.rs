pub mod retry;
pub mod ride;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppResult;
use crate::events::{DriverLocationUpdate, RideStatusUpdate};
use crate::utils::cancel::CancelToken;

pub use ride::{RequestContext, RideService};

/// Real-time delivery to a passenger's live connection.
///
/// Delivery is best-effort and at most once. `cancel` bounds how long a
/// caller is willing to wait when the passenger's queue is full.
#[async_trait]
pub trait PassengerNotifier: Send + Sync {
    async fn send_ride_status_update(
        &self,
        cancel: &CancelToken,
        passenger_id: Uuid,
        update: RideStatusUpdate,
    ) -> AppResult<()>;

    async fn send_driver_location_update(
        &self,
        cancel: &CancelToken,
        passenger_id: Uuid,
        update: DriverLocationUpdate,
    ) -> AppResult<()>;
}
