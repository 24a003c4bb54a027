use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tracing::Instrument;
use uuid::Uuid;

use crate::db::TransactionCoordinator;
use crate::entities::coordinate::EntityType;
use crate::entities::ride::{self, RideStatus};
use crate::error::{AppError, AppResult};
use crate::events::{
    ride_request_key, ride_status_key, DriverLocationUpdate, DriverResponseEvent, EventPublisher,
    EventSubscriber, InMemoryBus, Place, RideRequest, RideStatusEvent, RideStatusUpdate,
    DRIVER_EXCHANGE, DRIVER_RESPONSE_BINDING, LOCATION_EXCHANGE, MATCH_TIMEOUT_SECONDS,
    RIDE_EXCHANGE, RIDE_STATUS_BINDING,
};
use crate::repositories::{
    CoordinateRepository, NewCoordinate, NewRide, RideRepository, SeaCoordinateRepository,
    SeaRideRepository,
};
use crate::services::retry::{run_with_retry, RetryPolicy};
use crate::services::PassengerNotifier;
use crate::utils::cancel::CancelToken;
use crate::utils::fare;

/// Who is calling and under which correlation id
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub passenger_id: Uuid,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRideRequest {
    pub pickup_latitude: f64,
    pub pickup_longitude: f64,
    pub pickup_address: String,
    pub destination_latitude: f64,
    pub destination_longitude: f64,
    pub destination_address: String,
    pub ride_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRideResponse {
    pub ride_id: Uuid,
    pub ride_number: String,
    pub status: RideStatus,
    pub estimated_fare: f64,
    pub estimated_duration_minutes: i32,
    pub estimated_distance_km: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloseRideRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseRideResponse {
    pub ride_id: Uuid,
    pub status: RideStatus,
    pub cancelled_at: DateTime<Utc>,
    pub message: String,
}

#[derive(Clone)]
pub struct Repositories {
    pub rides: Arc<dyn RideRepository>,
    pub coordinates: Arc<dyn CoordinateRepository>,
}

impl Repositories {
    pub fn sea_orm() -> Self {
        Self {
            rides: Arc::new(SeaRideRepository),
            coordinates: Arc::new(SeaCoordinateRepository),
        }
    }
}

/// Outbound publisher plus the three inbound topics the service consumes
#[derive(Clone)]
pub struct EventChannels {
    pub publisher: Arc<dyn EventPublisher>,
    pub driver_responses: Arc<dyn EventSubscriber<DriverResponseEvent>>,
    pub driver_locations: Arc<dyn EventSubscriber<DriverLocationUpdate>>,
    pub ride_statuses: Arc<dyn EventSubscriber<RideStatusEvent>>,
}

impl EventChannels {
    pub fn in_memory(bus: &InMemoryBus) -> Self {
        Self {
            publisher: Arc::new(bus.clone()),
            driver_responses: Arc::new(bus.queue(
                "ride_service.driver_responses",
                DRIVER_EXCHANGE,
                DRIVER_RESPONSE_BINDING,
            )),
            driver_locations: Arc::new(bus.queue(
                "ride_service.driver_locations",
                LOCATION_EXCHANGE,
                "",
            )),
            ride_statuses: Arc::new(bus.queue(
                "ride_service.ride_statuses",
                RIDE_EXCHANGE,
                RIDE_STATUS_BINDING,
            )),
        }
    }

    /// Declares every inbound queue
    pub async fn start(&self) -> AppResult<()> {
        self.driver_responses.start().await?;
        self.driver_locations.start().await?;
        self.ride_statuses.start().await?;
        Ok(())
    }
}

pub fn format_ride_number(day: DateTime<Utc>, counter: i32) -> String {
    format!("RIDE_{}_{:03}", day.format("%Y%m%d"), counter)
}

pub struct RideService {
    txm: TransactionCoordinator,
    repos: Repositories,
    events: EventChannels,
    notifier: Arc<dyn PassengerNotifier>,
    retry: RetryPolicy,
    workers: usize,
}

impl RideService {
    pub fn new(
        txm: TransactionCoordinator,
        repos: Repositories,
        events: EventChannels,
        notifier: Arc<dyn PassengerNotifier>,
    ) -> Self {
        Self {
            txm,
            repos,
            events,
            notifier,
            retry: RetryPolicy::default(),
            workers: 16,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Concurrent handlers per pooled topic
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Prices the trip, then persists both coordinates, the ride number and
    /// the ride, and publishes the match request, all in one unit of work.
    #[tracing::instrument(
        skip(self, ctx, req),
        fields(correlation_id = %ctx.correlation_id, passenger_id = %ctx.passenger_id)
    )]
    pub async fn create_ride(
        &self,
        ctx: &RequestContext,
        req: CreateRideRequest,
    ) -> AppResult<CreateRideResponse> {
        let distance_km = fare::distance(
            req.pickup_latitude,
            req.pickup_longitude,
            req.destination_latitude,
            req.destination_longitude,
        );
        let duration_minutes = fare::duration(distance_km);
        let ride_type = fare::parse_ride_type(&req.ride_type)
            .inspect_err(|e| tracing::warn!(error = %e, "Rejected ride request"))?;
        let estimated_fare = fare::calculate_fare(ride_type, distance_km, duration_minutes);

        let passenger_id = ctx.passenger_id;
        let correlation_id = ctx.correlation_id.clone();
        let pickup = Place {
            lat: req.pickup_latitude,
            lng: req.pickup_longitude,
            address: req.pickup_address,
        };
        let destination = Place {
            lat: req.destination_latitude,
            lng: req.destination_longitude,
            address: req.destination_address,
        };
        let rides = self.repos.rides.clone();
        let coordinates = self.repos.coordinates.clone();
        let publisher = self.events.publisher.clone();

        let (ride_id, ride_number) = self
            .txm
            .run(move |exec| {
                Box::pin(async move {
                    let coordinate = |place: &Place| NewCoordinate {
                        entity_id: passenger_id,
                        entity_type: EntityType::Passenger,
                        address: place.address.clone(),
                        latitude: place.lat,
                        longitude: place.lng,
                        fare_amount: estimated_fare,
                        distance_km,
                        duration_minutes,
                        is_current: true,
                    };

                    let pickup_id = coordinates.create_coordinate(exec, coordinate(&pickup)).await?;
                    let destination_id = coordinates
                        .create_coordinate(exec, coordinate(&destination))
                        .await?;

                    let counter = rides.generate_ride_number(exec).await?;
                    let ride_number = format_ride_number(Utc::now(), counter);

                    let ride_id = rides
                        .create_ride(
                            exec,
                            NewRide {
                                ride_number: ride_number.clone(),
                                passenger_id,
                                vehicle_type: ride_type,
                                estimated_fare,
                                pickup_coordinate_id: pickup_id,
                                destination_coordinate_id: destination_id,
                            },
                        )
                        .await?;

                    let request = RideRequest {
                        ride_id,
                        ride_number: ride_number.clone(),
                        pickup,
                        destination,
                        ride_type,
                        estimated_fare,
                        max_distance_km: distance_km,
                        timeout_seconds: MATCH_TIMEOUT_SECONDS,
                        correlation_id,
                    };
                    publisher
                        .publish(RIDE_EXCHANGE, &ride_request_key(ride_type), serde_json::to_vec(&request)?)
                        .await?;

                    Ok::<_, AppError>((ride_id, ride_number))
                })
            })
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Ride creation rolled back"))?;

        tracing::info!(ride_id = %ride_id, ride_number = %ride_number, "Ride requested");

        Ok(CreateRideResponse {
            ride_id,
            ride_number,
            status: RideStatus::Requested,
            estimated_fare,
            estimated_duration_minutes: duration_minutes,
            estimated_distance_km: distance_km,
        })
    }

    /// Cancels a ride that is still waiting for a driver
    #[tracing::instrument(
        skip(self, ctx, req),
        fields(correlation_id = %ctx.correlation_id, ride_id = %ride_id)
    )]
    pub async fn close_ride(
        &self,
        ctx: &RequestContext,
        ride_id: Uuid,
        req: CloseRideRequest,
    ) -> AppResult<CloseRideResponse> {
        let ride = self.get_ride(ctx, ride_id).await?;
        if ride.status != RideStatus::Requested {
            tracing::warn!(status = %ride.status, "Refusing to cancel ride");
            return Err(AppError::InvalidState(format!(
                "ride is {}, only REQUESTED rides can be cancelled",
                ride.status
            )));
        }

        let cancelled_at = Utc::now();
        let reason = Some(req.reason).filter(|r| !r.trim().is_empty());
        let driver_id = ride.driver_id;
        let correlation_id = ctx.correlation_id.clone();
        let rides = self.repos.rides.clone();
        let publisher = self.events.publisher.clone();

        self.txm
            .run(move |exec| {
                Box::pin(async move {
                    // A match that landed after the check above wins
                    rides
                        .cancel_requested_ride(exec, ride_id, reason, cancelled_at)
                        .await?;

                    let update = RideStatusUpdate {
                        ride_id,
                        status: RideStatus::Cancelled,
                        timestamp: cancelled_at,
                        driver_id,
                        correlation_id,
                    };
                    let body = serde_json::to_vec(&update)?;
                    if let Err(e) = publisher
                        .publish(RIDE_EXCHANGE, &ride_status_key(RideStatus::Cancelled), body)
                        .await
                    {
                        // The cancellation stands even if nobody hears about it
                        tracing::error!(error = %e, "Failed to publish ride cancellation");
                    }

                    Ok::<_, AppError>(())
                })
            })
            .await?;

        tracing::info!("Ride cancelled");

        Ok(CloseRideResponse {
            ride_id,
            status: RideStatus::Cancelled,
            cancelled_at,
            message: "Ride cancelled successfully".to_string(),
        })
    }

    /// Loads a ride owned by the calling passenger
    pub async fn get_ride(&self, ctx: &RequestContext, ride_id: Uuid) -> AppResult<ride::Model> {
        let ride = self.repos.rides.get_ride(self.txm.pool(), ride_id).await?;
        if ride.passenger_id != ctx.passenger_id {
            return Err(AppError::Forbidden("ride belongs to another passenger".to_string()));
        }
        Ok(ride)
    }

    /// Runs the three consumers, each under its own retry supervisor, until
    /// `shutdown` fires.
    pub async fn start(self: Arc<Self>, shutdown: CancelToken) {
        tracing::info!(workers = self.workers, "Ride service started");

        tokio::join!(
            run_with_retry(&shutdown, self.retry, "driver_match", |token| {
                self.clone().consume_driver_responses(token)
            }),
            run_with_retry(&shutdown, self.retry, "driver_location", |token| {
                self.clone().consume_driver_locations(token)
            }),
            run_with_retry(&shutdown, self.retry, "ride_status", |token| {
                self.clone().consume_ride_statuses(token)
            }),
        );

        tracing::info!("Ride service stopped");
    }

    async fn consume_driver_responses(self: Arc<Self>, shutdown: CancelToken) -> AppResult<()> {
        let rx = self.events.driver_responses.subscribe().await?;
        let svc = self.clone();
        dispatch_pooled(&shutdown, rx, self.workers, "driver_match", move |event, token| {
            let svc = svc.clone();
            async move { svc.handle_driver_response(&token, event).await }
        })
        .await
    }

    async fn consume_driver_locations(self: Arc<Self>, shutdown: CancelToken) -> AppResult<()> {
        let rx = self.events.driver_locations.subscribe().await?;
        let svc = self.clone();
        dispatch_pooled(&shutdown, rx, self.workers, "driver_location", move |update, token| {
            let svc = svc.clone();
            async move { svc.handle_driver_location(&token, update).await }
        })
        .await
    }

    /// Status events are applied one at a time, in arrival order
    async fn consume_ride_statuses(self: Arc<Self>, shutdown: CancelToken) -> AppResult<()> {
        let mut rx = self.events.ride_statuses.subscribe().await?;
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Ride status consumer stopped");
                    return Ok(());
                }
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                return Err(AppError::Transport("ride status channel closed".to_string()));
            };
            self.handle_ride_status(&shutdown, event).await;
        }
    }

    async fn handle_driver_response(&self, cancel: &CancelToken, event: DriverResponseEvent) {
        let span = tracing::info_span!(
            "driver_match",
            correlation_id = %event.correlation_id,
            ride_id = %event.ride_id,
            driver_id = %event.driver_id,
        );

        async move {
            if !event.accepted {
                tracing::info!("Driver declined ride");
                return;
            }

            let ride = match self.repos.rides.get_ride(self.txm.pool(), event.ride_id).await {
                Ok(ride) => ride,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to load ride for match");
                    return;
                }
            };

            let matched_at = Utc::now();
            if let Err(e) = self
                .repos
                .rides
                .update_matched_ride(self.txm.pool(), ride.id, event.driver_id, matched_at)
                .await
            {
                log_dropped(&e, "Failed to record driver match");
                return;
            }

            let update = RideStatusUpdate {
                ride_id: ride.id,
                status: RideStatus::Matched,
                timestamp: matched_at,
                driver_id: Some(event.driver_id),
                correlation_id: event.correlation_id.clone(),
            };
            if let Err(e) = self
                .notifier
                .send_ride_status_update(cancel, ride.passenger_id, update)
                .await
            {
                tracing::warn!(error = %e, "Failed to push match to passenger");
            }
        }
        .instrument(span)
        .await
    }

    async fn handle_driver_location(&self, cancel: &CancelToken, update: DriverLocationUpdate) {
        let span = tracing::debug_span!(
            "driver_location",
            ride_id = %update.ride_id,
            driver_id = %update.driver_id,
        );

        async move {
            let ride = match self.repos.rides.get_ride(self.txm.pool(), update.ride_id).await {
                Ok(ride) => ride,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to resolve ride for location update");
                    return;
                }
            };

            if let Err(e) = self
                .notifier
                .send_driver_location_update(cancel, ride.passenger_id, update)
                .await
            {
                tracing::debug!(error = %e, "Failed to push driver location");
            }
        }
        .instrument(span)
        .await
    }

    async fn handle_ride_status(&self, cancel: &CancelToken, event: RideStatusEvent) {
        let span = tracing::info_span!(
            "ride_status",
            correlation_id = %event.correlation_id,
            ride_id = %event.ride_id,
            status = %event.status,
        );

        async move {
            let ride = match self.repos.rides.get_ride(self.txm.pool(), event.ride_id).await {
                Ok(ride) => ride,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to load ride for status event");
                    return;
                }
            };

            if let Err(e) = self
                .repos
                .rides
                .update_ride(self.txm.pool(), ride.id, event.status, None, Some(event.timestamp))
                .await
            {
                log_dropped(&e, "Failed to apply status event");
                return;
            }

            let update = RideStatusUpdate {
                driver_id: event.driver_id.or(ride.driver_id),
                ..event
            };
            if let Err(e) = self
                .notifier
                .send_ride_status_update(cancel, ride.passenger_id, update)
                .await
            {
                tracing::warn!(error = %e, "Failed to push status to passenger");
            }
        }
        .instrument(span)
        .await
    }
}

/// Hands each event to `handle` on a pool of at most `workers` concurrent
/// tasks. When the pool is saturated the receive loop waits for a slot.
async fn dispatch_pooled<T, F, Fut>(
    shutdown: &CancelToken,
    mut rx: mpsc::Receiver<T>,
    workers: usize,
    topic: &'static str,
    handle: F,
) -> AppResult<()>
where
    T: Send + 'static,
    F: Fn(T, CancelToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let pool = Arc::new(Semaphore::new(workers.max(1)));

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(topic, "Consumer stopped");
                return Ok(());
            }
            event = rx.recv() => event,
        };
        let Some(event) = event else {
            return Err(AppError::Transport(format!("{} channel closed", topic)));
        };

        let permit = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            permit = pool.clone().acquire_owned() => {
                permit.map_err(|e| AppError::Internal(format!("{} worker pool closed: {}", topic, e)))?
            }
        };

        let task = handle(event, shutdown.clone());
        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
    }
}

/// Stale or out-of-order events are expected under redelivery
fn log_dropped(e: &AppError, message: &str) {
    match e {
        AppError::InvalidState(_) => tracing::warn!(error = %e, "{}, event dropped", message),
        _ => tracing::error!(error = %e, "{}, event dropped", message),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sea_orm::{DatabaseConnection, EntityTrait, PaginatorTrait};
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    use super::*;
    use crate::db::Executor;
    use crate::entities::ride::RideType;
    use crate::entities::{coordinate, ride_counter};
    use crate::events::{DriverInfo, GeoPoint, Vehicle};
    use crate::test_support::{
        memory_db, seed_ride, FaultyCoordinates, FaultyRides, MatchAfterRead, Pushed,
        RecordingNotifier, RecordingPublisher, RideFault,
    };

    struct Harness {
        db: DatabaseConnection,
        bus: InMemoryBus,
        publisher: Arc<RecordingPublisher>,
        pushes: UnboundedReceiver<Pushed>,
        service: Arc<RideService>,
    }

    async fn harness_with(
        repos: impl FnOnce(&DatabaseConnection) -> Repositories,
        publisher: RecordingPublisher,
    ) -> Harness {
        let db = memory_db().await;
        let bus = InMemoryBus::with_default_topology().await;
        let publisher = Arc::new(publisher);
        let (notifier, pushes) = RecordingNotifier::new();

        let events = EventChannels {
            publisher: publisher.clone(),
            ..EventChannels::in_memory(&bus)
        };
        events.start().await.unwrap();

        let service = RideService::new(
            TransactionCoordinator::new(db.clone()),
            repos(&db),
            events,
            Arc::new(notifier),
        )
        .with_workers(4);

        Harness {
            db,
            bus,
            publisher,
            pushes,
            service: Arc::new(service),
        }
    }

    async fn harness() -> Harness {
        harness_with(|_| Repositories::sea_orm(), RecordingPublisher::default()).await
    }

    fn ctx(passenger_id: Uuid) -> RequestContext {
        RequestContext {
            passenger_id,
            correlation_id: "req-test".to_string(),
        }
    }

    fn almaty_trip(ride_type: &str) -> CreateRideRequest {
        CreateRideRequest {
            pickup_latitude: 43.2383,
            pickup_longitude: 76.9456,
            pickup_address: "Abay Ave 10".to_string(),
            destination_latitude: 43.2220,
            destination_longitude: 76.8512,
            destination_address: "Almaty-1 station".to_string(),
            ride_type: ride_type.to_string(),
        }
    }

    async fn row_counts(db: &DatabaseConnection) -> (u64, u64, u64) {
        (
            ride::Entity::find().count(db).await.unwrap(),
            coordinate::Entity::find().count(db).await.unwrap(),
            ride_counter::Entity::find().count(db).await.unwrap(),
        )
    }

    async fn next_push(pushes: &mut UnboundedReceiver<Pushed>) -> Pushed {
        timeout(Duration::from_secs(2), pushes.recv())
            .await
            .expect("no push arrived")
            .expect("notifier dropped")
    }

    async fn publish_json<T: Serialize>(bus: &InMemoryBus, exchange: &str, key: &str, event: &T) {
        bus.publish(exchange, key, serde_json::to_vec(event).unwrap())
            .await
            .unwrap();
    }

    fn driver_response(ride_id: Uuid, driver_id: Uuid, accepted: bool) -> DriverResponseEvent {
        DriverResponseEvent {
            ride_id,
            driver_id,
            accepted,
            estimated_arrival_minutes: 3,
            driver_location: GeoPoint { lat: 43.24, lng: 76.94 },
            driver_info: DriverInfo {
                name: "Aidar".to_string(),
                rating: 4.8,
                vehicle: Vehicle {
                    make: "Toyota".to_string(),
                    model: "Camry".to_string(),
                    color: "white".to_string(),
                    plate: "777AAA02".to_string(),
                },
            },
            correlation_id: "match-1".to_string(),
        }
    }

    fn status_event(ride_id: Uuid, status: RideStatus) -> RideStatusEvent {
        RideStatusEvent {
            ride_id,
            status,
            timestamp: Utc::now(),
            driver_id: None,
            correlation_id: format!("status-{}", status),
        }
    }

    #[test]
    fn test_ride_number_format() {
        let day = DateTime::parse_from_rfc3339("2025-03-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_ride_number(day, 7), "RIDE_20250301_007");
        assert_eq!(format_ride_number(day, 1234), "RIDE_20250301_1234");
    }

    #[tokio::test]
    async fn test_create_ride_persists_and_publishes_match_request() {
        let h = harness().await;
        let passenger = Uuid::new_v4();

        let resp = h.service.create_ride(&ctx(passenger), almaty_trip("ECONOMY")).await.unwrap();

        assert_eq!(resp.status, RideStatus::Requested);
        assert!(resp.ride_number.starts_with("RIDE_"));
        assert!(resp.ride_number.ends_with("_001"));
        assert!(resp.estimated_distance_km > 7.0 && resp.estimated_distance_km < 9.0);
        assert_eq!(
            resp.estimated_fare,
            fare::calculate_fare(RideType::Economy, resp.estimated_distance_km, resp.estimated_duration_minutes)
        );
        assert_eq!(row_counts(&h.db).await, (1, 2, 1));

        let stored = SeaRideRepository
            .get_ride(Executor::Pool(&h.db), resp.ride_id)
            .await
            .unwrap();
        assert_eq!(stored.passenger_id, passenger);
        assert_eq!(stored.ride_number, resp.ride_number);

        let coordinates = coordinate::Entity::find().all(&h.db).await.unwrap();
        assert!(coordinates.iter().all(|c| c.entity_id == passenger && c.is_current));

        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, RIDE_EXCHANGE);
        assert_eq!(published[0].routing_key, "ride.request.ECONOMY");
        let request: RideRequest = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(request.ride_id, resp.ride_id);
        assert_eq!(request.timeout_seconds, 30);
        assert_eq!(request.correlation_id, "req-test");
        assert_eq!(request.destination.address, "Almaty-1 station");
    }

    #[tokio::test]
    async fn test_unknown_ride_type_writes_and_publishes_nothing() {
        let h = harness().await;

        let err = h
            .service
            .create_ride(&ctx(Uuid::new_v4()), almaty_trip("HELICOPTER"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(row_counts(&h.db).await, (0, 0, 0));
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_failure_at_any_step_leaves_no_rows() {
        let faults: Vec<(&str, fn(&DatabaseConnection) -> Repositories, bool)> = vec![
            ("pickup coordinate", |_| Repositories {
                rides: Arc::new(SeaRideRepository),
                coordinates: Arc::new(FaultyCoordinates::failing_call(1)),
            }, false),
            ("destination coordinate", |_| Repositories {
                rides: Arc::new(SeaRideRepository),
                coordinates: Arc::new(FaultyCoordinates::failing_call(2)),
            }, false),
            ("ride number", |_| Repositories {
                rides: Arc::new(FaultyRides::new(RideFault::RideNumber)),
                coordinates: Arc::new(SeaCoordinateRepository),
            }, false),
            ("ride row", |_| Repositories {
                rides: Arc::new(FaultyRides::new(RideFault::CreateRide)),
                coordinates: Arc::new(SeaCoordinateRepository),
            }, false),
            ("publish", |_| Repositories::sea_orm(), true),
        ];

        for (step, repos, fail_publish) in faults {
            let publisher = if fail_publish {
                RecordingPublisher::failing()
            } else {
                RecordingPublisher::default()
            };
            let h = harness_with(repos, publisher).await;

            let result = h.service.create_ride(&ctx(Uuid::new_v4()), almaty_trip("PREMIUM")).await;

            assert!(result.is_err(), "{} failure should fail the call", step);
            assert_eq!(row_counts(&h.db).await, (0, 0, 0), "{} failure left rows", step);
        }
    }

    #[tokio::test]
    async fn test_close_requested_ride() {
        let h = harness().await;
        let passenger = Uuid::new_v4();
        let ride = seed_ride(&h.db, passenger).await;

        let resp = h
            .service
            .close_ride(&ctx(passenger), ride.id, CloseRideRequest { reason: "changed plans".to_string() })
            .await
            .unwrap();

        assert_eq!(resp.status, RideStatus::Cancelled);
        assert_eq!(resp.ride_id, ride.id);

        let stored = SeaRideRepository.get_ride(Executor::Pool(&h.db), ride.id).await.unwrap();
        assert_eq!(stored.status, RideStatus::Cancelled);
        assert_eq!(stored.cancellation_reason.as_deref(), Some("changed plans"));
        assert_eq!(
            stored.cancelled_at.map(|t| t.timestamp()),
            Some(resp.cancelled_at.timestamp())
        );

        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "ride.status.CANCELLED");
        let update: RideStatusUpdate = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(update.status, RideStatus::Cancelled);
        assert_eq!(update.correlation_id, "req-test");
    }

    #[tokio::test]
    async fn test_close_is_refused_once_matched() {
        let h = harness().await;
        let passenger = Uuid::new_v4();
        let ride = seed_ride(&h.db, passenger).await;
        SeaRideRepository
            .update_matched_ride(Executor::Pool(&h.db), ride.id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        let before = SeaRideRepository.get_ride(Executor::Pool(&h.db), ride.id).await.unwrap();

        let err = h
            .service
            .close_ride(&ctx(passenger), ride.id, CloseRideRequest::default())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidState(_)));
        let after = SeaRideRepository.get_ride(Executor::Pool(&h.db), ride.id).await.unwrap();
        assert_eq!(before, after);
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_close_keeps_first_cancellation() {
        let h = harness().await;
        let passenger = Uuid::new_v4();
        let ride = seed_ride(&h.db, passenger).await;

        let first = h
            .service
            .close_ride(&ctx(passenger), ride.id, CloseRideRequest::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let second = h
            .service
            .close_ride(&ctx(passenger), ride.id, CloseRideRequest::default())
            .await;

        assert!(matches!(second, Err(AppError::InvalidState(_))));
        let stored = SeaRideRepository.get_ride(Executor::Pool(&h.db), ride.id).await.unwrap();
        assert_eq!(
            stored.cancelled_at.map(|t| t.timestamp()),
            Some(first.cancelled_at.timestamp())
        );
    }

    #[tokio::test]
    async fn test_match_landing_before_cancel_write_wins() {
        let driver = Uuid::new_v4();
        let h = harness_with(
            |_| Repositories {
                rides: Arc::new(MatchAfterRead::new(driver)),
                coordinates: Arc::new(SeaCoordinateRepository),
            },
            RecordingPublisher::default(),
        )
        .await;
        let passenger = Uuid::new_v4();
        let ride = seed_ride(&h.db, passenger).await;

        let err = h
            .service
            .close_ride(&ctx(passenger), ride.id, CloseRideRequest::default())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidState(_)));
        let stored = SeaRideRepository.get_ride(Executor::Pool(&h.db), ride.id).await.unwrap();
        assert_eq!(stored.status, RideStatus::Matched);
        assert_eq!(stored.driver_id, Some(driver));
        assert!(stored.matched_at.is_some());
        assert!(stored.cancelled_at.is_none());
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_closes_cancel_once() {
        let h = harness().await;
        let passenger = Uuid::new_v4();
        let ride = seed_ride(&h.db, passenger).await;
        let ctx = ctx(passenger);

        let (first, second) = tokio::join!(
            h.service.close_ride(&ctx, ride.id, CloseRideRequest::default()),
            h.service.close_ride(&ctx, ride.id, CloseRideRequest::default()),
        );

        let (winner, loser) = match (first, second) {
            (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
            (first, second) => panic!("expected exactly one cancellation, got {:?} and {:?}", first, second),
        };
        assert!(matches!(loser, AppError::InvalidState(_)));

        let stored = SeaRideRepository.get_ride(Executor::Pool(&h.db), ride.id).await.unwrap();
        assert_eq!(stored.status, RideStatus::Cancelled);
        assert!(stored.driver_id.is_none());
        assert_eq!(
            stored.cancelled_at.map(|t| t.timestamp()),
            Some(winner.cancelled_at.timestamp())
        );
        assert_eq!(h.publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn test_close_by_another_passenger_is_forbidden() {
        let h = harness().await;
        let ride = seed_ride(&h.db, Uuid::new_v4()).await;

        let err = h
            .service
            .close_ride(&ctx(Uuid::new_v4()), ride.id, CloseRideRequest::default())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_cancellation_survives_publish_failure() {
        let h = harness_with(|_| Repositories::sea_orm(), RecordingPublisher::failing()).await;
        let passenger = Uuid::new_v4();
        let ride = seed_ride(&h.db, passenger).await;

        h.service
            .close_ride(&ctx(passenger), ride.id, CloseRideRequest::default())
            .await
            .unwrap();

        let stored = SeaRideRepository.get_ride(Executor::Pool(&h.db), ride.id).await.unwrap();
        assert_eq!(stored.status, RideStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_accepted_driver_response_matches_ride_and_notifies_passenger() {
        let mut h = harness().await;
        let passenger = Uuid::new_v4();
        let driver = Uuid::new_v4();
        let ride = seed_ride(&h.db, passenger).await;
        let shutdown = CancelToken::new();
        let running = tokio::spawn(h.service.clone().start(shutdown.clone()));

        publish_json(
            &h.bus,
            DRIVER_EXCHANGE,
            &format!("driver.response.{}", driver),
            &driver_response(ride.id, driver, true),
        )
        .await;

        match next_push(&mut h.pushes).await {
            Pushed::Status(to, update) => {
                assert_eq!(to, passenger);
                assert_eq!(update.ride_id, ride.id);
                assert_eq!(update.status, RideStatus::Matched);
                assert_eq!(update.driver_id, Some(driver));
                assert_eq!(update.correlation_id, "match-1");
            }
            other => panic!("unexpected push {:?}", other),
        }

        let stored = SeaRideRepository.get_ride(Executor::Pool(&h.db), ride.id).await.unwrap();
        assert_eq!(stored.status, RideStatus::Matched);
        assert_eq!(stored.driver_id, Some(driver));
        assert!(stored.matched_at.is_some());

        shutdown.cancel();
        timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_declined_driver_response_changes_nothing() {
        let mut h = harness().await;
        let passenger = Uuid::new_v4();
        let ride = seed_ride(&h.db, passenger).await;
        let shutdown = CancelToken::new();
        let running = tokio::spawn(h.service.clone().start(shutdown.clone()));

        publish_json(
            &h.bus,
            DRIVER_EXCHANGE,
            "driver.response.x",
            &driver_response(ride.id, Uuid::new_v4(), false),
        )
        .await;

        assert!(timeout(Duration::from_millis(300), h.pushes.recv()).await.is_err());
        let stored = SeaRideRepository.get_ride(Executor::Pool(&h.db), ride.id).await.unwrap();
        assert_eq!(stored.status, RideStatus::Requested);
        assert!(stored.driver_id.is_none());

        shutdown.cancel();
        timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_driver_location_is_forwarded_to_ride_passenger() {
        let mut h = harness().await;
        let passenger = Uuid::new_v4();
        let ride = seed_ride(&h.db, passenger).await;
        let shutdown = CancelToken::new();
        let running = tokio::spawn(h.service.clone().start(shutdown.clone()));

        let location = DriverLocationUpdate {
            driver_id: Uuid::new_v4(),
            ride_id: ride.id,
            location: GeoPoint { lat: 43.25, lng: 76.92 },
            speed_kmh: 42.0,
            heading_degrees: 180.0,
            timestamp: Utc::now(),
        };
        publish_json(&h.bus, LOCATION_EXCHANGE, "", &location).await;

        match next_push(&mut h.pushes).await {
            Pushed::Location(to, update) => {
                assert_eq!(to, passenger);
                assert_eq!(update, location);
            }
            other => panic!("unexpected push {:?}", other),
        }

        shutdown.cancel();
        timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_status_events_apply_in_order_and_skip_backward_moves() {
        let mut h = harness().await;
        let passenger = Uuid::new_v4();
        let ride = seed_ride(&h.db, passenger).await;
        let shutdown = CancelToken::new();
        let running = tokio::spawn(h.service.clone().start(shutdown.clone()));

        let arrived = status_event(ride.id, RideStatus::Arrived);
        for status in [RideStatus::Arrived, RideStatus::Matched, RideStatus::Completed] {
            let event = if status == RideStatus::Arrived {
                arrived.clone()
            } else {
                status_event(ride.id, status)
            };
            publish_json(&h.bus, RIDE_EXCHANGE, &ride_status_key(status), &event).await;
        }

        let mut seen = Vec::new();
        for _ in 0..2 {
            match next_push(&mut h.pushes).await {
                Pushed::Status(to, update) => {
                    assert_eq!(to, passenger);
                    seen.push(update.status);
                }
                other => panic!("unexpected push {:?}", other),
            }
        }
        assert_eq!(seen, vec![RideStatus::Arrived, RideStatus::Completed]);
        assert!(timeout(Duration::from_millis(200), h.pushes.recv()).await.is_err());

        let stored = SeaRideRepository.get_ride(Executor::Pool(&h.db), ride.id).await.unwrap();
        assert_eq!(stored.status, RideStatus::Completed);
        assert!(stored.matched_at.is_none());
        assert_eq!(
            stored.arrived_at.map(|t| t.timestamp()),
            Some(arrived.timestamp.timestamp())
        );
        assert!(stored.completed_at.is_some());

        shutdown.cancel();
        timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_start_returns_after_shutdown() {
        let h = harness().await;
        let shutdown = CancelToken::new();
        let running = tokio::spawn(h.service.clone().start(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
    }
}
