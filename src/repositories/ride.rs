use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, Func, OnConflict, Query, SimpleExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set, UpdateResult,
};
use uuid::Uuid;

use crate::db::Executor;
use crate::entities::ride::{self, RideStatus};
use crate::entities::ride_counter;
use crate::error::{AppError, AppResult};
use crate::on_executor;
use crate::repositories::{NewRide, RideRepository};

#[derive(Debug, Clone, Copy, Default)]
pub struct SeaRideRepository;

impl SeaRideRepository {
    /// Explains why a guarded update touched no row
    async fn rejected_update(&self, exec: Executor<'_>, id: Uuid, to: RideStatus) -> AppError {
        match self.get_ride(exec, id).await {
            Ok(current) => AppError::InvalidState(format!(
                "ride {} cannot move from {} to {}",
                id, current.status, to
            )),
            Err(e) => e,
        }
    }

    /// Moves the ride to `status` only while its stored status is one of
    /// `allowed_from`
    async fn guarded_update(
        &self,
        exec: Executor<'_>,
        id: Uuid,
        allowed_from: &[RideStatus],
        status: RideStatus,
        reason: Option<String>,
        at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let allowed_from: Vec<&str> = allowed_from.iter().map(|s| s.as_str()).collect();

        let mut update = ride::Entity::update_many()
            .col_expr(ride::Column::Status, Expr::value(status.as_str()))
            .col_expr(ride::Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(ride::Column::Id.eq(id))
            .filter(ride::Column::Status.is_in(allowed_from));

        if let (Some(column), Some(at)) = (status.timestamp_column(), at) {
            update = update.col_expr(column, write_once(column, at));
        }
        if let Some(reason) = reason.filter(|r| !r.is_empty()) {
            update = update.col_expr(ride::Column::CancellationReason, Expr::value(reason));
        }

        let result: UpdateResult = on_executor!(exec, |conn| update.exec(conn).await)?;
        if result.rows_affected == 0 {
            return Err(self.rejected_update(exec, id, status).await);
        }
        Ok(())
    }
}

/// `COALESCE(column, value)`: keeps an already-set timestamp
fn write_once(column: ride::Column, at: DateTime<Utc>) -> SimpleExpr {
    Func::coalesce([Expr::col(column).into(), Expr::value(at.fixed_offset())]).into()
}

#[async_trait]
impl RideRepository for SeaRideRepository {
    async fn create_ride(&self, exec: Executor<'_>, r: NewRide) -> AppResult<Uuid> {
        let now = Utc::now().fixed_offset();
        let model = ride::ActiveModel {
            id: Set(Uuid::new_v4()),
            ride_number: Set(r.ride_number),
            passenger_id: Set(r.passenger_id),
            driver_id: Set(None),
            vehicle_type: Set(r.vehicle_type),
            status: Set(RideStatus::Requested),
            priority: Set(1),
            requested_at: Set(Some(now)),
            matched_at: Set(None),
            arrived_at: Set(None),
            started_at: Set(None),
            completed_at: Set(None),
            cancelled_at: Set(None),
            cancellation_reason: Set(None),
            estimated_fare: Set(r.estimated_fare),
            final_fare: Set(None),
            pickup_coordinate_id: Set(r.pickup_coordinate_id),
            destination_coordinate_id: Set(r.destination_coordinate_id),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let inserted = on_executor!(exec, |conn| model.insert(conn).await)?;
        Ok(inserted.id)
    }

    async fn get_ride(&self, exec: Executor<'_>, id: Uuid) -> AppResult<ride::Model> {
        on_executor!(exec, |conn| ride::Entity::find_by_id(id).one(conn).await)?
            .ok_or_else(|| AppError::NotFound(format!("ride {} not found", id)))
    }

    async fn update_ride(
        &self,
        exec: Executor<'_>,
        id: Uuid,
        status: RideStatus,
        reason: Option<String>,
        at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        self.guarded_update(exec, id, &status.predecessors(), status, reason, at)
            .await
    }

    async fn cancel_requested_ride(
        &self,
        exec: Executor<'_>,
        id: Uuid,
        reason: Option<String>,
        cancelled_at: DateTime<Utc>,
    ) -> AppResult<()> {
        self.guarded_update(
            exec,
            id,
            &[RideStatus::Requested],
            RideStatus::Cancelled,
            reason,
            Some(cancelled_at),
        )
        .await
    }

    async fn update_matched_ride(
        &self,
        exec: Executor<'_>,
        id: Uuid,
        driver_id: Uuid,
        matched_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let update = ride::Entity::update_many()
            .col_expr(ride::Column::DriverId, Expr::value(driver_id))
            .col_expr(ride::Column::Status, Expr::value(RideStatus::Matched.as_str()))
            .col_expr(ride::Column::MatchedAt, write_once(ride::Column::MatchedAt, matched_at))
            .col_expr(ride::Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(ride::Column::Id.eq(id))
            .filter(ride::Column::Status.eq(RideStatus::Requested.as_str()));

        let result: UpdateResult = on_executor!(exec, |conn| update.exec(conn).await)?;
        if result.rows_affected == 0 {
            return Err(self.rejected_update(exec, id, RideStatus::Matched).await);
        }
        Ok(())
    }

    async fn generate_ride_number(&self, exec: Executor<'_>) -> AppResult<i32> {
        let day = Utc::now().format("%Y%m%d").to_string();

        let stmt = Query::insert()
            .into_table(ride_counter::Entity)
            .columns([ride_counter::Column::Day, ride_counter::Column::Counter])
            .values([day.into(), 1i32.into()])
            .map_err(|e| AppError::Internal(format!("Failed to build counter insert: {}", e)))?
            .on_conflict(
                OnConflict::column(ride_counter::Column::Day)
                    .value(
                        ride_counter::Column::Counter,
                        Expr::col((ride_counter::Entity, ride_counter::Column::Counter)).add(1),
                    )
                    .to_owned(),
            )
            .returning_col(ride_counter::Column::Counter)
            .to_owned();

        let row = on_executor!(exec, |conn| {
            let backend = conn.get_database_backend();
            conn.query_one(backend.build(&stmt)).await
        })?
        .ok_or_else(|| AppError::Internal("ride counter upsert returned no row".to_string()))?;

        Ok(row.try_get::<i32>("", "counter")?)
    }
}
