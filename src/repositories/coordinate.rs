use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use uuid::Uuid;

use crate::db::Executor;
use crate::entities::coordinate;
use crate::error::{AppError, AppResult};
use crate::on_executor;
use crate::repositories::{CoordinateRepository, NewCoordinate};

#[derive(Debug, Clone, Copy, Default)]
pub struct SeaCoordinateRepository;

#[async_trait]
impl CoordinateRepository for SeaCoordinateRepository {
    async fn create_coordinate(&self, exec: Executor<'_>, c: NewCoordinate) -> AppResult<Uuid> {
        let now = Utc::now().fixed_offset();
        let model = coordinate::ActiveModel {
            id: Set(Uuid::new_v4()),
            entity_id: Set(c.entity_id),
            entity_type: Set(c.entity_type),
            address: Set(c.address),
            latitude: Set(c.latitude),
            longitude: Set(c.longitude),
            fare_amount: Set(c.fare_amount),
            distance_km: Set(c.distance_km),
            duration_minutes: Set(c.duration_minutes),
            is_current: Set(c.is_current),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let inserted = on_executor!(exec, |conn| model.insert(conn).await)?;
        Ok(inserted.id)
    }

    async fn get_coordinate(&self, exec: Executor<'_>, id: Uuid) -> AppResult<coordinate::Model> {
        on_executor!(exec, |conn| coordinate::Entity::find_by_id(id).one(conn).await)?
            .ok_or_else(|| AppError::NotFound(format!("coordinate {} not found", id)))
    }
}
