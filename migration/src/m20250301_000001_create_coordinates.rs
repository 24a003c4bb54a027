use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Coordinate::Table)
                    .if_not_exists()
                    .col(uuid(Coordinate::Id).primary_key())
                    .col(uuid(Coordinate::EntityId).not_null())
                    .col(string(Coordinate::EntityType).not_null())
                    .col(text(Coordinate::Address).not_null())
                    .col(double(Coordinate::Latitude).not_null())
                    .col(double(Coordinate::Longitude).not_null())
                    .col(double(Coordinate::FareAmount).not_null())
                    .col(double(Coordinate::DistanceKm).not_null())
                    .col(integer(Coordinate::DurationMinutes).not_null())
                    .col(boolean(Coordinate::IsCurrent).not_null().default(false))
                    .col(
                        timestamp_with_time_zone(Coordinate::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Coordinate::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_coordinate_entity")
                    .table(Coordinate::Table)
                    .col(Coordinate::EntityId)
                    .col(Coordinate::EntityType)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Coordinate::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Coordinate {
    Table,
    Id,
    EntityId,
    EntityType,
    Address,
    Latitude,
    Longitude,
    FareAmount,
    DistanceKm,
    DurationMinutes,
    IsCurrent,
    CreatedAt,
    UpdatedAt,
}
