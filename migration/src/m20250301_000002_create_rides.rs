use sea_orm_migration::{prelude::*, schema::*};

use super::m20250301_000001_create_coordinates::Coordinate;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Ride::Table)
                    .if_not_exists()
                    .col(uuid(Ride::Id).primary_key())
                    .col(string(Ride::RideNumber).not_null().unique_key())
                    .col(uuid(Ride::PassengerId).not_null())
                    .col(uuid_null(Ride::DriverId))
                    .col(string(Ride::VehicleType).not_null())
                    .col(string(Ride::Status).not_null().default("REQUESTED"))
                    .col(integer(Ride::Priority).not_null().default(1))
                    .col(timestamp_with_time_zone_null(Ride::RequestedAt))
                    .col(timestamp_with_time_zone_null(Ride::MatchedAt))
                    .col(timestamp_with_time_zone_null(Ride::ArrivedAt))
                    .col(timestamp_with_time_zone_null(Ride::StartedAt))
                    .col(timestamp_with_time_zone_null(Ride::CompletedAt))
                    .col(timestamp_with_time_zone_null(Ride::CancelledAt))
                    .col(text_null(Ride::CancellationReason))
                    .col(double(Ride::EstimatedFare).not_null())
                    .col(double_null(Ride::FinalFare))
                    .col(uuid(Ride::PickupCoordinateId).not_null())
                    .col(uuid(Ride::DestinationCoordinateId).not_null())
                    .col(
                        timestamp_with_time_zone(Ride::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Ride::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_ride_pickup_coordinate")
                            .from(Ride::Table, Ride::PickupCoordinateId)
                            .to(Coordinate::Table, Coordinate::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_ride_destination_coordinate")
                            .from(Ride::Table, Ride::DestinationCoordinateId)
                            .to(Coordinate::Table, Coordinate::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_ride_passenger_status")
                    .table(Ride::Table)
                    .col(Ride::PassengerId)
                    .col(Ride::Status)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Ride::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Ride {
    Table,
    Id,
    RideNumber,
    PassengerId,
    DriverId,
    VehicleType,
    Status,
    Priority,
    RequestedAt,
    MatchedAt,
    ArrivedAt,
    StartedAt,
    CompletedAt,
    CancelledAt,
    CancellationReason,
    EstimatedFare,
    FinalFare,
    PickupCoordinateId,
    DestinationCoordinateId,
    CreatedAt,
    UpdatedAt,
}
