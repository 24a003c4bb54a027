use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // One row per calendar day; ride numbers restart at 1 each day.
        manager
            .create_table(
                Table::create()
                    .table(RideCounter::Table)
                    .if_not_exists()
                    .col(string(RideCounter::Day).primary_key())
                    .col(integer(RideCounter::Counter).not_null().default(0))
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RideCounter::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum RideCounter {
    Table,
    Day,
    Counter,
}
