pub use sea_orm_migration::prelude::*;

mod m20250301_000001_create_coordinates;
mod m20250301_000002_create_rides;
mod m20250301_000003_create_ride_counters;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_coordinates::Migration),
            Box::new(m20250301_000002_create_rides::Migration),
            Box::new(m20250301_000003_create_ride_counters::Migration),
        ]
    }
}
