pub mod transaction;

use sea_orm::{Database, DatabaseConnection, DatabaseTransaction};

use crate::config::Config;
use crate::error::{AppError, AppResult};

pub use transaction::TransactionCoordinator;

pub async fn connect(config: &Config) -> AppResult<DatabaseConnection> {
    Database::connect(&config.database_url)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to connect to database: {}", e)))
}

/// Where a repository call runs: straight on the pool, or inside an open
/// unit of work. Repositories take this explicitly instead of looking the
/// transaction up from ambient state.
#[derive(Clone, Copy)]
pub enum Executor<'a> {
    Pool(&'a DatabaseConnection),
    Tx(&'a DatabaseTransaction),
}

impl<'a> Executor<'a> {
    pub fn is_transactional(&self) -> bool {
        matches!(self, Executor::Tx(_))
    }
}

impl<'a> From<&'a DatabaseConnection> for Executor<'a> {
    fn from(db: &'a DatabaseConnection) -> Self {
        Executor::Pool(db)
    }
}

impl<'a> From<&'a DatabaseTransaction> for Executor<'a> {
    fn from(tx: &'a DatabaseTransaction) -> Self {
        Executor::Tx(tx)
    }
}

/// Runs `$body` with `$conn` bound to whichever connection the executor
/// wraps. Both arms are monomorphised, so `$body` may use any
/// `ConnectionTrait` API.
#[macro_export]
macro_rules! on_executor {
    ($exec:expr, |$conn:ident| $body:expr) => {
        match $exec {
            $crate::db::Executor::Pool($conn) => $body,
            $crate::db::Executor::Tx($conn) => $body,
        }
    };
}
