use std::future::Future;
use std::pin::Pin;

use sea_orm::{DatabaseConnection, TransactionError, TransactionTrait};

use crate::db::Executor;
use crate::error::{AppError, AppResult};

/// Boxed unit-of-work body, borrowing the open transaction for `'c`
pub type WorkFuture<'c, T> = Pin<Box<dyn Future<Output = AppResult<T>> + Send + 'c>>;

/// Groups repository calls into one atomic unit of work.
#[derive(Clone)]
pub struct TransactionCoordinator {
    db: DatabaseConnection,
}

impl TransactionCoordinator {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Executor for calls that do not need to join a unit of work
    pub fn pool(&self) -> Executor<'_> {
        Executor::Pool(&self.db)
    }

    /// Begins a transaction, hands it to `work`, commits when `work`
    /// succeeds and rolls back when it fails. The error from `work` is
    /// returned unchanged.
    pub async fn run<T, F>(&self, work: F) -> AppResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(Executor<'c>) -> WorkFuture<'c, T> + Send,
    {
        self.db
            .transaction::<_, T, AppError>(|txn| work(Executor::Tx(txn)))
            .await
            .map_err(|e| match e {
                TransactionError::Connection(db_err) => AppError::Database(db_err),
                TransactionError::Transaction(err) => err,
            })
    }
}
