pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod events;
pub mod handlers;
pub mod middleware;
pub mod realtime;
pub mod repositories;
pub mod routes;
pub mod services;
pub mod utils;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

pub use config::Config;
pub use error::{AppError, AppResult};

use realtime::PassengerConnectionManager;
use services::RideService;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub rides: Arc<RideService>,
    pub passengers: Arc<PassengerConnectionManager>,
}
