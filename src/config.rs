use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::services::retry::RetryPolicy;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub server_host: String,
    pub server_port: u16,
    /// Concurrent handlers per inbound topic
    pub dispatch_workers: usize,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            jwt_secret: required("JWT_SECRET")?,
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: parsed_or("SERVER_PORT", 3000)?,
            dispatch_workers: parsed_or("DISPATCH_WORKERS", 16)?,
            retry_initial_backoff: Duration::from_millis(parsed_or(
                "RETRY_INITIAL_BACKOFF_MS",
                1000,
            )?),
            retry_max_backoff: Duration::from_millis(parsed_or("RETRY_MAX_BACKOFF_MS", 30_000)?),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_initial_backoff, self.retry_max_backoff)
    }
}

fn required(key: &str) -> AppResult<String> {
    env::var(key).map_err(|_| AppError::Config(format!("{} must be set", key)))
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> AppResult<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("{} must be a number, got {:?}", key, raw))),
        Err(_) => Ok(default),
    }
}
