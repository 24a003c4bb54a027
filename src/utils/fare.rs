use crate::entities::ride::RideType;
use crate::error::{AppError, AppResult};
use crate::utils::geo::haversine_distance;

/// Average city speed used for duration estimates
const AVG_SPEED_KMH: f64 = 30.0;

struct Rates {
    base: f64,
    per_km: f64,
    per_minute: f64,
}

fn rates(ride_type: RideType) -> Rates {
    match ride_type {
        RideType::Economy => Rates { base: 500.0, per_km: 100.0, per_minute: 50.0 },
        RideType::Premium => Rates { base: 800.0, per_km: 120.0, per_minute: 60.0 },
        RideType::Xl => Rates { base: 1000.0, per_km: 150.0, per_minute: 75.0 },
    }
}

/// Great-circle distance in kilometers
pub fn distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    haversine_distance(lat1, lon1, lat2, lon2)
}

/// Estimated trip duration in whole minutes
pub fn duration(distance_km: f64) -> i32 {
    (distance_km / AVG_SPEED_KMH * 60.0).round() as i32
}

/// Parses a wire ride type (`ECONOMY`, `PREMIUM`, `XL`)
pub fn parse_ride_type(raw: &str) -> AppResult<RideType> {
    raw.parse().map_err(AppError::Validation)
}

pub fn calculate_fare(ride_type: RideType, distance_km: f64, duration_min: i32) -> f64 {
    let rates = rates(ride_type);
    rates.base + rates.per_km * distance_km + rates.per_minute * f64::from(duration_min)
}
