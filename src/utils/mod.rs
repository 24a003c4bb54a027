pub mod cancel;
pub mod fare;
pub mod geo;
pub mod jwt;
