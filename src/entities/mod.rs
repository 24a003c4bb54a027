pub mod coordinate;
pub mod ride;
pub mod ride_counter;
