pub mod rides;
pub mod ws;
