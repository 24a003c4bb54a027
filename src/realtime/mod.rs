//! Live passenger connections and the push path onto them.

pub mod manager;
pub mod message;

pub use manager::PassengerConnectionManager;
pub use message::WsMessage;
