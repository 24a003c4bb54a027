use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppResult;

pub const AUTH: &str = "auth";
pub const AUTH_SUCCESS: &str = "auth_success";
pub const AUTH_ERROR: &str = "auth_error";
pub const RIDE_STATUS_UPDATE: &str = "ride_status_update";
pub const DRIVER_LOCATION_UPDATE: &str = "driver_location_update";

/// Envelope for every frame exchanged with a passenger client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WsMessage {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            token: None,
            data: None,
        }
    }

    pub fn with_data<T: Serialize>(kind: &str, data: &T) -> AppResult<Self> {
        Ok(Self {
            data: Some(serde_json::to_value(data)?),
            ..Self::new(kind)
        })
    }

    pub fn auth_error(reason: &str) -> Self {
        Self {
            data: Some(Value::String(reason.to_string())),
            ..Self::new(AUTH_ERROR)
        }
    }

    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
