use std::fmt;
use std::str::FromStr;

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideType {
    #[sea_orm(string_value = "ECONOMY")]
    Economy,
    #[sea_orm(string_value = "PREMIUM")]
    Premium,
    #[sea_orm(string_value = "XL")]
    Xl,
}

impl RideType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideType::Economy => "ECONOMY",
            RideType::Premium => "PREMIUM",
            RideType::Xl => "XL",
        }
    }
}

impl fmt::Display for RideType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RideType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ECONOMY" => Ok(RideType::Economy),
            "PREMIUM" => Ok(RideType::Premium),
            "XL" => Ok(RideType::Xl),
            other => Err(format!("unknown ride type: {}", other)),
        }
    }
}

/// Ride lifecycle. Declaration order is the phase order; `Cancelled` sits
/// outside it and is reachable from every non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    #[sea_orm(string_value = "REQUESTED")]
    Requested,
    #[sea_orm(string_value = "MATCHED")]
    Matched,
    #[sea_orm(string_value = "EN_ROUTE")]
    EnRoute,
    #[sea_orm(string_value = "ARRIVED")]
    Arrived,
    #[sea_orm(string_value = "IN_PROGRESS")]
    InProgress,
    #[sea_orm(string_value = "COMPLETED")]
    Completed,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Requested => "REQUESTED",
            RideStatus::Matched => "MATCHED",
            RideStatus::EnRoute => "EN_ROUTE",
            RideStatus::Arrived => "ARRIVED",
            RideStatus::InProgress => "IN_PROGRESS",
            RideStatus::Completed => "COMPLETED",
            RideStatus::Cancelled => "CANCELLED",
        }
    }

    fn phase(&self) -> Option<u8> {
        match self {
            RideStatus::Requested => Some(0),
            RideStatus::Matched => Some(1),
            RideStatus::EnRoute => Some(2),
            RideStatus::Arrived => Some(3),
            RideStatus::InProgress => Some(4),
            RideStatus::Completed => Some(5),
            RideStatus::Cancelled => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: RideStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.phase(), next.phase()) {
            (_, None) => true,
            (Some(current), Some(next)) => next > current,
            (None, Some(_)) => false,
        }
    }

    /// Every status a ride may be in for a move to `self` to be legal
    pub fn predecessors(&self) -> Vec<RideStatus> {
        use sea_orm::Iterable;

        RideStatus::iter()
            .filter(|from| from.can_transition_to(*self))
            .collect()
    }

    /// The write-once phase timestamp a move into this status stamps
    pub fn timestamp_column(&self) -> Option<Column> {
        match self {
            RideStatus::Requested => Some(Column::RequestedAt),
            RideStatus::Matched => Some(Column::MatchedAt),
            RideStatus::EnRoute => None,
            RideStatus::Arrived => Some(Column::ArrivedAt),
            RideStatus::InProgress => Some(Column::StartedAt),
            RideStatus::Completed => Some(Column::CompletedAt),
            RideStatus::Cancelled => Some(Column::CancelledAt),
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ride")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub ride_number: String,
    pub passenger_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub vehicle_type: RideType,
    pub status: RideStatus,
    pub priority: i32,
    pub requested_at: Option<DateTimeWithTimeZone>,
    pub matched_at: Option<DateTimeWithTimeZone>,
    pub arrived_at: Option<DateTimeWithTimeZone>,
    pub started_at: Option<DateTimeWithTimeZone>,
    pub completed_at: Option<DateTimeWithTimeZone>,
    pub cancelled_at: Option<DateTimeWithTimeZone>,
    pub cancellation_reason: Option<String>,
    pub estimated_fare: f64,
    pub final_fare: Option<f64>,
    pub pickup_coordinate_id: Uuid,
    pub destination_coordinate_id: Uuid,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::coordinate::Entity",
        from = "Column::PickupCoordinateId",
        to = "super::coordinate::Column::Id"
    )]
    PickupCoordinate,
    #[sea_orm(
        belongs_to = "super::coordinate::Entity",
        from = "Column::DestinationCoordinateId",
        to = "super::coordinate::Column::Id"
    )]
    DestinationCoordinate,
}

impl ActiveModelBehavior for ActiveModel {}
