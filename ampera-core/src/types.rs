//! Core types shared across the orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier of a charge point (the id it connects under)
pub type ChargerId = String;

/// Connector number within a charger (1-based; 0 means "the whole charger")
pub type ConnectorId = u32;

/// Transaction identifier, allocated by the central system
pub type TransactionId = i32;

/// RFID card identifier
pub type CardId = String;

/// Pricing group identifier
pub type GroupId = String;

/// Monetary amount in minor currency units
pub type Money = i64;

/// Physical connector type, used as the pricing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectorType {
    Ccs2,
    Chademo,
    Type2,
    Unknown,
}

impl ConnectorType {
    /// Tolerant parse: anything unrecognized prices at the system default.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "CCS2" | "CCS" => ConnectorType::Ccs2,
            "CHADEMO" => ConnectorType::Chademo,
            "TYPE2" | "J1772" | "MENNEKES" => ConnectorType::Type2,
            _ => ConnectorType::Unknown,
        }
    }
}

impl std::fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorType::Ccs2 => write!(f, "CCS2"),
            ConnectorType::Chademo => write!(f, "CHADEMO"),
            ConnectorType::Type2 => write!(f, "TYPE2"),
            ConnectorType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Connector status as tracked by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Charging,
    Faulted,
    Unavailable,
}

impl ConnectorStatus {
    /// A connector in this status refuses new start requests.
    pub fn rejects_start(&self) -> bool {
        matches!(self, ConnectorStatus::Faulted | ConnectorStatus::Unavailable)
    }
}

/// Prepaid card status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Active,
    Inactive,
    Blocked,
}

/// Prepaid RFID card account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RfidCard {
    pub id: CardId,
    /// Card number as presented on the wire (the OCPP idTag)
    pub number: String,
    pub user: String,
    pub balance: Money,
    pub status: CardStatus,
    /// Warn when the balance drops below this after a debit
    pub low_balance_threshold: Money,
    /// Optional pricing group override for this card's user
    pub group: Option<GroupId>,
}

/// Kind of a live event on the dashboard feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChargerConnected,
    ChargerDisconnected,
    TransactionStarted,
    TransactionStopped,
    Status,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::ChargerConnected => "charger_connected",
            EventKind::ChargerDisconnected => "charger_disconnected",
            EventKind::TransactionStarted => "transaction_started",
            EventKind::TransactionStopped => "transaction_stopped",
            EventKind::Status => "status",
        };
        write!(f, "{}", s)
    }
}

/// Ephemeral event broadcast to dashboard observers. Not persisted;
/// observers resynchronize via the snapshot endpoint after a gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveEvent {
    pub event: EventKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl LiveEvent {
    pub fn new(event: EventKind, data: Value) -> Self {
        Self {
            event,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn charger_connected(charger_id: &str) -> Self {
        Self::new(
            EventKind::ChargerConnected,
            serde_json::json!({ "chargerId": charger_id }),
        )
    }

    pub fn charger_disconnected(charger_id: &str) -> Self {
        Self::new(
            EventKind::ChargerDisconnected,
            serde_json::json!({ "chargerId": charger_id }),
        )
    }

    pub fn status(charger_id: &str, connector_id: ConnectorId, status: ConnectorStatus) -> Self {
        Self::new(
            EventKind::Status,
            serde_json::json!({
                "chargerId": charger_id,
                "connectorId": connector_id,
                "status": status,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_type_parse_tolerant() {
        assert_eq!(ConnectorType::parse("ccs2"), ConnectorType::Ccs2);
        assert_eq!(ConnectorType::parse("CHAdeMO"), ConnectorType::Chademo);
        assert_eq!(ConnectorType::parse("J1772"), ConnectorType::Type2);
        assert_eq!(ConnectorType::parse("garbage"), ConnectorType::Unknown);
        assert_eq!(ConnectorType::parse(""), ConnectorType::Unknown);
    }

    #[test]
    fn test_event_kind_wire_names() {
        let event = LiveEvent::charger_connected("CHG-1");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"charger_connected\""));
        assert!(json.contains("CHG-1"));
    }

    #[test]
    fn test_rejects_start() {
        assert!(ConnectorStatus::Faulted.rejects_start());
        assert!(ConnectorStatus::Unavailable.rejects_start());
        assert!(!ConnectorStatus::Available.rejects_start());
        assert!(!ConnectorStatus::Charging.rejects_start());
    }
}
