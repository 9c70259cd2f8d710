//! Ampera core: charge session orchestration
//!
//! Domain components behind the OCPP gateway, network-free:
//! - [`registry`] — chargers, connectors, liveness
//! - [`pricing`] — connector-type / group price resolution
//! - [`ledger`] — prepaid balances with an append-only audit trail
//! - [`session`] — the per-connector transaction state machine
//! - [`events`] — live event fan-out to dashboard observers

pub mod events;
pub mod ledger;
pub mod pricing;
pub mod registry;
pub mod session;
pub mod types;

pub use events::EventBroadcaster;
pub use ledger::{BillingLedger, LedgerEntry, LedgerError, LedgerReason, Settlement};
pub use pricing::PricingResolver;
pub use registry::{ChargerMeta, ChargerRegistry, ChargerView, RegistryError};
pub use session::{SessionConfig, SessionError, SessionManager, Transaction, TransactionState};
pub use types::{
    CardId, CardStatus, ChargerId, ConnectorId, ConnectorStatus, ConnectorType, EventKind,
    GroupId, LiveEvent, Money, RfidCard, TransactionId,
};
