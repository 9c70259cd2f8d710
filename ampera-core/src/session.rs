//! Transaction state machine
//!
//! One logical slot per (charger, connector), owning the lifecycle
//! Idle → Pending → Active → Settling → Closed, with rejection and fault
//! paths terminal. The slot lock is the serialization boundary for
//! transitions; when a settlement also touches a card, the connector
//! slot is always acquired before the ledger's per-card lock.
//!
//! Settlement resolves the price through [`PricingResolver`], debits the
//! ledger exactly once per transaction, and publishes lifecycle events.
//! Closed transactions are immutable and kept for the reporting consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::events::EventBroadcaster;
use crate::ledger::{BillingLedger, Settlement};
use crate::pricing::PricingResolver;
use crate::registry::{ChargerRegistry, RegistryError};
use crate::types::{
    CardId, CardStatus, ChargerId, ConnectorId, ConnectorStatus, ConnectorType, EventKind,
    GroupId, LiveEvent, Money, TransactionId,
};

/// Session guard and lifecycle errors, surfaced synchronously
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("connector {1} on charger {0} already has a transaction")]
    ConnectorBusy(ChargerId, ConnectorId),

    #[error("unknown charger: {0}")]
    UnknownCharger(ChargerId),

    #[error("unknown connector {1} on charger {0}")]
    UnknownConnector(ChargerId, ConnectorId),

    #[error("connector {1} on charger {0} is {2:?}")]
    ConnectorNotReady(ChargerId, ConnectorId, ConnectorStatus),

    #[error("charger {0} is disabled")]
    ChargerDisabled(ChargerId),

    #[error("charger {0} is offline")]
    ChargerOffline(ChargerId),

    #[error("card {card} balance {balance} below required minimum {minimum}")]
    InsufficientBalance {
        card: CardId,
        balance: Money,
        minimum: Money,
    },

    #[error("card {0} is {1:?}")]
    CardRejected(CardId, CardStatus),

    #[error("unknown transaction: {0}")]
    UnknownTransaction(TransactionId),
}

impl From<RegistryError> for SessionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownCharger(id) => SessionError::UnknownCharger(id),
            RegistryError::UnknownConnector(c, n) => SessionError::UnknownConnector(c, n),
            RegistryError::ConnectorNotReady(c, n, s) => SessionError::ConnectorNotReady(c, n, s),
            RegistryError::ChargerDisabled(id) => SessionError::ChargerDisabled(id),
        }
    }
}

/// Lifecycle state recorded on a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Active,
    Settling,
    Closed,
}

/// One charging transaction. Immutable once Closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub charger_id: ChargerId,
    pub connector_id: ConnectorId,
    pub connector_type: ConnectorType,
    pub id_tag: String,
    /// Card the idTag resolved to, if any. Sessions without a card close
    /// unbilled but still carry a computed cost for reporting.
    pub card_id: Option<CardId>,
    pub group: Option<GroupId>,
    pub started_at: DateTime<Utc>,
    pub meter_start: i64,
    /// Latest MeterValues reading in Wh, for live display only
    pub last_meter: i64,
    pub stopped_at: Option<DateTime<Utc>>,
    pub meter_stop: Option<i64>,
    pub energy_wh: Option<i64>,
    pub cost: Option<Money>,
    pub state: TransactionState,
    /// Settlement was triggered by charger disappearance, not a Stop
    pub forced_close: bool,
    /// Raw meter delta was negative and energy was clamped to zero
    pub meter_anomaly: bool,
    pub settlement: Option<Settlement>,
}

/// Per-connector lifecycle slot
#[derive(Debug, Default)]
enum Slot {
    #[default]
    Idle,
    Pending {
        id_tag: String,
        connector_type: ConnectorType,
        deadline: DateTime<Utc>,
    },
    Active {
        transaction_id: TransactionId,
    },
}

/// State machine configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// A card below this balance is denied at start. Zero disables the check.
    pub min_start_balance: Money,
    /// How long a remote-start reservation may wait for the charger's
    /// confirming StartTransaction.
    pub pending_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_start_balance: 0,
            pending_timeout: Duration::seconds(90),
        }
    }
}

/// Owns all transaction lifecycles
pub struct SessionManager {
    registry: Arc<ChargerRegistry>,
    pricing: Arc<PricingResolver>,
    ledger: Arc<BillingLedger>,
    events: EventBroadcaster,
    config: SessionConfig,
    slots: RwLock<HashMap<(ChargerId, ConnectorId), Arc<Mutex<Slot>>>>,
    transactions: RwLock<HashMap<TransactionId, Transaction>>,
    next_id: AtomicI32,
}

impl SessionManager {
    pub fn new(
        registry: Arc<ChargerRegistry>,
        pricing: Arc<PricingResolver>,
        ledger: Arc<BillingLedger>,
        events: EventBroadcaster,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry,
            pricing,
            ledger,
            events,
            config,
            slots: RwLock::new(HashMap::new()),
            transactions: RwLock::new(HashMap::new()),
            next_id: AtomicI32::new(1),
        }
    }

    /// Reserve a connector for a remote start. The slot sits in Pending
    /// until the charger's confirming StartTransaction arrives or the
    /// deadline lapses.
    pub async fn reserve(
        &self,
        charger_id: &str,
        connector_id: ConnectorId,
        id_tag: &str,
    ) -> Result<(), SessionError> {
        let slot = self.slot(charger_id, connector_id).await;
        let mut slot = slot.lock().await;

        if !matches!(*slot, Slot::Idle) {
            return Err(SessionError::ConnectorBusy(
                charger_id.to_string(),
                connector_id,
            ));
        }

        let connector_type = self.registry.connector_ready(charger_id, connector_id).await?;
        self.check_card(id_tag).await?;

        *slot = Slot::Pending {
            id_tag: id_tag.to_string(),
            connector_type,
            deadline: Utc::now() + self.config.pending_timeout,
        };
        info!(
            charger = charger_id,
            connector = connector_id,
            id_tag,
            "connector reserved for remote start"
        );
        Ok(())
    }

    /// Release a Pending reservation (charger rejected the remote start).
    pub async fn release(&self, charger_id: &str, connector_id: ConnectorId) {
        let slot = self.slot(charger_id, connector_id).await;
        let mut slot = slot.lock().await;
        if matches!(*slot, Slot::Pending { .. }) {
            *slot = Slot::Idle;
            debug!(
                charger = charger_id,
                connector = connector_id,
                "reservation released"
            );
        }
    }

    /// Begin a transaction: the charger confirmed a start (or initiated
    /// one itself). Consumes a Pending reservation when present.
    pub async fn begin(
        &self,
        charger_id: &str,
        connector_id: ConnectorId,
        id_tag: &str,
        meter_start: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<TransactionId, SessionError> {
        let slot = self.slot(charger_id, connector_id).await;
        let mut slot = slot.lock().await;

        let (connector_type, card) = match &*slot {
            Slot::Active { .. } => {
                return Err(SessionError::ConnectorBusy(
                    charger_id.to_string(),
                    connector_id,
                ));
            }
            Slot::Pending {
                id_tag: reserved_tag,
                connector_type,
                ..
            } => {
                // The card guard ran at reserve time, but only for the
                // reserved tag; a different tag in the confirmation gets
                // checked from scratch.
                let card = if reserved_tag == id_tag {
                    self.ledger.resolve(id_tag).await
                } else {
                    self.check_card(id_tag).await?
                };
                (*connector_type, card)
            }
            Slot::Idle => {
                let connector_type =
                    self.registry.connector_ready(charger_id, connector_id).await?;
                let card = self.check_card(id_tag).await?;
                (connector_type, card)
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transaction = Transaction {
            id,
            charger_id: charger_id.to_string(),
            connector_id,
            connector_type,
            id_tag: id_tag.to_string(),
            card_id: card.as_ref().map(|c| c.id.clone()),
            group: card.as_ref().and_then(|c| c.group.clone()),
            started_at: timestamp,
            meter_start,
            last_meter: meter_start,
            stopped_at: None,
            meter_stop: None,
            energy_wh: None,
            cost: None,
            state: TransactionState::Active,
            forced_close: false,
            meter_anomaly: false,
            settlement: None,
        };

        self.transactions.write().await.insert(id, transaction);
        *slot = Slot::Active { transaction_id: id };
        drop(slot);

        if let Err(e) = self
            .registry
            .set_status(charger_id, connector_id, ConnectorStatus::Charging)
            .await
        {
            warn!(charger = charger_id, error = %e, "status update failed on start");
        }

        self.events.publish(LiveEvent::new(
            EventKind::TransactionStarted,
            serde_json::json!({
                "transactionId": id,
                "chargerId": charger_id,
                "connectorId": connector_id,
                "idTag": id_tag,
                "meterStart": meter_start,
            }),
        ));
        info!(
            charger = charger_id,
            connector = connector_id,
            transaction = id,
            meter_start,
            "transaction started"
        );
        Ok(id)
    }

    /// Record a running meter reading for an Active transaction. Display
    /// only; final settlement always uses the Stop message's value.
    pub async fn update_meter(&self, transaction_id: TransactionId, reading_wh: i64) {
        let mut transactions = self.transactions.write().await;
        match transactions.get_mut(&transaction_id) {
            Some(txn) if txn.state == TransactionState::Active => {
                txn.last_meter = reading_wh;
            }
            _ => {
                debug!(transaction = transaction_id, "meter reading for non-active transaction dropped");
            }
        }
    }

    /// Stop and settle a transaction. Idempotent: stopping a transaction
    /// that is already Settling or Closed returns the closed record
    /// without re-debiting or re-publishing.
    pub async fn finish(
        &self,
        transaction_id: TransactionId,
        meter_stop: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<Transaction, SessionError> {
        self.settle(transaction_id, Some(meter_stop), timestamp, false)
            .await
    }

    /// Best-effort settlement for every session on a disappeared charger,
    /// using the last known meter value. Pending reservations are
    /// rejected; Active transactions close flagged `forced_close`.
    pub async fn force_close(&self, charger_id: &str) -> usize {
        let slots: Vec<_> = {
            let map = self.slots.read().await;
            map.iter()
                .filter(|((c, _), _)| c == charger_id)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let mut closed = 0;
        for ((_, connector_id), slot) in slots {
            let transaction_id = {
                let mut guard = slot.lock().await;
                match &*guard {
                    Slot::Pending { .. } => {
                        warn!(
                            charger = charger_id,
                            connector = connector_id,
                            "rejecting pending reservation on offline charger"
                        );
                        *guard = Slot::Idle;
                        None
                    }
                    Slot::Active { transaction_id } => Some(*transaction_id),
                    Slot::Idle => None,
                }
            };

            if let Some(id) = transaction_id {
                if self.settle(id, None, Utc::now(), true).await.is_ok() {
                    closed += 1;
                }
            }
        }
        closed
    }

    /// Reject Pending reservations whose confirmation window has lapsed.
    pub async fn expire_pending(&self, now: DateTime<Utc>) -> usize {
        let slots: Vec<_> = {
            let map = self.slots.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut expired = 0;
        for ((charger_id, connector_id), slot) in slots {
            let mut guard = slot.lock().await;
            if let Slot::Pending { deadline, .. } = &*guard {
                if *deadline < now {
                    warn!(
                        charger = charger_id.as_str(),
                        connector = connector_id,
                        "pending reservation timed out, rejecting"
                    );
                    *guard = Slot::Idle;
                    expired += 1;
                }
            }
        }
        expired
    }

    /// Currently Active transactions (dashboard snapshot).
    pub async fn active(&self) -> Vec<Transaction> {
        let transactions = self.transactions.read().await;
        let mut list: Vec<_> = transactions
            .values()
            .filter(|t| t.state == TransactionState::Active)
            .cloned()
            .collect();
        list.sort_by_key(|t| t.id);
        list
    }

    /// Closed transactions for the reporting/export consumer.
    pub async fn closed(&self) -> Vec<Transaction> {
        let transactions = self.transactions.read().await;
        let mut list: Vec<_> = transactions
            .values()
            .filter(|t| t.state == TransactionState::Closed)
            .cloned()
            .collect();
        list.sort_by_key(|t| t.id);
        list
    }

    pub async fn transaction(&self, id: TransactionId) -> Option<Transaction> {
        self.transactions.read().await.get(&id).cloned()
    }

    async fn slot(&self, charger_id: &str, connector_id: ConnectorId) -> Arc<Mutex<Slot>> {
        let key = (charger_id.to_string(), connector_id);
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(&key) {
                return slot.clone();
            }
        }
        let mut slots = self.slots.write().await;
        slots.entry(key).or_default().clone()
    }

    /// Start-time card guard. An idTag with no card passes (operator
    /// override, session closes unbilled).
    async fn check_card(&self, id_tag: &str) -> Result<Option<crate::types::RfidCard>, SessionError> {
        let card = match self.ledger.resolve(id_tag).await {
            Some(card) => card,
            None => return Ok(None),
        };
        if card.status != CardStatus::Active {
            return Err(SessionError::CardRejected(card.id, card.status));
        }
        if self.config.min_start_balance > 0 && card.balance < self.config.min_start_balance {
            return Err(SessionError::InsufficientBalance {
                card: card.id,
                balance: card.balance,
                minimum: self.config.min_start_balance,
            });
        }
        Ok(Some(card))
    }

    async fn settle(
        &self,
        transaction_id: TransactionId,
        meter_stop: Option<i64>,
        timestamp: DateTime<Utc>,
        forced: bool,
    ) -> Result<Transaction, SessionError> {
        let (charger_id, connector_id) = {
            let transactions = self.transactions.read().await;
            let txn = transactions
                .get(&transaction_id)
                .ok_or(SessionError::UnknownTransaction(transaction_id))?;
            if txn.state != TransactionState::Active {
                debug!(transaction = transaction_id, "duplicate stop ignored");
                return Ok(txn.clone());
            }
            (txn.charger_id.clone(), txn.connector_id)
        };

        let slot = self.slot(&charger_id, connector_id).await;
        let mut slot = slot.lock().await;

        let mut transactions = self.transactions.write().await;
        let txn = transactions
            .get_mut(&transaction_id)
            .ok_or(SessionError::UnknownTransaction(transaction_id))?;
        // Re-check under the slot lock: a concurrent stop may have won.
        if txn.state != TransactionState::Active {
            debug!(transaction = transaction_id, "duplicate stop ignored");
            return Ok(txn.clone());
        }

        let stop_reading = meter_stop.unwrap_or(txn.last_meter);
        txn.state = TransactionState::Settling;
        txn.stopped_at = Some(timestamp);
        txn.meter_stop = Some(stop_reading);
        txn.forced_close = forced;

        let raw_delta = stop_reading - txn.meter_start;
        let energy_wh = raw_delta.max(0);
        if raw_delta < 0 {
            txn.meter_anomaly = true;
            warn!(
                transaction = transaction_id,
                meter_start = txn.meter_start,
                meter_stop = stop_reading,
                "meter reading decreased, clamping energy to zero"
            );
        }

        let price = self
            .pricing
            .price_for(txn.connector_type, txn.group.as_deref());
        // Wire-supplied meter values are untrusted; saturate rather than
        // overflow on an absurd reading.
        let cost = energy_wh.saturating_mul(price) / 1_000;

        let settlement = match &txn.card_id {
            Some(card_id) => {
                match self
                    .ledger
                    .debit_for_transaction(card_id, cost, transaction_id)
                    .await
                {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!(
                            transaction = transaction_id,
                            card = card_id.as_str(),
                            error = %e,
                            "settlement debit failed, closing unbilled"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        txn.energy_wh = Some(energy_wh);
        txn.cost = Some(cost);
        txn.settlement = settlement;
        txn.state = TransactionState::Closed;
        let closed = txn.clone();
        drop(transactions);

        *slot = Slot::Idle;
        drop(slot);

        if let Err(e) = self
            .registry
            .set_status(&charger_id, connector_id, ConnectorStatus::Available)
            .await
        {
            warn!(charger = charger_id.as_str(), error = %e, "status update failed on stop");
        }

        self.events.publish(LiveEvent::new(
            EventKind::TransactionStopped,
            serde_json::json!({
                "transactionId": transaction_id,
                "chargerId": charger_id,
                "connectorId": connector_id,
                "energyWh": energy_wh,
                "cost": cost,
                "balance": closed.settlement.map(|s| s.new_balance),
                "forced": forced,
            }),
        ));
        info!(
            transaction = transaction_id,
            energy_wh, cost, forced, "transaction closed"
        );
        Ok(closed)
    }
}
