//! Billing ledger
//!
//! Prepaid balance per RFID card with an append-only audit trail. All
//! balance mutation goes through this component; each card has its own
//! lock so two concurrent mutations on the same card serialize while
//! different cards proceed independently. The cached balance is always
//! the fold of the card's entry history, and a debit can never drive it
//! negative: settlement debits are capped at the available balance and
//! the shortfall is recorded as a zero-amount deficit entry for manual
//! reconciliation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::types::{CardId, CardStatus, Money, RfidCard, TransactionId};

/// Why a ledger entry was appended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerReason {
    Topup,
    Charge,
    Refund,
    /// Zero-amount marker: a settlement cost exceeded the balance and the
    /// uncollected remainder is noted here.
    Deficit,
}

/// Immutable record of one balance change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub card_id: CardId,
    /// Signed amount applied to the balance (negative for debits)
    pub amount: Money,
    pub reason: LedgerReason,
    pub transaction_id: Option<TransactionId>,
    pub balance_before: Money,
    pub balance_after: Money,
    pub timestamp: DateTime<Utc>,
    pub note: Option<String>,
}

/// Outcome of a settlement debit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// Amount actually collected (capped at the available balance)
    pub debited: Money,
    /// Uncollected remainder, zero in the normal case
    pub shortfall: Money,
    pub new_balance: Money,
    /// Balance dropped below the card's alert threshold
    pub low_balance: bool,
}

/// Ledger errors, surfaced synchronously to the caller
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("unknown card: {0}")]
    UnknownCard(CardId),

    #[error("card {0} is not active")]
    CardInactive(CardId),

    #[error("amount must be positive")]
    InvalidAmount,
}

struct CardAccount {
    card: RfidCard,
    entries: Vec<LedgerEntry>,
}

impl CardAccount {
    fn append(
        &mut self,
        amount: Money,
        reason: LedgerReason,
        transaction_id: Option<TransactionId>,
        note: Option<String>,
    ) {
        let before = self.card.balance;
        self.card.balance += amount;
        self.entries.push(LedgerEntry {
            card_id: self.card.id.clone(),
            amount,
            reason,
            transaction_id,
            balance_before: before,
            balance_after: self.card.balance,
            timestamp: Utc::now(),
            note,
        });
    }

    fn settlement_for(&self, transaction_id: TransactionId) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| {
            e.reason == LedgerReason::Charge && e.transaction_id == Some(transaction_id)
        })
    }
}

/// The billing ledger: card accounts keyed by card id
pub struct BillingLedger {
    cards: RwLock<HashMap<CardId, Arc<Mutex<CardAccount>>>>,
}

impl BillingLedger {
    pub fn new() -> Self {
        Self {
            cards: RwLock::new(HashMap::new()),
        }
    }

    /// Register a card account.
    pub async fn add_card(&self, card: RfidCard) {
        let mut cards = self.cards.write().await;
        cards.insert(
            card.id.clone(),
            Arc::new(Mutex::new(CardAccount {
                card,
                entries: Vec::new(),
            })),
        );
    }

    /// Change a card's status (soft block/unblock from the CRUD layer).
    pub async fn set_status(&self, card_id: &str, status: CardStatus) -> Result<(), LedgerError> {
        let account = self.account(card_id).await?;
        let mut account = account.lock().await;
        account.card.status = status;
        Ok(())
    }

    /// Assign a card to a pricing group (or clear it). New sessions pick
    /// the group up at start; running sessions keep the one they began with.
    pub async fn assign_group(
        &self,
        card_id: &str,
        group: Option<crate::types::GroupId>,
    ) -> Result<(), LedgerError> {
        let account = self.account(card_id).await?;
        let mut account = account.lock().await;
        account.card.group = group;
        Ok(())
    }

    /// Map an idTag to the card it belongs to, if any. An idTag without a
    /// card is legal (operator override): the session proceeds unbilled.
    pub async fn resolve(&self, id_tag: &str) -> Option<RfidCard> {
        let cards = self.cards.read().await;
        for account in cards.values() {
            let account = account.lock().await;
            if account.card.number == id_tag || account.card.id == id_tag {
                return Some(account.card.clone());
            }
        }
        None
    }

    /// Credit a card (top-up from the payment gateway, or a refund).
    pub async fn credit(
        &self,
        card_id: &str,
        amount: Money,
        reason: LedgerReason,
    ) -> Result<Money, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let account = self.account(card_id).await?;
        let mut account = account.lock().await;
        if account.card.status == CardStatus::Blocked {
            return Err(LedgerError::CardInactive(account.card.id.clone()));
        }
        account.append(amount, reason, None, None);
        info!(
            card = card_id,
            amount, balance = account.card.balance, "credited card"
        );
        Ok(account.card.balance)
    }

    /// Debit a card for a settled transaction. Idempotent per transaction
    /// id: replaying the same settlement returns the original outcome
    /// without touching the balance. The debit is capped at the available
    /// balance; any shortfall becomes a zero-amount deficit entry.
    pub async fn debit_for_transaction(
        &self,
        card_id: &str,
        amount: Money,
        transaction_id: TransactionId,
    ) -> Result<Settlement, LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let account = self.account(card_id).await?;
        let mut account = account.lock().await;

        if let Some(existing) = account.settlement_for(transaction_id) {
            warn!(
                card = card_id,
                transaction_id, "duplicate settlement debit ignored"
            );
            let debited = -existing.amount;
            let balance_after = existing.balance_after;
            let threshold = account.card.low_balance_threshold;
            return Ok(Settlement {
                debited,
                shortfall: amount - debited,
                new_balance: account.card.balance,
                low_balance: balance_after < threshold,
            });
        }

        let available = account.card.balance;
        let debited = amount.min(available);
        let shortfall = amount - debited;

        account.append(-debited, LedgerReason::Charge, Some(transaction_id), None);
        if shortfall > 0 {
            account.append(
                0,
                LedgerReason::Deficit,
                Some(transaction_id),
                Some(format!("uncollected {}", shortfall)),
            );
            warn!(
                card = card_id,
                transaction_id, shortfall, "settlement exceeded balance, debit capped"
            );
        }

        let new_balance = account.card.balance;
        let low_balance = new_balance < account.card.low_balance_threshold;
        if low_balance {
            warn!(card = card_id, balance = new_balance, "balance below alert threshold");
        }

        Ok(Settlement {
            debited,
            shortfall,
            new_balance,
            low_balance,
        })
    }

    /// Current cached balance for a card.
    pub async fn balance(&self, card_id: &str) -> Result<Money, LedgerError> {
        let account = self.account(card_id).await?;
        let account = account.lock().await;
        Ok(account.card.balance)
    }

    /// Full append-only history for a card.
    pub async fn history(&self, card_id: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        let account = self.account(card_id).await?;
        let account = account.lock().await;
        Ok(account.entries.clone())
    }

    async fn account(&self, card_id: &str) -> Result<Arc<Mutex<CardAccount>>, LedgerError> {
        let cards = self.cards.read().await;
        cards
            .get(card_id)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownCard(card_id.to_string()))
    }
}

impl Default for BillingLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: &str, balance: Money) -> RfidCard {
        RfidCard {
            id: id.to_string(),
            number: format!("RFID-{}", id),
            user: "tester".to_string(),
            balance,
            status: CardStatus::Active,
            low_balance_threshold: 1_000,
            group: None,
        }
    }

    #[tokio::test]
    async fn test_credit_and_debit() {
        let ledger = BillingLedger::new();
        ledger.add_card(card("c1", 0)).await;

        let balance = ledger.credit("c1", 50_000, LedgerReason::Topup).await.unwrap();
        assert_eq!(balance, 50_000);

        let settlement = ledger.debit_for_transaction("c1", 1_000, 7).await.unwrap();
        assert_eq!(settlement.debited, 1_000);
        assert_eq!(settlement.shortfall, 0);
        assert_eq!(settlement.new_balance, 49_000);

        let history = ledger.history("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].balance_after, 49_000);
    }

    #[tokio::test]
    async fn test_debit_is_idempotent_per_transaction() {
        let ledger = BillingLedger::new();
        ledger.add_card(card("c1", 10_000)).await;

        let first = ledger.debit_for_transaction("c1", 2_500, 42).await.unwrap();
        let second = ledger.debit_for_transaction("c1", 2_500, 42).await.unwrap();

        assert_eq!(first.new_balance, 7_500);
        assert_eq!(second.new_balance, 7_500);
        assert_eq!(second.debited, 2_500);

        let charges = ledger
            .history("c1")
            .await
            .unwrap()
            .iter()
            .filter(|e| e.reason == LedgerReason::Charge)
            .count();
        assert_eq!(charges, 1);
    }

    #[tokio::test]
    async fn test_debit_capped_at_balance_with_deficit_note() {
        let ledger = BillingLedger::new();
        ledger.add_card(card("c1", 800)).await;

        let settlement = ledger.debit_for_transaction("c1", 1_500, 9).await.unwrap();
        assert_eq!(settlement.debited, 800);
        assert_eq!(settlement.shortfall, 700);
        assert_eq!(settlement.new_balance, 0);

        let history = ledger.history("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].reason, LedgerReason::Deficit);
        assert_eq!(history[1].amount, 0);
        assert_eq!(history[1].note.as_deref(), Some("uncollected 700"));
    }

    #[tokio::test]
    async fn test_balance_never_negative() {
        let ledger = BillingLedger::new();
        ledger.add_card(card("c1", 100)).await;

        ledger.debit_for_transaction("c1", 1_000, 1).await.unwrap();
        ledger.debit_for_transaction("c1", 1_000, 2).await.unwrap();
        assert_eq!(ledger.balance("c1").await.unwrap(), 0);

        for entry in ledger.history("c1").await.unwrap() {
            assert!(entry.balance_after >= 0);
        }
    }

    #[tokio::test]
    async fn test_balance_is_fold_of_history() {
        let ledger = BillingLedger::new();
        ledger.add_card(card("c1", 5_000)).await;

        ledger.credit("c1", 2_000, LedgerReason::Topup).await.unwrap();
        ledger.debit_for_transaction("c1", 3_000, 1).await.unwrap();
        ledger.credit("c1", 500, LedgerReason::Refund).await.unwrap();

        let balance = ledger.balance("c1").await.unwrap();
        let fold: Money = 5_000
            + ledger
                .history("c1")
                .await
                .unwrap()
                .iter()
                .map(|e| e.amount)
                .sum::<Money>();
        assert_eq!(balance, fold);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_serialize() {
        let ledger = Arc::new(BillingLedger::new());
        ledger.add_card(card("c1", 0)).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.credit("c1", 100, LedgerReason::Topup).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ledger.balance("c1").await.unwrap(), 1_000);
        let history = ledger.history("c1").await.unwrap();
        assert_eq!(history.len(), 10);
        // Entries for a single card are totally ordered.
        for pair in history.windows(2) {
            assert_eq!(pair[0].balance_after, pair[1].balance_before);
        }
    }

    #[tokio::test]
    async fn test_resolve_by_number_or_id() {
        let ledger = BillingLedger::new();
        ledger.add_card(card("c1", 500)).await;

        assert!(ledger.resolve("RFID-c1").await.is_some());
        assert!(ledger.resolve("c1").await.is_some());
        assert!(ledger.resolve("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_assign_group() {
        let ledger = BillingLedger::new();
        ledger.add_card(card("c1", 500)).await;

        ledger.assign_group("c1", Some("fleet".to_string())).await.unwrap();
        assert_eq!(
            ledger.resolve("c1").await.unwrap().group.as_deref(),
            Some("fleet")
        );

        ledger.assign_group("c1", None).await.unwrap();
        assert!(ledger.resolve("c1").await.unwrap().group.is_none());
    }

    #[tokio::test]
    async fn test_invalid_amounts_rejected() {
        let ledger = BillingLedger::new();
        ledger.add_card(card("c1", 500)).await;

        assert_eq!(
            ledger.credit("c1", 0, LedgerReason::Topup).await,
            Err(LedgerError::InvalidAmount)
        );
        assert_eq!(
            ledger.credit("c1", -5, LedgerReason::Topup).await,
            Err(LedgerError::InvalidAmount)
        );
    }
}
