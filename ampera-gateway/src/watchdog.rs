//! Background liveness and reservation sweeper
//!
//! Periodically expires stale remote-start reservations and force-closes
//! sessions on chargers whose heartbeats have lapsed.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::gateway::Gateway;

pub struct Watchdog {
    gateway: Arc<Gateway>,
}

impl Watchdog {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Run the sweep loop until the task is dropped.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.gateway.config().sweep_interval);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    async fn sweep(&self) {
        let now = Utc::now();

        let expired = self.gateway.sessions().expire_pending(now).await;
        if expired > 0 {
            debug!(expired, "stale reservations released");
        }

        for charger_id in self.gateway.registry().offline_sweep(now).await {
            let closed = self.gateway.sessions().force_close(&charger_id).await;
            if closed > 0 {
                warn!(
                    charger = charger_id.as_str(),
                    closed, "force-closed sessions on lapsed charger"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::ocpp::{Action, BootNotificationResponse, Call, RegistrationStatus};
    use ampera_core::{CardStatus, RfidCard, TransactionState};

    async fn gateway() -> Arc<Gateway> {
        let gateway = Arc::new(Gateway::new(
            GatewayConfig::default().with_heartbeat_interval(1),
        ));
        gateway
            .ledger()
            .add_card(RfidCard {
                id: "card-1".to_string(),
                number: "RFID-001".to_string(),
                user: "tester".to_string(),
                balance: 10_000,
                status: CardStatus::Active,
                low_balance_threshold: 0,
                group: None,
            })
            .await;

        let boot = Call::new(
            Action::BootNotification,
            serde_json::json!({
                "chargePointVendor": "ACME",
                "chargePointModel": "AC-22"
            }),
        )
        .unwrap();
        let result = gateway.handle_call("CHG-1", &boot).await.unwrap();
        let resp: BootNotificationResponse = result.parse_payload().unwrap();
        assert_eq!(resp.status, RegistrationStatus::Accepted);
        gateway
    }

    #[tokio::test]
    async fn test_sweep_closes_sessions_on_lapsed_charger() {
        let gateway = gateway().await;
        let txn_id = gateway
            .sessions()
            .begin("CHG-1", 1, "RFID-001", 1000, Utc::now())
            .await
            .unwrap();
        gateway.sessions().update_meter(txn_id, 1500).await;

        // Heartbeat interval is 1s; two windows have passed.
        tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
        Watchdog::new(gateway.clone()).sweep().await;

        let txn = gateway.sessions().transaction(txn_id).await.unwrap();
        assert_eq!(txn.state, TransactionState::Closed);
        assert!(txn.forced_close);
        // Billed through the last known reading.
        assert_eq!(txn.energy_wh, Some(500));
        assert_eq!(gateway.ledger().balance("card-1").await.unwrap(), 9_000);
    }

    #[tokio::test]
    async fn test_sweep_releases_expired_reservations() {
        let gateway = Arc::new(Gateway::new(
            GatewayConfig::default()
                .with_pending_timeout(std::time::Duration::from_millis(0)),
        ));
        let boot = Call::new(
            Action::BootNotification,
            serde_json::json!({
                "chargePointVendor": "ACME",
                "chargePointModel": "AC-22"
            }),
        )
        .unwrap();
        gateway.handle_call("CHG-1", &boot).await.unwrap();

        gateway.sessions().reserve("CHG-1", 1, "ANY").await.unwrap();
        Watchdog::new(gateway.clone()).sweep().await;

        // The slot is free again.
        gateway.sessions().reserve("CHG-1", 1, "ANY").await.unwrap();
    }
}
