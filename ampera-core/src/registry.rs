//! Charger registry
//!
//! Authoritative, lock-guarded view of known chargers, their connectors
//! and liveness. There is no ambient global state: everything goes
//! through explicit accessors on [`ChargerRegistry`].
//!
//! A charger counts as online while heartbeats keep arriving within twice
//! its advertised interval ("missing two consecutive windows flags it
//! offline"). Chargers referenced by historical transactions are never
//! removed, only soft-disabled.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::events::EventBroadcaster;
use crate::types::{ChargerId, ConnectorId, ConnectorStatus, ConnectorType, LiveEvent};

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown charger: {0}")]
    UnknownCharger(ChargerId),

    #[error("unknown connector {1} on charger {0}")]
    UnknownConnector(ChargerId, ConnectorId),

    #[error("connector {1} on charger {0} is {2:?}")]
    ConnectorNotReady(ChargerId, ConnectorId, ConnectorStatus),

    #[error("charger {0} is disabled")]
    ChargerDisabled(ChargerId),
}

/// Static charger details supplied at registration (BootNotification)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChargerMeta {
    pub name: String,
    pub location: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    /// Connector ids with their physical type tags
    pub connectors: Vec<(ConnectorId, ConnectorType)>,
}

#[derive(Debug, Clone)]
struct ConnectorEntry {
    connector_type: ConnectorType,
    status: ConnectorStatus,
}

#[derive(Debug, Clone)]
struct Charger {
    meta: ChargerMeta,
    connectors: HashMap<ConnectorId, ConnectorEntry>,
    heartbeat_interval: Duration,
    last_seen: DateTime<Utc>,
    connected: bool,
    enabled: bool,
}

/// Read-only snapshot of one charger for dashboard listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargerView {
    pub id: ChargerId,
    pub name: String,
    pub location: String,
    pub vendor: String,
    pub model: String,
    pub connectors: Vec<ConnectorView>,
    pub online: bool,
    pub enabled: bool,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorView {
    pub id: ConnectorId,
    pub connector_type: ConnectorType,
    pub status: ConnectorStatus,
}

/// The charger registry
pub struct ChargerRegistry {
    chargers: RwLock<HashMap<ChargerId, Charger>>,
    events: EventBroadcaster,
    /// Heartbeat interval assumed for chargers that never completed a boot
    default_interval: Duration,
}

impl ChargerRegistry {
    pub fn new(events: EventBroadcaster, default_interval_secs: u32) -> Self {
        Self {
            chargers: RwLock::new(HashMap::new()),
            events,
            default_interval: Duration::seconds(default_interval_secs as i64),
        }
    }

    /// Register or update a charger (the BootNotification path). The
    /// advertised heartbeat interval drives the liveness window.
    pub async fn register(&self, charger_id: &str, meta: ChargerMeta, interval_secs: u32) {
        let mut chargers = self.chargers.write().await;
        let now = Utc::now();

        let entry = chargers.entry(charger_id.to_string()).or_insert_with(|| Charger {
            meta: ChargerMeta::default(),
            connectors: HashMap::new(),
            heartbeat_interval: self.default_interval,
            last_seen: now,
            connected: true,
            enabled: true,
        });

        entry.heartbeat_interval = Duration::seconds(interval_secs as i64);
        entry.last_seen = now;
        entry.connected = true;
        for (id, connector_type) in &meta.connectors {
            entry
                .connectors
                .entry(*id)
                .and_modify(|c| c.connector_type = *connector_type)
                .or_insert(ConnectorEntry {
                    connector_type: *connector_type,
                    status: ConnectorStatus::Available,
                });
        }
        entry.meta = meta;

        info!(charger = charger_id, "charger registered");
    }

    /// Refresh liveness for a charger.
    pub async fn record_heartbeat(&self, charger_id: &str) -> Result<(), RegistryError> {
        let mut chargers = self.chargers.write().await;
        let charger = chargers
            .get_mut(charger_id)
            .ok_or_else(|| RegistryError::UnknownCharger(charger_id.to_string()))?;
        charger.last_seen = Utc::now();
        if !charger.connected {
            charger.connected = true;
            self.events.publish(LiveEvent::charger_connected(charger_id));
        }
        debug!(charger = charger_id, "heartbeat");
        Ok(())
    }

    /// Transport-level connect. Unknown chargers get a skeleton entry that
    /// a following BootNotification fills in.
    pub async fn mark_connected(&self, charger_id: &str) {
        let mut chargers = self.chargers.write().await;
        let now = Utc::now();
        let charger = chargers.entry(charger_id.to_string()).or_insert_with(|| Charger {
            meta: ChargerMeta::default(),
            connectors: HashMap::new(),
            heartbeat_interval: self.default_interval,
            last_seen: now,
            connected: false,
            enabled: true,
        });
        charger.connected = true;
        charger.last_seen = now;
        self.events.publish(LiveEvent::charger_connected(charger_id));
    }

    /// Transport-level disconnect.
    pub async fn mark_disconnected(&self, charger_id: &str) {
        let mut chargers = self.chargers.write().await;
        if let Some(charger) = chargers.get_mut(charger_id) {
            if charger.connected {
                charger.connected = false;
                self.events.publish(LiveEvent::charger_disconnected(charger_id));
            }
        }
    }

    /// Update a connector's status. The only path by which status changes
    /// outside the transaction state machine's own transitions.
    pub async fn set_status(
        &self,
        charger_id: &str,
        connector_id: ConnectorId,
        status: ConnectorStatus,
    ) -> Result<(), RegistryError> {
        let mut chargers = self.chargers.write().await;
        let charger = chargers
            .get_mut(charger_id)
            .ok_or_else(|| RegistryError::UnknownCharger(charger_id.to_string()))?;

        let connector = charger
            .connectors
            .entry(connector_id)
            .or_insert(ConnectorEntry {
                connector_type: ConnectorType::Unknown,
                status: ConnectorStatus::Available,
            });

        if connector.status != status {
            connector.status = status;
            self.events
                .publish(LiveEvent::status(charger_id, connector_id, status));
            info!(
                charger = charger_id,
                connector = connector_id,
                ?status,
                "connector status changed"
            );
        }
        Ok(())
    }

    /// Whether heartbeats are arriving within the charger's window.
    pub async fn is_online(&self, charger_id: &str) -> bool {
        let chargers = self.chargers.read().await;
        match chargers.get(charger_id) {
            Some(c) => c.connected && Utc::now() - c.last_seen <= c.heartbeat_interval * 2,
            None => false,
        }
    }

    /// Guard check for a start request: the charger must exist and be
    /// enabled, and the connector must not be Faulted/Unavailable.
    /// Returns the connector's type tag for pricing.
    pub async fn connector_ready(
        &self,
        charger_id: &str,
        connector_id: ConnectorId,
    ) -> Result<ConnectorType, RegistryError> {
        let chargers = self.chargers.read().await;
        let charger = chargers
            .get(charger_id)
            .ok_or_else(|| RegistryError::UnknownCharger(charger_id.to_string()))?;
        if !charger.enabled {
            return Err(RegistryError::ChargerDisabled(charger_id.to_string()));
        }
        // Connector 0 addresses the charge point as a whole, never a plug.
        if connector_id == 0 {
            return Err(RegistryError::UnknownConnector(
                charger_id.to_string(),
                connector_id,
            ));
        }
        match charger.connectors.get(&connector_id) {
            Some(connector) if connector.status.rejects_start() => {
                Err(RegistryError::ConnectorNotReady(
                    charger_id.to_string(),
                    connector_id,
                    connector.status,
                ))
            }
            Some(connector) => Ok(connector.connector_type),
            // Chargers do not enumerate connectors at boot. A connector we
            // have not seen a status for yet is priced as Unknown.
            None => Ok(ConnectorType::Unknown),
        }
    }

    /// Soft-disable (or re-enable) a charger. Never physically deleted.
    pub async fn set_enabled(&self, charger_id: &str, enabled: bool) -> Result<(), RegistryError> {
        let mut chargers = self.chargers.write().await;
        let charger = chargers
            .get_mut(charger_id)
            .ok_or_else(|| RegistryError::UnknownCharger(charger_id.to_string()))?;
        charger.enabled = enabled;
        Ok(())
    }

    /// Snapshot of all chargers for the dashboard.
    pub async fn list(&self) -> Vec<ChargerView> {
        let chargers = self.chargers.read().await;
        let now = Utc::now();
        chargers
            .iter()
            .map(|(id, c)| ChargerView {
                id: id.clone(),
                name: c.meta.name.clone(),
                location: c.meta.location.clone(),
                vendor: c.meta.vendor.clone(),
                model: c.meta.model.clone(),
                connectors: {
                    let mut views: Vec<_> = c
                        .connectors
                        .iter()
                        .map(|(cid, conn)| ConnectorView {
                            id: *cid,
                            connector_type: conn.connector_type,
                            status: conn.status,
                        })
                        .collect();
                    views.sort_by_key(|v| v.id);
                    views
                },
                online: c.connected && now - c.last_seen <= c.heartbeat_interval * 2,
                enabled: c.enabled,
                last_seen: c.last_seen,
            })
            .collect()
    }

    /// Flag chargers whose heartbeat window has lapsed as offline and
    /// return their ids so the caller can force-close their sessions.
    pub async fn offline_sweep(&self, now: DateTime<Utc>) -> Vec<ChargerId> {
        let mut chargers = self.chargers.write().await;
        let mut lapsed = Vec::new();
        for (id, charger) in chargers.iter_mut() {
            if charger.connected && now - charger.last_seen > charger.heartbeat_interval * 2 {
                charger.connected = false;
                warn!(charger = id.as_str(), "heartbeat window lapsed, marking offline");
                self.events.publish(LiveEvent::charger_disconnected(id));
                lapsed.push(id.clone());
            }
        }
        lapsed
    }
}
