//! Central-system dispatcher
//!
//! Thin, stateless adapter between the OCPP wire surface and the core
//! components: each inbound CALL maps to one registry/session/ledger
//! operation and renders the OCPP response. Guard violations become
//! reason codes for the charge point; protocol-level oddities (unknown
//! transaction ids, heartbeats from chargers that skipped boot) are
//! logged and tolerated, never crash the gateway.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use ampera_core::{
    BillingLedger, ChargerMeta, ChargerRegistry, ChargerView, ConnectorId, ConnectorStatus,
    EventBroadcaster, PricingResolver, SessionConfig, SessionError, SessionManager, Transaction,
    TransactionId,
};

use crate::config::GatewayConfig;
use crate::ocpp::{
    Action, AuthorizationStatus, BootNotificationRequest, BootNotificationResponse, Call,
    CallError, CallResult, ChargePointStatus, ErrorCode, HeartbeatResponse, IdTagInfo,
    MeterValuesRequest, MeterValuesResponse, OcppError, RegistrationStatus,
    RemoteStartTransactionResponse, RemoteStartStopStatus, RemoteStopTransactionResponse,
    StartTransactionRequest, StartTransactionResponse, StatusNotificationRequest,
    StatusNotificationResponse, StopTransactionRequest, StopTransactionResponse,
};
use crate::server::RemoteCommander;

/// Longest charge point id the gateway accepts (OCPP 1.6 ChargeBoxId bound)
const MAX_CHARGER_ID_LEN: usize = 48;

/// Errors from operator-initiated remote commands
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Ocpp(#[from] OcppError),

    #[error("charge point declined the command")]
    Declined,
}

/// Point-in-time status snapshot for observer resynchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub chargers: Vec<ChargerView>,
    pub active_transactions: Vec<Transaction>,
}

/// The protocol gateway, owning the core component graph
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<ChargerRegistry>,
    pricing: Arc<PricingResolver>,
    ledger: Arc<BillingLedger>,
    sessions: Arc<SessionManager>,
    events: EventBroadcaster,
    commander: Arc<RemoteCommander>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let events = EventBroadcaster::new(config.event_capacity);
        let registry = Arc::new(ChargerRegistry::new(events.clone(), config.heartbeat_interval));
        let pricing = Arc::new(PricingResolver::new(config.default_price_per_kwh));
        let ledger = Arc::new(BillingLedger::new());
        let pending_timeout = chrono::Duration::from_std(config.pending_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let sessions = Arc::new(SessionManager::new(
            registry.clone(),
            pricing.clone(),
            ledger.clone(),
            events.clone(),
            SessionConfig {
                min_start_balance: config.min_start_balance,
                pending_timeout,
            },
        ));
        let commander = Arc::new(RemoteCommander::new(config.request_timeout));

        Self {
            config,
            registry,
            pricing,
            ledger,
            sessions,
            events,
            commander,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ChargerRegistry> {
        &self.registry
    }

    pub fn pricing(&self) -> &Arc<PricingResolver> {
        &self.pricing
    }

    pub fn ledger(&self) -> &Arc<BillingLedger> {
        &self.ledger
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn commander(&self) -> &Arc<RemoteCommander> {
        &self.commander
    }

    /// Handle one inbound CALL from a charge point.
    pub async fn handle_call(
        &self,
        charger_id: &str,
        call: &Call,
    ) -> Result<CallResult, CallError> {
        match call.action {
            Action::BootNotification => self.handle_boot(charger_id, call).await,
            Action::Heartbeat => self.handle_heartbeat(charger_id, call).await,
            Action::StartTransaction => self.handle_start(charger_id, call).await,
            Action::StopTransaction => self.handle_stop(charger_id, call).await,
            Action::MeterValues => self.handle_meter_values(charger_id, call).await,
            Action::StatusNotification => self.handle_status(charger_id, call).await,
            // Remote commands originate here, never from a charge point.
            Action::RemoteStartTransaction | Action::RemoteStopTransaction => {
                Err(CallError::new(
                    &call.message_id,
                    ErrorCode::NotSupported,
                    format!("{} is a central system action", call.action),
                ))
            }
        }
    }

    async fn handle_boot(&self, charger_id: &str, call: &Call) -> Result<CallResult, CallError> {
        let req: BootNotificationRequest = parse(call)?;

        let status = if valid_charger_id(charger_id) {
            let meta = ChargerMeta {
                name: charger_id.to_string(),
                location: String::new(),
                vendor: req.charge_point_vendor,
                model: req.charge_point_model,
                serial_number: req.charge_point_serial_number,
                firmware_version: req.firmware_version,
                connectors: Vec::new(),
            };
            self.registry
                .register(charger_id, meta, self.config.heartbeat_interval)
                .await;
            RegistrationStatus::Accepted
        } else {
            warn!(charger = charger_id, "boot with structurally invalid id rejected");
            RegistrationStatus::Rejected
        };

        respond(
            call,
            BootNotificationResponse {
                status,
                current_time: Utc::now(),
                interval: self.config.heartbeat_interval,
            },
        )
    }

    async fn handle_heartbeat(&self, charger_id: &str, call: &Call) -> Result<CallResult, CallError> {
        if let Err(e) = self.registry.record_heartbeat(charger_id).await {
            // Charge point skipped boot; answer anyway, boot will follow.
            warn!(charger = charger_id, error = %e, "heartbeat from unregistered charger");
        }
        respond(
            call,
            HeartbeatResponse {
                current_time: Utc::now(),
            },
        )
    }

    async fn handle_start(&self, charger_id: &str, call: &Call) -> Result<CallResult, CallError> {
        let req: StartTransactionRequest = parse(call)?;

        match self
            .sessions
            .begin(
                charger_id,
                req.connector_id,
                &req.id_tag,
                req.meter_start,
                req.timestamp,
            )
            .await
        {
            Ok(transaction_id) => respond(
                call,
                StartTransactionResponse {
                    transaction_id,
                    id_tag_info: IdTagInfo::accepted(),
                },
            ),
            Err(e) => {
                warn!(
                    charger = charger_id,
                    connector = req.connector_id,
                    error = %e,
                    "start request denied"
                );
                respond(
                    call,
                    StartTransactionResponse {
                        transaction_id: 0,
                        id_tag_info: IdTagInfo::rejected(denial_status(&e)),
                    },
                )
            }
        }
    }

    async fn handle_stop(&self, charger_id: &str, call: &Call) -> Result<CallResult, CallError> {
        let req: StopTransactionRequest = parse(call)?;

        let id_tag_info = match self
            .sessions
            .finish(req.transaction_id, req.meter_stop, req.timestamp)
            .await
        {
            Ok(_) => req.id_tag.as_ref().map(|_| IdTagInfo::accepted()),
            Err(SessionError::UnknownTransaction(id)) => {
                // Late or replayed stop for a transaction we never saw.
                warn!(
                    charger = charger_id,
                    transaction = id,
                    "stop for unknown transaction ignored"
                );
                None
            }
            Err(e) => {
                warn!(charger = charger_id, error = %e, "stop failed");
                None
            }
        };

        respond(call, StopTransactionResponse { id_tag_info })
    }

    async fn handle_meter_values(
        &self,
        charger_id: &str,
        call: &Call,
    ) -> Result<CallResult, CallError> {
        let req: MeterValuesRequest = parse(call)?;

        let transaction_id = match req.transaction_id {
            Some(id) => Some(id),
            None => self
                .active_transaction_on(charger_id, req.connector_id)
                .await,
        };

        match transaction_id {
            Some(id) => {
                // Use the newest energy register in the batch.
                let reading = req
                    .meter_value
                    .iter()
                    .rev()
                    .find_map(|mv| mv.energy_register_wh());
                if let Some(wh) = reading {
                    self.sessions.update_meter(id, wh).await;
                }
            }
            None => {
                debug!(
                    charger = charger_id,
                    connector = req.connector_id,
                    "meter values without an active transaction dropped"
                );
            }
        }

        respond(call, MeterValuesResponse {})
    }

    async fn handle_status(&self, charger_id: &str, call: &Call) -> Result<CallResult, CallError> {
        let req: StatusNotificationRequest = parse(call)?;

        // connectorId 0 refers to the charge point as a whole.
        if req.connector_id > 0 {
            let status = map_status(req.status);
            if let Err(e) = self
                .registry
                .set_status(charger_id, req.connector_id, status)
                .await
            {
                warn!(charger = charger_id, error = %e, "status notification dropped");
            }
        } else {
            info!(charger = charger_id, status = ?req.status, "charge point status");
        }

        respond(call, StatusNotificationResponse {})
    }

    /// Operator-initiated start: reserve the connector, then command the
    /// charge point. The session goes Active only when the charger's
    /// confirming StartTransaction arrives.
    pub async fn remote_start(
        &self,
        charger_id: &str,
        connector_id: ConnectorId,
        id_tag: &str,
    ) -> Result<(), GatewayError> {
        if !self.registry.is_online(charger_id).await {
            return Err(SessionError::ChargerOffline(charger_id.to_string()).into());
        }
        self.sessions.reserve(charger_id, connector_id, id_tag).await?;

        let command = Call::remote_start(id_tag, Some(connector_id))?;
        let result = match self.commander.request(charger_id, command).await {
            Ok(result) => result,
            Err(e) => {
                self.sessions.release(charger_id, connector_id).await;
                return Err(e.into());
            }
        };

        let response: RemoteStartTransactionResponse = match result.parse_payload() {
            Ok(r) => r,
            Err(e) => {
                self.sessions.release(charger_id, connector_id).await;
                return Err(e.into());
            }
        };

        if response.status == RemoteStartStopStatus::Rejected {
            self.sessions.release(charger_id, connector_id).await;
            warn!(charger = charger_id, connector = connector_id, "remote start declined");
            return Err(GatewayError::Declined);
        }

        info!(charger = charger_id, connector = connector_id, "remote start accepted");
        Ok(())
    }

    /// Operator-initiated stop. The settlement happens when the charge
    /// point's StopTransaction arrives; a transaction that is already
    /// closed is a no-op.
    pub async fn remote_stop(&self, transaction_id: TransactionId) -> Result<(), GatewayError> {
        let txn = self
            .sessions
            .transaction(transaction_id)
            .await
            .ok_or(SessionError::UnknownTransaction(transaction_id))?;

        if txn.state != ampera_core::TransactionState::Active {
            debug!(transaction = transaction_id, "remote stop for closed transaction ignored");
            return Ok(());
        }

        let command = Call::remote_stop(transaction_id)?;
        let result = self.commander.request(&txn.charger_id, command).await?;
        let response: RemoteStopTransactionResponse = result.parse_payload()?;

        if response.status == RemoteStartStopStatus::Rejected {
            return Err(GatewayError::Declined);
        }
        Ok(())
    }

    /// Point-in-time snapshot (charger list + active transactions) for
    /// observers resynchronizing after missed events.
    pub async fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            chargers: self.registry.list().await,
            active_transactions: self.sessions.active().await,
        }
    }

    async fn active_transaction_on(
        &self,
        charger_id: &str,
        connector_id: ConnectorId,
    ) -> Option<TransactionId> {
        self.sessions
            .active()
            .await
            .iter()
            .find(|t| t.charger_id == charger_id && t.connector_id == connector_id)
            .map(|t| t.id)
    }
}

fn parse<T: for<'de> Deserialize<'de>>(call: &Call) -> Result<T, CallError> {
    call.parse_payload().map_err(|e| {
        CallError::new(
            &call.message_id,
            ErrorCode::FormationViolation,
            format!("malformed {} payload: {}", call.action, e),
        )
    })
}

fn respond(call: &Call, payload: impl Serialize) -> Result<CallResult, CallError> {
    CallResult::new(&call.message_id, payload)
        .map_err(|e| CallError::new(&call.message_id, ErrorCode::InternalError, e.to_string()))
}

fn valid_charger_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CHARGER_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Map a guard violation to the idTagInfo status the charge point sees.
fn denial_status(err: &SessionError) -> AuthorizationStatus {
    match err {
        SessionError::ConnectorBusy(_, _) => AuthorizationStatus::ConcurrentTx,
        SessionError::CardRejected(_, _) => AuthorizationStatus::Blocked,
        _ => AuthorizationStatus::Invalid,
    }
}

/// Collapse the OCPP 1.6 status vocabulary onto the registry's.
fn map_status(status: ChargePointStatus) -> ConnectorStatus {
    match status {
        ChargePointStatus::Available => ConnectorStatus::Available,
        ChargePointStatus::Faulted => ConnectorStatus::Faulted,
        ChargePointStatus::Unavailable => ConnectorStatus::Unavailable,
        ChargePointStatus::Preparing
        | ChargePointStatus::Charging
        | ChargePointStatus::SuspendedEvse
        | ChargePointStatus::SuspendedEv
        | ChargePointStatus::Finishing
        | ChargePointStatus::Reserved => ConnectorStatus::Charging,
    }
}
