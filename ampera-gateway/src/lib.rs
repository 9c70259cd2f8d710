//! # Ampera Gateway
//!
//! OCPP 1.6 central system for the Ampera charge session orchestrator.
//!
//! This crate terminates charge point WebSocket connections, translates
//! OCPP-J frames into operations on the core components (registry,
//! sessions, ledger, pricing) and carries operator remote commands back
//! to the charge points.
//!
//! ## Architecture
//!
//! ```text
//! Charge points (OCPP 1.6-J)
//!       │ WebSocket /<chargePointId>
//!       ▼
//! ┌───────────────────────────────────┐
//! │    ampera-gateway                 │
//! │  ┌──────────┐   ┌─────────────┐   │
//! │  │ OCPP WS  │◄─►│ Gateway     │   │
//! │  │ Server   │   │ dispatcher  │   │
//! │  └──────────┘   └─────────────┘   │
//! │       ▲              │            │
//! │  ┌────┴─────┐        ▼            │
//! │  │ Remote   │   ┌──────────┐      │
//! │  │ Commander│   │ Watchdog │      │
//! │  └──────────┘   └──────────┘      │
//! └──────────────────┬────────────────┘
//!                    │
//!                    ▼
//! ┌───────────────────────────────────┐
//! │    ampera-core                    │
//! │  Registry │ Sessions │ Ledger │ … │
//! └───────────────────────────────────┘
//! ```
//!
//! ## OCPP → core mapping
//!
//! | OCPP Action | Core operation |
//! |-------------|----------------|
//! | BootNotification | `ChargerRegistry::register` |
//! | Heartbeat | `ChargerRegistry::record_heartbeat` |
//! | StartTransaction | `SessionManager::begin` |
//! | StopTransaction | `SessionManager::finish` |
//! | MeterValues | `SessionManager::update_meter` |
//! | StatusNotification | `ChargerRegistry::set_status` |
//! | RemoteStartTransaction (out) | `SessionManager::reserve` + command |
//! | RemoteStopTransaction (out) | command; settlement on StopTransaction |
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ampera_gateway::{Gateway, GatewayConfig, OcppServer, Watchdog};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Arc::new(Gateway::new(GatewayConfig::new("0.0.0.0:9000")));
//!
//!     tokio::spawn(Watchdog::new(gateway.clone()).run());
//!     OcppServer::new(gateway).run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod gateway;
pub mod ocpp;
pub mod server;
pub mod watchdog;

pub use config::GatewayConfig;
pub use gateway::{Gateway, GatewayError, StatusSnapshot};
pub use server::{OcppServer, RemoteCommander};
pub use watchdog::Watchdog;
