//! Ampera Node - CLI for the OCPP 1.6 central system
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (listens on 0.0.0.0:9000)
//! ampera-node
//!
//! # Custom listen address and pricing
//! ampera-node --listen 0.0.0.0:9901 --default-price 2500
//!
//! # Seed a test card and require a minimum balance at start
//! ampera-node --seed-card RFID-001:50000 --min-balance 500
//! ```
//!
//! Charge points connect to `ws://<host>:<port>/<chargePointId>` with the
//! `ocpp1.6` subprotocol.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ampera_core::{CardStatus, EventKind, RfidCard};
use ampera_gateway::{Gateway, GatewayConfig, OcppServer, Watchdog};

/// Ampera OCPP 1.6 central system
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address for charge point WebSocket connections
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    listen: String,

    /// Heartbeat interval (seconds) advertised to charge points
    #[arg(long, default_value = "300")]
    heartbeat_interval: u32,

    /// Seconds a remote-start reservation waits for the charger
    #[arg(long, default_value = "90")]
    pending_timeout: u64,

    /// Minimum card balance (minor units) required at session start
    #[arg(long, default_value = "0")]
    min_balance: i64,

    /// Default price per kWh in minor currency units
    #[arg(long, default_value = "2000")]
    default_price: i64,

    /// Seed an RFID card as NUMBER:BALANCE (can be repeated)
    #[arg(long)]
    seed_card: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║             Ampera Node - OCPP 1.6 Central System            ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:     {:<48} ║", args.listen);
    println!("║  Heartbeat:  {:<48} ║", format!("{}s", args.heartbeat_interval));
    println!("║  Price/kWh:  {:<48} ║", args.default_price);
    println!("║  Min start:  {:<48} ║", args.min_balance);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let config = GatewayConfig::new(&args.listen)
        .with_heartbeat_interval(args.heartbeat_interval)
        .with_pending_timeout(Duration::from_secs(args.pending_timeout))
        .with_min_start_balance(args.min_balance)
        .with_default_price(args.default_price);

    let gateway = Arc::new(Gateway::new(config));

    // Seed test cards
    for spec in &args.seed_card {
        match parse_card(spec) {
            Some(card) => {
                info!(number = card.number.as_str(), balance = card.balance, "seeded card");
                gateway.ledger().add_card(card).await;
            }
            None => eprintln!("Invalid card spec (expected NUMBER:BALANCE): {}", spec),
        }
    }

    // Log the live event feed
    let mut events = gateway.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.event {
                    EventKind::TransactionStarted | EventKind::TransactionStopped => {
                        info!(event = ?event.event, data = %event.data, "live event");
                    }
                    _ => {
                        info!(event = ?event.event, "live event");
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    info!(skipped, "event feed lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::spawn(Watchdog::new(gateway.clone()).run());

    info!("Starting Ampera central system...");
    OcppServer::new(gateway).run().await?;

    Ok(())
}

/// Parse a NUMBER:BALANCE card spec.
fn parse_card(spec: &str) -> Option<RfidCard> {
    let (number, balance) = spec.rsplit_once(':')?;
    let balance: i64 = balance.parse().ok()?;
    if number.is_empty() {
        return None;
    }
    Some(RfidCard {
        id: number.to_string(),
        number: number.to_string(),
        user: String::new(),
        status: CardStatus::Active,
        balance,
        low_balance_threshold: 0,
        group: None,
    })
}
