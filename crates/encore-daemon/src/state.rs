//! Shared runtime state for encore-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The auction engine is
//! the only owner of auction state; the bus only fans events out to SSE.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use encore_auction::{
    AuctionEngine, AuctionStore, Clock, EngineContext, MemoryStore, NotificationCollaborator,
    PaperPayments, PaymentCollaborator, SystemClock,
};
use encore_config::AuctionSettings;
use encore_schemas::Amount;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BusMsg: SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat {
        ts_millis: i64,
    },
    Outbid {
        request_id: Uuid,
        new_highest_amount: Amount,
    },
    RoundSettled {
        round_id: Uuid,
        winning_request_id: Uuid,
    },
    RoundLost {
        round_id: Uuid,
        request_id: Uuid,
        winning_amount: Amount,
    },
    SettlementFailure {
        round_id: Uuid,
        reason: String,
    },
    LogLine {
        level: String,
        msg: String,
    },
}

impl BusMsg {
    pub fn event_name(&self) -> &'static str {
        match self {
            BusMsg::Heartbeat { .. } => "heartbeat",
            BusMsg::Outbid { .. } => "outbid",
            BusMsg::RoundSettled { .. } => "round_settled",
            BusMsg::RoundLost { .. } => "round_lost",
            BusMsg::SettlementFailure { .. } => "settlement_failure",
            BusMsg::LogLine { .. } => "log",
        }
    }
}

/// Notification collaborator that publishes onto the SSE bus. Having no
/// subscribers is not a delivery failure.
#[derive(Clone)]
pub struct BusNotifier {
    bus: broadcast::Sender<BusMsg>,
}

impl BusNotifier {
    pub fn new(bus: broadcast::Sender<BusMsg>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl NotificationCollaborator for BusNotifier {
    async fn on_outbid(&self, request_id: Uuid, new_highest_amount: Amount) -> anyhow::Result<()> {
        let _ = self.bus.send(BusMsg::Outbid {
            request_id,
            new_highest_amount,
        });
        Ok(())
    }

    async fn on_round_settled(
        &self,
        round_id: Uuid,
        winning_request_id: Uuid,
    ) -> anyhow::Result<()> {
        let _ = self.bus.send(BusMsg::RoundSettled {
            round_id,
            winning_request_id,
        });
        Ok(())
    }

    async fn on_round_lost(
        &self,
        round_id: Uuid,
        request_id: Uuid,
        winning_amount: Amount,
    ) -> anyhow::Result<()> {
        let _ = self.bus.send(BusMsg::RoundLost {
            round_id,
            request_id,
            winning_amount,
        });
        Ok(())
    }

    async fn on_settlement_failure(&self, round_id: Uuid, reason: &str) -> anyhow::Result<()> {
        let _ = self.bus.send(BusMsg::SettlementFailure {
            round_id,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// What the daemon is wired against. `main.rs` picks Postgres or memory.
pub struct AppDeps {
    pub store: Arc<dyn AuctionStore>,
    pub payments: Arc<dyn PaymentCollaborator>,
    pub clock: Arc<dyn Clock>,
    pub settings: AuctionSettings,
    pub config_hash: String,
}

#[derive(Clone)]
pub struct AppState {
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub engine: AuctionEngine,
    pub config_hash: String,
    /// "postgres" | "memory"
    pub store_kind: &'static str,
}

impl AppState {
    pub fn new(deps: AppDeps, store_kind: &'static str) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        let engine = AuctionEngine::new(EngineContext {
            store: deps.store,
            payments: deps.payments,
            notifier: Arc::new(BusNotifier::new(bus.clone())),
            clock: deps.clock,
            settings: Arc::new(deps.settings),
        });
        Self {
            bus,
            build: BuildInfo {
                service: "encore-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            engine,
            config_hash: deps.config_hash,
            store_kind,
        }
    }

    /// In-memory store, paper payments, wall clock.
    pub fn in_memory(settings: AuctionSettings) -> Self {
        Self::new(
            AppDeps {
                store: Arc::new(MemoryStore::new()),
                payments: Arc::new(PaperPayments),
                clock: Arc::new(SystemClock),
                settings,
                config_hash: String::new(),
            },
            "memory",
        )
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Spawn the scheduler loop: one sweep every `interval`. A failed sweep is
/// logged and surfaced on the bus; the loop keeps going.
pub fn spawn_scheduler(state: Arc<AppState>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match state.engine.sweep().await {
                Ok(report) => {
                    for (id, err) in &report.failures {
                        let _ = state.bus.send(BusMsg::LogLine {
                            level: "WARN".to_string(),
                            msg: format!("sweep failure on {id}: {err}"),
                        });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "scheduler sweep aborted");
                    let _ = state.bus.send(BusMsg::LogLine {
                        level: "ERROR".to_string(),
                        msg: format!("scheduler sweep aborted: {e}"),
                    });
                }
            }
        }
    });
}
