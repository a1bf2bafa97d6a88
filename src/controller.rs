// =============================================================================
// Controller — the process-wide singleton that owns "exactly one live
// pipeline at a time". Validates and clamps `start_market_stream` arguments,
// decides refresh-in-place vs. stop-then-start, spawns the per-session task
// set, and answers `status`/`stop`.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::PipelineError;
use crate::events::EventSink;
use crate::exchange::ExchangeClient;
use crate::market::clock_sync::run_clock_sync;
use crate::market::consumer::{run_consumer, ConsumerConfig};
use crate::market::heartbeat::run_heartbeat;
use crate::market::history_loader::{load_paginated_history, load_single_page, HistoryRequest};
use crate::market::producer::{run_producer, ProducerConfig};
use crate::market::shutdown::{ShutdownHandle, ShutdownSignal};
use crate::market::{ConflatedState, PipelineTelemetry, SessionKnobs};
use crate::types::{ConnectionState, MarketKind, StartupMode, Timeframe};

const EMIT_INTERVAL_MS_RANGE: (u64, u64) = (8, 1_000);
const CLOCK_SYNC_INTERVAL_MS_RANGE: (u64, u64) = (5_000, 300_000);
const HISTORY_LIMIT_RANGE: (u32, u32) = (1, 2_000_000);

fn clamp_u64(v: u64, range: (u64, u64)) -> u64 {
    v.clamp(range.0, range.1)
}

fn clamp_u32(v: u32, range: (u32, u32)) -> u32 {
    v.clamp(range.0, range.1)
}

fn parse_tagged<T: serde::de::DeserializeOwned>(s: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
}

/// Raw `start_market_stream` arguments, as deserialized from the command
/// payload. Every field optional; omitted fields fall back to `RuntimeConfig`
/// defaults (symbol/market_kind/timeframe) or the clamped built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartArgs {
    pub market_kind: Option<MarketKind>,
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub min_notional_usdt: Option<f64>,
    pub emit_interval_ms: Option<u64>,
    pub clock_sync_interval_ms: Option<u64>,
    pub history_limit: Option<u32>,
    pub history_all: Option<bool>,
    pub startup_mode: Option<StartupMode>,
    pub mock_mode: Option<bool>,
    pub perf_telemetry: Option<bool>,
    pub emit_legacy_price_event: Option<bool>,
    pub emit_legacy_frame_events: Option<bool>,
}

/// The realized, defaulted-and-clamped configuration of a running (or just
/// stopped) session. What `market_stream_status` reports back verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub min_notional_usdt: f64,
    pub emit_interval_ms: u64,
    pub clock_sync_interval_ms: u64,
    pub history_limit: u32,
    pub history_all: bool,
    pub startup_mode: StartupMode,
    pub mock_mode: bool,
    pub perf_telemetry: bool,
    pub emit_legacy_price_event: bool,
    pub emit_legacy_frame_events: bool,
}

impl Session {
    /// True when two sessions address the same live stream; this is the
    /// condition under which `start_market_stream` refreshes flags in place
    /// instead of dropping and reopening the WebSocket.
    fn same_stream(&self, other: &Session) -> bool {
        self.market_kind == other.market_kind && self.symbol == other.symbol && self.timeframe == other.timeframe
    }
}

fn realize_start_args(args: StartArgs, defaults: &RuntimeConfig) -> Result<Session, PipelineError> {
    let market_kind = args
        .market_kind
        .or_else(|| parse_tagged(&defaults.default_market_kind))
        .unwrap_or(MarketKind::Spot);

    let symbol = args.symbol.unwrap_or_else(|| defaults.default_symbol.clone());
    if symbol.trim().is_empty() {
        return Err(PipelineError::InvalidArgs {
            field: "symbol".into(),
            reason: "must not be empty".into(),
        });
    }
    let symbol = symbol.to_uppercase();

    let timeframe = args
        .timeframe
        .or_else(|| parse_tagged(&defaults.default_timeframe))
        .unwrap_or(Timeframe::M1);

    let min_notional_usdt = args.min_notional_usdt.unwrap_or(defaults.default_min_notional_usdt);
    if min_notional_usdt < 0.0 {
        return Err(PipelineError::InvalidArgs {
            field: "minNotionalUsdt".into(),
            reason: "must be >= 0".into(),
        });
    }

    let emit_interval_ms = clamp_u64(
        args.emit_interval_ms.unwrap_or(defaults.default_emit_interval_ms),
        EMIT_INTERVAL_MS_RANGE,
    );
    let clock_sync_interval_ms = clamp_u64(
        args.clock_sync_interval_ms.unwrap_or(defaults.default_clock_sync_interval_ms),
        CLOCK_SYNC_INTERVAL_MS_RANGE,
    );
    let history_limit = clamp_u32(
        args.history_limit.unwrap_or(defaults.default_history_limit),
        HISTORY_LIMIT_RANGE,
    );

    Ok(Session {
        market_kind,
        symbol,
        timeframe,
        min_notional_usdt,
        emit_interval_ms,
        clock_sync_interval_ms,
        history_limit,
        history_all: args.history_all.unwrap_or(false),
        startup_mode: args.startup_mode.unwrap_or_default(),
        mock_mode: args.mock_mode.unwrap_or(defaults.default_mock_mode),
        perf_telemetry: args.perf_telemetry.unwrap_or(defaults.default_perf_telemetry),
        emit_legacy_price_event: args.emit_legacy_price_event.unwrap_or(false),
        emit_legacy_frame_events: args.emit_legacy_frame_events.unwrap_or(false),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub running: bool,
    pub session: Option<Session>,
    pub connection_state: Option<ConnectionState>,
    pub last_agg_id: Option<u64>,
    pub latency_ms: Option<i64>,
    pub ingest_count: Option<u64>,
    pub emit_count: Option<u64>,
}

struct RunningSession {
    session: Session,
    shutdown: ShutdownHandle,
    telemetry: Arc<PipelineTelemetry>,
    knobs: Arc<SessionKnobs>,
    tasks: Vec<JoinHandle<()>>,
}

/// Exactly one instance lives for the process lifetime, constructed once in
/// `main` and shared behind an `Arc` with the command surface.
pub struct Controller {
    defaults: RuntimeConfig,
    events: EventSink,
    running: Mutex<Option<RunningSession>>,
    starting: AtomicBool,
}

impl Controller {
    pub fn new(defaults: RuntimeConfig, events: EventSink) -> Arc<Self> {
        Arc::new(Self {
            defaults,
            events,
            running: Mutex::new(None),
            starting: AtomicBool::new(false),
        })
    }

    pub async fn start(&self, args: StartArgs) -> Result<Session, PipelineError> {
        if self.starting.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::AlreadyStarting);
        }
        let result = self.start_inner(args).await;
        self.starting.store(false, Ordering::Release);
        result
    }

    async fn start_inner(&self, args: StartArgs) -> Result<Session, PipelineError> {
        let session = realize_start_args(args, &self.defaults)?;

        let previous = {
            let mut guard = self.running.lock();
            match guard.as_mut() {
                Some(running) if running.session.same_stream(&session) => {
                    running.knobs.set_min_notional_usdt(session.min_notional_usdt);
                    running.knobs.set_emit_legacy_price_event(session.emit_legacy_price_event);
                    running.knobs.set_emit_legacy_frame_events(session.emit_legacy_frame_events);
                    running.knobs.set_perf_telemetry(session.perf_telemetry);
                    running.session = session.clone();
                    info!(symbol = %session.symbol, "refreshed session flags in place, stream kept open");
                    return Ok(session);
                }
                Some(_) => guard.take(),
                None => None,
            }
        };

        if let Some(old) = previous {
            info!(old_symbol = %old.session.symbol, new_symbol = %session.symbol, "switching streams, stopping previous session");
            Self::stop_running(old).await;
        }

        let spawned = self.spawn_session(session.clone()).await?;
        *self.running.lock() = Some(spawned);
        Ok(session)
    }

    /// Always reports `{stopped: true}`, even if nothing was running — stop
    /// is idempotent and the caller only cares that no session is left live.
    pub async fn stop(&self) -> bool {
        let existing = self.running.lock().take();
        if let Some(running) = existing {
            Self::stop_running(running).await;
        }
        true
    }

    pub fn status(&self) -> StatusSnapshot {
        let guard = self.running.lock();
        match guard.as_ref() {
            Some(running) => StatusSnapshot {
                running: true,
                session: Some(running.session.clone()),
                connection_state: Some(running.telemetry.connection_state()),
                last_agg_id: Some(running.telemetry.last_agg_id()),
                latency_ms: Some(running.telemetry.legacy_latency_ms()),
                ingest_count: Some(running.telemetry.ingest_count()),
                emit_count: Some(running.telemetry.emit_count()),
            },
            None => StatusSnapshot {
                running: false,
                session: None,
                connection_state: None,
                last_agg_id: None,
                latency_ms: None,
                ingest_count: None,
                emit_count: None,
            },
        }
    }

    async fn stop_running(running: RunningSession) {
        running.shutdown.signal();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "session task panicked during shutdown");
            }
        }
        running.telemetry.set_connection_state(ConnectionState::Stopped);
    }

    /// Spawns the per-session task set. In `HistoryFirst` mode the first
    /// history page is fetched and its `candles_bootstrap` emitted *before*
    /// Producer/Consumer are spawned, so no `market_frame_update` can precede
    /// it (§5's ordering guarantee); `LiveFirst` fetches it concurrently
    /// instead, giving up that ordering guarantee for a faster first tick.
    async fn spawn_session(&self, session: Session) -> Result<RunningSession, PipelineError> {
        let client = Arc::new(ExchangeClient::new(session.market_kind).map_err(|e| PipelineError::InternalInvariant {
            reason: e.to_string(),
        })?);
        let state = Arc::new(ConflatedState::new(session.timeframe));
        let telemetry = Arc::new(PipelineTelemetry::new());
        let knobs = Arc::new(SessionKnobs::new(
            session.min_notional_usdt,
            session.emit_legacy_price_event,
            session.emit_legacy_frame_events,
            session.perf_telemetry,
        ));
        let (shutdown_handle, shutdown_rx) = ShutdownHandle::new();

        let mut tasks = Vec::new();

        let history_req = HistoryRequest {
            market_kind: session.market_kind,
            symbol: session.symbol.clone(),
            timeframe: session.timeframe,
            history_limit: session.history_limit,
            history_all: session.history_all,
        };

        // The single-page bootstrap always runs: it is what `candles_bootstrap`
        // is for, giving the shell an immediately renderable chart. `HistoryFirst`
        // awaits it here, before Producer/Consumer are spawned, so it precedes
        // any `market_frame_update`; `LiveFirst` runs it concurrently instead.
        if session.startup_mode == StartupMode::HistoryFirst {
            load_single_page(&client, &self.events, &history_req).await;
        } else {
            let client = client.clone();
            let events = self.events.clone();
            let history_req = history_req.clone();
            tasks.push(tokio::spawn(async move {
                load_single_page(&client, &events, &history_req).await;
            }));
        }

        // `historyAll` additionally walks the full paginated depth in the
        // background, reporting `history_load_progress`, independent of which
        // startup mode gated the initial bootstrap above.
        if session.history_all {
            let client = client.clone();
            let events = self.events.clone();
            let mut history_shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                load_paginated_history(&client, &events, &history_req, None, &mut history_shutdown).await;
            }));
        }

        let producer_config = ProducerConfig {
            market_kind: session.market_kind,
            symbol: session.symbol.clone(),
            timeframe: session.timeframe,
            knobs: knobs.clone(),
            mock_mode: session.mock_mode,
        };
        tasks.push(tokio::spawn(run_producer(
            client.clone(),
            state.clone(),
            telemetry.clone(),
            self.events.clone(),
            producer_config,
            shutdown_rx.clone(),
        )));

        let consumer_config = ConsumerConfig {
            emit_interval_ms: session.emit_interval_ms,
            knobs: knobs.clone(),
        };
        tasks.push(tokio::spawn(run_consumer(
            state.clone(),
            telemetry.clone(),
            self.events.clone(),
            consumer_config,
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(run_clock_sync(
            client.clone(),
            telemetry.clone(),
            session.clock_sync_interval_ms,
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(run_heartbeat(
            telemetry.clone(),
            self.events.clone(),
            session.market_kind,
            session.symbol.clone(),
            session.timeframe,
            knobs.clone(),
            shutdown_rx.clone(),
        )));

        info!(symbol = %session.symbol, market_kind = %session.market_kind, timeframe = %session.timeframe, "session started");

        Ok(RunningSession {
            session,
            shutdown: shutdown_handle,
            telemetry,
            knobs,
            tasks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_every_omitted_field() {
        let defaults = RuntimeConfig::default();
        let session = realize_start_args(StartArgs::default(), &defaults).unwrap();
        assert_eq!(session.symbol, "BTCUSDT");
        assert_eq!(session.market_kind, MarketKind::Spot);
        assert_eq!(session.timeframe, Timeframe::M1);
        assert_eq!(session.emit_interval_ms, 8);
        assert_eq!(session.clock_sync_interval_ms, 30_000);
        assert_eq!(session.history_limit, 1_000);
        assert_eq!(session.startup_mode, StartupMode::LiveFirst);
        assert!(!session.mock_mode);
    }

    #[test]
    fn emit_interval_ms_is_clamped_to_the_documented_range() {
        let defaults = RuntimeConfig::default();
        let mut args = StartArgs::default();
        args.emit_interval_ms = Some(1);
        let session = realize_start_args(args, &defaults).unwrap();
        assert_eq!(session.emit_interval_ms, 8);

        let mut args = StartArgs::default();
        args.emit_interval_ms = Some(5_000);
        let session = realize_start_args(args, &defaults).unwrap();
        assert_eq!(session.emit_interval_ms, 1_000);
    }

    #[test]
    fn clock_sync_interval_ms_is_clamped_to_the_documented_range() {
        let defaults = RuntimeConfig::default();
        let mut args = StartArgs::default();
        args.clock_sync_interval_ms = Some(1);
        let session = realize_start_args(args, &defaults).unwrap();
        assert_eq!(session.clock_sync_interval_ms, 5_000);

        let mut args = StartArgs::default();
        args.clock_sync_interval_ms = Some(10_000_000);
        let session = realize_start_args(args, &defaults).unwrap();
        assert_eq!(session.clock_sync_interval_ms, 300_000);
    }

    #[test]
    fn history_limit_is_clamped_to_the_documented_range() {
        let defaults = RuntimeConfig::default();
        let mut args = StartArgs::default();
        args.history_limit = Some(0);
        let session = realize_start_args(args, &defaults).unwrap();
        assert_eq!(session.history_limit, 1);

        let mut args = StartArgs::default();
        args.history_limit = Some(50_000_000);
        let session = realize_start_args(args, &defaults).unwrap();
        assert_eq!(session.history_limit, 2_000_000);
    }

    #[test]
    fn empty_symbol_is_rejected() {
        let defaults = RuntimeConfig::default();
        let mut args = StartArgs::default();
        args.symbol = Some("   ".into());
        let err = realize_start_args(args, &defaults).unwrap_err();
        assert!(err.is_command_visible());
    }

    #[test]
    fn symbol_is_upper_cased() {
        let defaults = RuntimeConfig::default();
        let mut args = StartArgs::default();
        args.symbol = Some("ethusdt".into());
        let session = realize_start_args(args, &defaults).unwrap();
        assert_eq!(session.symbol, "ETHUSDT");
    }

    #[test]
    fn same_stream_detects_identical_market_kind_symbol_timeframe() {
        let a = realize_start_args(StartArgs::default(), &RuntimeConfig::default()).unwrap();
        let mut args = StartArgs::default();
        args.min_notional_usdt = Some(500.0);
        let b = realize_start_args(args, &RuntimeConfig::default()).unwrap();
        assert!(a.same_stream(&b));

        let mut args = StartArgs::default();
        args.symbol = Some("ETHUSDT".into());
        let c = realize_start_args(args, &RuntimeConfig::default()).unwrap();
        assert!(!a.same_stream(&c));
    }

    #[tokio::test]
    async fn stopping_with_no_session_running_still_reports_stopped_true() {
        let controller = Controller::new(RuntimeConfig::default(), crate::events::new_event_sink());
        assert!(controller.stop().await);
        assert!(controller.stop().await);
        assert!(!controller.status().running);
    }

    #[tokio::test]
    async fn starting_in_mock_mode_then_stopping_tears_down_all_tasks() {
        let controller = Controller::new(RuntimeConfig::default(), crate::events::new_event_sink());
        let mut args = StartArgs::default();
        args.mock_mode = Some(true);
        args.symbol = Some("BTCUSDT".into());

        let session = controller.start(args).await.unwrap();
        assert!(session.mock_mode);
        assert!(controller.status().running);

        assert!(controller.stop().await);
        assert!(!controller.status().running);
    }
}
