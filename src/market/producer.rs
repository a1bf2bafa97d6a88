// =============================================================================
// Producer — owns the WebSocket connection, parses aggregated-trade frames,
// validates sequence continuity, triggers resync on gaps, and writes into
// ConflatedState. Single writer on the hot path.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::events::{EventSink, MarketEvent};
use crate::exchange::ExchangeClient;
use crate::types::{ConnectionState, MarketKind, Timeframe};

use super::conflated_state::ConflatedState;
use super::knobs::SessionKnobs;
use super::mock::run_mock_generator;
use super::shutdown::ShutdownSignal;
use super::telemetry::PipelineTelemetry;
use super::types::AggTrade;

const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROTOCOL_VIOLATION_RATE_THRESHOLD: u64 = 10;
const PROTOCOL_VIOLATION_WINDOW: Duration = Duration::from_secs(1);
const STATUS_REASON_THROTTLE_WINDOW: Duration = Duration::from_secs(2);

/// Collapses identical non-`live` status reasons seen within
/// `STATUS_REASON_THROTTLE_WINDOW` of each other into a single emission.
struct StatusReasonThrottle {
    last: Option<(String, Instant)>,
}

impl StatusReasonThrottle {
    fn new() -> Self {
        Self { last: None }
    }

    fn should_emit(&mut self, reason: &str) -> bool {
        let now = Instant::now();
        if let Some((last_reason, at)) = &self.last {
            if last_reason == reason && at.elapsed() < STATUS_REASON_THROTTLE_WINDOW {
                return false;
            }
        }
        self.last = Some((reason.to_string(), now));
        true
    }
}

/// Classifies a failed WS handshake as fatal (invalid symbol / permission
/// denied — the exchange rejected the request itself and retrying will never
/// help) versus transient (connection reset, DNS hiccup, timeout — worth
/// retrying with backoff).
fn classify_ws_connect_error(e: &tokio_tungstenite::tungstenite::Error) -> Option<PipelineError> {
    if let tokio_tungstenite::tungstenite::Error::Http(response) = e {
        let status = response.status();
        if status.is_client_error() && status.as_u16() != 429 {
            return Some(PipelineError::FatalRejection {
                reason: format!("exchange rejected websocket handshake with HTTP {status}"),
            });
        }
    }
    None
}

/// Outcome of validating one aggregate id against the last applied one.
#[derive(Debug, PartialEq)]
enum SequenceOutcome {
    FirstTrade,
    Consecutive,
    Gap { missed: u64 },
    DuplicateOrStale,
}

struct SequenceTracker {
    last_agg_id: Option<u64>,
}

impl SequenceTracker {
    fn new() -> Self {
        Self { last_agg_id: None }
    }

    fn validate(&mut self, id: u64) -> SequenceOutcome {
        match self.last_agg_id {
            None => {
                self.last_agg_id = Some(id);
                SequenceOutcome::FirstTrade
            }
            Some(last) if id == last + 1 => {
                self.last_agg_id = Some(id);
                SequenceOutcome::Consecutive
            }
            Some(last) if id > last + 1 => {
                let missed = id - last - 1;
                // last_agg_id is not advanced here: resync will reset it
                // explicitly once fetch_last_agg_id returns.
                SequenceOutcome::Gap { missed }
            }
            Some(_) => SequenceOutcome::DuplicateOrStale,
        }
    }

    fn reset(&mut self, id: u64) {
        self.last_agg_id = Some(id);
    }
}

pub struct ProducerConfig {
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub knobs: Arc<SessionKnobs>,
    pub mock_mode: bool,
}

/// Drives the Producer for one session until `shutdown` fires or a fatal
/// error terminates the pipeline.
pub async fn run_producer(
    client: Arc<ExchangeClient>,
    state: Arc<ConflatedState>,
    telemetry: Arc<PipelineTelemetry>,
    events: EventSink,
    config: ProducerConfig,
    mut shutdown: ShutdownSignal,
) {
    if config.mock_mode {
        run_mock_generator(state, telemetry, events, config, shutdown).await;
        return;
    }

    telemetry.set_connection_state(ConnectionState::Connecting);
    let mut tracker = SequenceTracker::new();
    let mut protocol_violations_in_window = (Instant::now(), 0u64);
    let mut status_throttle = StatusReasonThrottle::new();

    'session: loop {
        if *shutdown.borrow() {
            break;
        }

        let url = client.websocket_agg_trade_url(&config.symbol);
        let connect_result = tokio::time::timeout(WS_CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&url)).await;

        let ws_stream = match connect_result {
            Ok(Ok((stream, _resp))) => stream,
            Ok(Err(e)) => {
                if let Some(fatal) = classify_ws_connect_error(&e) {
                    error!(reason = %fatal, url, "fatal websocket rejection, terminating pipeline");
                    telemetry.set_connection_state(ConnectionState::Error);
                    emit_status(&events, &telemetry, &config, &mut status_throttle, ConnectionState::Error, Some(fatal.status_reason()));
                    break 'session;
                }
                warn!(error = %e, url, "websocket connect failed, retrying");
                emit_status(&events, &telemetry, &config, &mut status_throttle, ConnectionState::Reconnecting, Some(format!("connect failed: {e}")));
                telemetry.set_connection_state(ConnectionState::Reconnecting);
                if sleep_or_shutdown(Duration::from_secs(1), &mut shutdown).await {
                    break;
                }
                continue;
            }
            Err(_) => {
                warn!(url, "websocket connect timed out, retrying");
                emit_status(&events, &telemetry, &config, &mut status_throttle, ConnectionState::Reconnecting, Some("connect timed out".into()));
                telemetry.set_connection_state(ConnectionState::Reconnecting);
                if sleep_or_shutdown(Duration::from_secs(1), &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let mut first_frame_since_resync = true;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.close().await;
                    break 'session;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let enqueue_time = Instant::now();
                            let parse_start = Instant::now();
                            let parsed = parse_agg_trade(&text);
                            let parse_us = parse_start.elapsed().as_micros() as f64;
                            telemetry.record_parse_us(parse_us);

                            let trade = match parsed {
                                Ok(t) => t,
                                Err(e) => {
                                    let count = record_protocol_violation(&mut protocol_violations_in_window, &telemetry);
                                    debug!(error = %e, "dropping unparseable agg trade frame");
                                    if count > PROTOCOL_VIOLATION_RATE_THRESHOLD {
                                        error!("sustained protocol violations, transitioning to error state");
                                        telemetry.set_connection_state(ConnectionState::Error);
                                        emit_status(&events, &telemetry, &config, &mut status_throttle, ConnectionState::Error, Some("sustained protocol violations".into()));
                                        break 'session;
                                    }
                                    continue;
                                }
                            };

                            let raw_latency = trade.event_time_ms - local_now_ms();
                            telemetry.set_raw_exchange_latency_ms(raw_latency);

                            match tracker.validate(trade.aggregate_id) {
                                SequenceOutcome::DuplicateOrStale => continue,
                                SequenceOutcome::Gap { missed } => {
                                    warn!(missed, last_agg_id = telemetry.last_agg_id(), "sequence gap detected, starting resync");
                                    telemetry.set_connection_state(ConnectionState::Desynced);
                                    emit_status(&events, &telemetry, &config, &mut status_throttle, ConnectionState::Desynced, Some(format!("missed={missed}")));

                                    let _ = write.close().await;
                                    if !resync(&client, &config, &telemetry, &events, &mut status_throttle, &mut tracker, &mut shutdown).await {
                                        break 'session;
                                    }
                                    first_frame_since_resync = true;
                                    break;
                                }
                                SequenceOutcome::FirstTrade | SequenceOutcome::Consecutive => {
                                    telemetry.set_last_agg_id(trade.aggregate_id);
                                    telemetry.increment_ingest();

                                    if trade.notional() >= config.knobs.min_notional_usdt() {
                                        let apply_start = Instant::now();
                                        state.apply_trade(&trade);
                                        let apply_us = apply_start.elapsed().as_micros() as f64;
                                        telemetry.record_apply_us(apply_us);
                                    }

                                    telemetry.set_local_pipeline_latency_ms(enqueue_time.elapsed().as_millis() as i64);

                                    if first_frame_since_resync {
                                        first_frame_since_resync = false;
                                        telemetry.set_connection_state(ConnectionState::Live);
                                        emit_status(&events, &telemetry, &config, &mut status_throttle, ConnectionState::Live, None);
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("websocket closed, reconnecting");
                            telemetry.set_connection_state(ConnectionState::Reconnecting);
                            emit_status(&events, &telemetry, &config, &mut status_throttle, ConnectionState::Reconnecting, Some("remote closed connection".into()));
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket read error, reconnecting");
                            telemetry.set_connection_state(ConnectionState::Reconnecting);
                            emit_status(&events, &telemetry, &config, &mut status_throttle, ConnectionState::Reconnecting, Some(format!("read error: {e}")));
                            break;
                        }
                    }
                }
            }
        }

        if telemetry.connection_state() == ConnectionState::Error {
            break;
        }
        if sleep_or_shutdown(Duration::from_millis(250), &mut shutdown).await {
            break;
        }
    }

    telemetry.set_connection_state(ConnectionState::Stopped);
}

/// The resync protocol: refetch `last_agg_id`, reset the tracker, reopen WS
/// on the next loop iteration. Returns `false` if shutdown fired meanwhile.
async fn resync(
    client: &Arc<ExchangeClient>,
    config: &ProducerConfig,
    telemetry: &Arc<PipelineTelemetry>,
    events: &EventSink,
    throttle: &mut StatusReasonThrottle,
    tracker: &mut SequenceTracker,
    shutdown: &mut ShutdownSignal,
) -> bool {
    telemetry.set_connection_state(ConnectionState::Reconnecting);
    emit_status(events, telemetry, config, throttle, ConnectionState::Reconnecting, Some("resyncing last_agg_id".into()));

    match client.fetch_last_agg_id(&config.symbol).await {
        Ok(id) => {
            tracker.reset(id);
            telemetry.set_last_agg_id(id);
        }
        Err(e) => {
            warn!(error = %e, "fetch_last_agg_id failed during resync, will retry on reconnect");
        }
    }

    !sleep_or_shutdown(Duration::from_millis(250), shutdown).await
}

/// Sleeps for `dur` unless shutdown fires first. Returns `true` if shutdown
/// fired (caller should stop looping).
async fn sleep_or_shutdown(dur: Duration, shutdown: &mut ShutdownSignal) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(dur) => false,
    }
}

fn record_protocol_violation(window: &mut (Instant, u64), telemetry: &Arc<PipelineTelemetry>) -> u64 {
    if window.0.elapsed() > PROTOCOL_VIOLATION_WINDOW {
        *window = (Instant::now(), 0);
    }
    window.1 += 1;
    telemetry.increment_protocol_violation();
    window.1
}

fn local_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn emit_status(
    events: &EventSink,
    telemetry: &Arc<PipelineTelemetry>,
    config: &ProducerConfig,
    throttle: &mut StatusReasonThrottle,
    state: ConnectionState,
    reason: Option<String>,
) {
    if state != ConnectionState::Live {
        if let Some(r) = &reason {
            if !throttle.should_emit(r) {
                return;
            }
        }
    }

    let _ = events.send(MarketEvent::MarketStatus {
        state,
        market_kind: config.market_kind,
        symbol: config.symbol.clone(),
        timeframe: config.timeframe,
        last_agg_id: Some(telemetry.last_agg_id()),
        latency_ms: Some(telemetry.legacy_latency_ms()),
        raw_exchange_latency_ms: Some(telemetry.raw_exchange_latency_ms()),
        clock_offset_ms: Some(telemetry.clock_offset_ms()),
        adjusted_network_latency_ms: Some(telemetry.adjusted_network_latency_ms()),
        local_pipeline_latency_ms: Some(telemetry.local_pipeline_latency_ms()),
        reason,
    });
}

/// Parse one `{e,E,s,a,p,q,T,m}` aggTrade frame. Scalars are decoded directly
/// from the JSON value without copying the payload buffer.
fn parse_agg_trade(text: &str) -> Result<AggTrade> {
    let v: Value = serde_json::from_str(text).context("decoding agg trade JSON")?;

    let aggregate_id = v.get("a").and_then(Value::as_u64).ok_or_else(|| anyhow!("missing `a`"))?;
    let price: f64 = v
        .get("p")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing `p`"))?
        .parse()
        .context("parsing `p`")?;
    let quantity: f64 = v
        .get("q")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing `q`"))?
        .parse()
        .context("parsing `q`")?;
    let buyer_is_maker = v.get("m").and_then(Value::as_bool).ok_or_else(|| anyhow!("missing `m`"))?;
    let trade_time_ms = v.get("T").and_then(Value::as_i64).ok_or_else(|| anyhow!("missing `T`"))?;
    let event_time_ms = v.get("E").and_then(Value::as_i64).ok_or_else(|| anyhow!("missing `E`"))?;

    Ok(AggTrade {
        aggregate_id,
        price,
        quantity,
        buyer_is_maker,
        trade_time_ms,
        event_time_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_agg_trade_reads_bit_exact_field_schema() {
        let text = r#"{"e":"aggTrade","E":1609459200123,"s":"BTCUSDT","a":100,"p":"100.00","q":"2.00","f":1,"l":1,"T":1609459200100,"m":false}"#;
        let trade = parse_agg_trade(text).unwrap();
        assert_eq!(trade.aggregate_id, 100);
        assert_eq!(trade.price, 100.0);
        assert_eq!(trade.quantity, 2.0);
        assert!(!trade.buyer_is_maker);
        assert_eq!(trade.trade_time_ms, 1_609_459_200_100);
        assert_eq!(trade.event_time_ms, 1_609_459_200_123);
    }

    #[test]
    fn parse_agg_trade_rejects_missing_fields() {
        let text = r#"{"e":"aggTrade","a":100}"#;
        assert!(parse_agg_trade(text).is_err());
    }

    #[test]
    fn sequence_tracker_first_trade_has_no_gap_check() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.validate(100), SequenceOutcome::FirstTrade);
    }

    #[test]
    fn sequence_tracker_detects_consecutive_gap_and_duplicate() {
        let mut t = SequenceTracker::new();
        t.validate(100);
        assert_eq!(t.validate(101), SequenceOutcome::Consecutive);
        assert_eq!(t.validate(105), SequenceOutcome::Gap { missed: 3 });
        t.reset(105);
        assert_eq!(t.validate(105), SequenceOutcome::DuplicateOrStale);
        assert_eq!(t.validate(104), SequenceOutcome::DuplicateOrStale);
    }

    #[test]
    fn status_reason_throttle_suppresses_identical_reason_within_window() {
        let mut throttle = StatusReasonThrottle::new();
        assert!(throttle.should_emit("connect failed: reset"));
        assert!(!throttle.should_emit("connect failed: reset"));
    }

    #[test]
    fn status_reason_throttle_admits_a_different_reason_immediately() {
        let mut throttle = StatusReasonThrottle::new();
        assert!(throttle.should_emit("connect failed: reset"));
        assert!(throttle.should_emit("connect timed out"));
    }

    #[test]
    fn classify_ws_connect_error_flags_client_error_as_fatal() {
        let resp = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(451)
            .body(None)
            .unwrap();
        let err = tokio_tungstenite::tungstenite::Error::Http(resp);
        let classified = classify_ws_connect_error(&err);
        assert!(matches!(classified, Some(PipelineError::FatalRejection { .. })));
    }

    #[test]
    fn classify_ws_connect_error_treats_rate_limit_as_transient() {
        let resp = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(429)
            .body(None)
            .unwrap();
        let err = tokio_tungstenite::tungstenite::Error::Http(resp);
        assert!(classify_ws_connect_error(&err).is_none());
    }

    #[test]
    fn classify_ws_connect_error_treats_non_http_errors_as_transient() {
        let err = tokio_tungstenite::tungstenite::Error::ConnectionClosed;
        assert!(classify_ws_connect_error(&err).is_none());
    }
}
