// =============================================================================
// MarketEvent — the one-way, published side of the external interface.
// Fanned out to WebSocket subscribers over a bounded broadcast channel; a
// lagging subscriber loses its oldest unread frames rather than stalling the
// Consumer (see EventSink).
// =============================================================================

use serde::Serialize;

use crate::market::telemetry::PerfSnapshot;
use crate::market::types::{Candle, DeltaCandle, HistoryLoadProgress, UiTick};
use crate::types::{ConnectionState, MarketKind, Timeframe};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MarketEvent {
    MarketStatus {
        state: ConnectionState,
        market_kind: MarketKind,
        symbol: String,
        timeframe: Timeframe,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_agg_id: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_exchange_latency_ms: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        clock_offset_ms: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        adjusted_network_latency_ms: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        local_pipeline_latency_ms: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    MarketFrameUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        tick: Option<UiTick>,
        #[serde(skip_serializing_if = "Option::is_none")]
        candle: Option<Candle>,
        #[serde(skip_serializing_if = "Option::is_none")]
        delta_candle: Option<DeltaCandle>,
        #[serde(skip_serializing_if = "Option::is_none")]
        local_pipeline_latency_ms: Option<i64>,
    },
    CandlesBootstrap {
        #[serde(skip_serializing_if = "Option::is_none")]
        market_kind: Option<MarketKind>,
        symbol: String,
        timeframe: Timeframe,
        candles: Vec<Candle>,
    },
    DeltaCandlesBootstrap {
        #[serde(skip_serializing_if = "Option::is_none")]
        market_kind: Option<MarketKind>,
        symbol: String,
        timeframe: Timeframe,
        candles: Vec<DeltaCandle>,
    },
    CandleUpdate {
        candle: Candle,
    },
    DeltaCandleUpdate {
        delta_candle: DeltaCandle,
    },
    PriceUpdate {
        tick: UiTick,
    },
    MarketPerf {
        #[serde(flatten)]
        snapshot: PerfSnapshot,
    },
    HistoryLoadProgress {
        #[serde(flatten)]
        progress: HistoryLoadProgress,
    },
}

/// Sink the Consumer and other tasks publish into. A bounded broadcast
/// channel: if a subscriber falls behind, it drops the oldest unread frames
/// (surfaced to it as `RecvError::Lagged`) rather than ever blocking the
/// publishing side.
pub type EventSink = tokio::sync::broadcast::Sender<MarketEvent>;

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub fn new_event_sink() -> EventSink {
    let (tx, _rx) = tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_status_serializes_with_event_tag_and_omits_none_fields() {
        let event = MarketEvent::MarketStatus {
            state: ConnectionState::Live,
            market_kind: MarketKind::Spot,
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            last_agg_id: Some(102),
            latency_ms: None,
            raw_exchange_latency_ms: None,
            clock_offset_ms: None,
            adjusted_network_latency_ms: None,
            local_pipeline_latency_ms: None,
            reason: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "market_status");
        assert_eq!(json["state"], "live");
        assert_eq!(json["last_agg_id"], 102);
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn lagging_subscriber_observes_dropped_frames_not_a_block() {
        let tx = new_event_sink();
        let mut rx = tx.subscribe();
        for _ in 0..(EVENT_CHANNEL_CAPACITY + 10) {
            let _ = tx.send(MarketEvent::PriceUpdate {
                tick: UiTick { t: 0, p: 1.0, v: 1.0, d: 1 },
            });
        }
        match rx.try_recv() {
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => {}
            other => panic!("expected Lagged, got {other:?}"),
        }
    }
}
