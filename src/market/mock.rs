// =============================================================================
// Mock mode — a deterministic local trade generator that feeds the same
// apply_trade path as the real WebSocket, so the rest of the pipeline can be
// exercised without reaching the exchange.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::events::{EventSink, MarketEvent};
use crate::types::ConnectionState;

use super::conflated_state::ConflatedState;
use super::producer::ProducerConfig;
use super::shutdown::ShutdownSignal;
use super::telemetry::PipelineTelemetry;
use super::types::AggTrade;

const MOCK_SEED: u64 = 42;
const MOCK_TICK_INTERVAL_MS: u64 = 50;
const MOCK_STEP: f64 = 0.5;

pub async fn run_mock_generator(
    state: Arc<ConflatedState>,
    telemetry: Arc<PipelineTelemetry>,
    events: EventSink,
    config: ProducerConfig,
    mut shutdown: ShutdownSignal,
) {
    info!(symbol = %config.symbol, "running mock market data generator");
    telemetry.set_connection_state(ConnectionState::Live);
    let _ = events.send(MarketEvent::MarketStatus {
        state: ConnectionState::Live,
        market_kind: config.market_kind,
        symbol: config.symbol.clone(),
        timeframe: config.timeframe,
        last_agg_id: Some(0),
        latency_ms: Some(0),
        raw_exchange_latency_ms: Some(0),
        clock_offset_ms: Some(0),
        adjusted_network_latency_ms: Some(0),
        local_pipeline_latency_ms: Some(0),
        reason: Some("mock mode".into()),
    });

    let mut rng = StdRng::seed_from_u64(MOCK_SEED);
    let mut price = 100.0_f64;
    let mut agg_id = 1u64;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let step = rng.gen_range(-MOCK_STEP..=MOCK_STEP);
        price = (price + step).max(0.01);
        let quantity = rng.gen_range(0.01..2.0);
        let buyer_is_maker = rng.gen_bool(0.5);
        let now = chrono::Utc::now().timestamp_millis();

        let trade = AggTrade {
            aggregate_id: agg_id,
            price,
            quantity,
            buyer_is_maker,
            trade_time_ms: now,
            event_time_ms: now,
        };

        telemetry.set_last_agg_id(agg_id);
        telemetry.increment_ingest();
        if trade.notional() >= config.knobs.min_notional_usdt() {
            state.apply_trade(&trade);
        }
        agg_id += 1;

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(Duration::from_millis(MOCK_TICK_INTERVAL_MS)) => {}
        }
    }

    telemetry.set_connection_state(ConnectionState::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_seed_is_deterministic_across_runs() {
        let mut a = StdRng::seed_from_u64(MOCK_SEED);
        let mut b = StdRng::seed_from_u64(MOCK_SEED);
        let seq_a: Vec<f64> = (0..5).map(|_| a.gen_range(-MOCK_STEP..=MOCK_STEP)).collect();
        let seq_b: Vec<f64> = (0..5).map(|_| b.gen_range(-MOCK_STEP..=MOCK_STEP)).collect();
        assert_eq!(seq_a, seq_b);
    }
}
