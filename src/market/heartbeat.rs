// =============================================================================
// Heartbeat — a periodic `market_status` pulse independent of Producer state
// transitions (so a UI reconnecting mid-session gets a fresh snapshot within
// one second), plus the optional `market_perf` cadence when perf telemetry is
// enabled for the session.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::events::{EventSink, MarketEvent};
use crate::types::{MarketKind, Timeframe};

use super::knobs::SessionKnobs;
use super::shutdown::ShutdownSignal;
use super::telemetry::PipelineTelemetry;

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
const PERF_INTERVAL: Duration = Duration::from_millis(5000);

pub async fn run_heartbeat(
    telemetry: Arc<PipelineTelemetry>,
    events: EventSink,
    market_kind: MarketKind,
    symbol: String,
    timeframe: Timeframe,
    knobs: Arc<SessionKnobs>,
    mut shutdown: ShutdownSignal,
) {
    let mut status_tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut perf_tick = tokio::time::interval(PERF_INTERVAL);
    perf_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = status_tick.tick() => {
                let _ = events.send(MarketEvent::MarketStatus {
                    state: telemetry.connection_state(),
                    market_kind,
                    symbol: symbol.clone(),
                    timeframe,
                    last_agg_id: Some(telemetry.last_agg_id()),
                    latency_ms: Some(telemetry.legacy_latency_ms()),
                    raw_exchange_latency_ms: Some(telemetry.raw_exchange_latency_ms()),
                    clock_offset_ms: Some(telemetry.clock_offset_ms()),
                    adjusted_network_latency_ms: Some(telemetry.adjusted_network_latency_ms()),
                    local_pipeline_latency_ms: Some(telemetry.local_pipeline_latency_ms()),
                    reason: None,
                });
            }
            _ = perf_tick.tick() => {
                if knobs.perf_telemetry() {
                    let _ = events.send(MarketEvent::MarketPerf { snapshot: telemetry.perf_snapshot() });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::shutdown::ShutdownHandle;

    #[tokio::test]
    async fn emits_a_status_pulse_without_any_producer_activity() {
        let telemetry = Arc::new(PipelineTelemetry::new());
        let events: EventSink = crate::events::new_event_sink();
        let mut rx = events.subscribe();
        let knobs = Arc::new(SessionKnobs::new(0.0, false, false, false));
        let (handle, shutdown_rx) = ShutdownHandle::new();

        let task = tokio::spawn(run_heartbeat(
            telemetry,
            events,
            MarketKind::Spot,
            "BTCUSDT".to_string(),
            Timeframe::M1,
            knobs,
            shutdown_rx,
        ));

        let event = tokio::time::timeout(Duration::from_millis(1500), rx.recv())
            .await
            .expect("timed out waiting for heartbeat")
            .unwrap();
        assert!(matches!(event, MarketEvent::MarketStatus { .. }));

        handle.signal();
        tokio::time::timeout(Duration::from_millis(200), task).await.unwrap().unwrap();
    }
}
