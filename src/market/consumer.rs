// =============================================================================
// Consumer — runs on a fixed emission interval, reads ConflatedState, emits
// one combined frame per tick when dirty, plus optional legacy per-channel
// events. Drift is absorbed by skipping missed ticks, never by coalescing.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::events::{EventSink, MarketEvent};

use super::conflated_state::ConflatedState;
use super::knobs::SessionKnobs;
use super::shutdown::ShutdownSignal;
use super::telemetry::PipelineTelemetry;

pub struct ConsumerConfig {
    pub emit_interval_ms: u64,
    pub knobs: Arc<SessionKnobs>,
}

pub async fn run_consumer(
    state: Arc<ConflatedState>,
    telemetry: Arc<PipelineTelemetry>,
    events: EventSink,
    config: ConsumerConfig,
    mut shutdown: ShutdownSignal,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(config.emit_interval_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let snapshot = state.snapshot_for_emit();
                if !snapshot.was_dirty {
                    continue;
                }

                telemetry.increment_emit();
                let _ = events.send(MarketEvent::MarketFrameUpdate {
                    tick: snapshot.last_tick,
                    candle: snapshot.candle,
                    delta_candle: snapshot.delta_candle,
                    local_pipeline_latency_ms: Some(telemetry.local_pipeline_latency_ms()),
                });

                if config.knobs.emit_legacy_price_event() {
                    if let Some(tick) = snapshot.last_tick {
                        let _ = events.send(MarketEvent::PriceUpdate { tick });
                    }
                }

                if config.knobs.emit_legacy_frame_events() {
                    if let Some(candle) = snapshot.candle {
                        let _ = events.send(MarketEvent::CandleUpdate { candle });
                    }
                    if let Some(delta_candle) = snapshot.delta_candle {
                        let _ = events.send(MarketEvent::DeltaCandleUpdate { delta_candle });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{AggTrade, Candle};
    use crate::types::Timeframe;

    #[tokio::test]
    async fn emits_only_when_dirty_and_stops_on_shutdown() {
        let state = Arc::new(ConflatedState::new(Timeframe::M1));
        let telemetry = Arc::new(PipelineTelemetry::new());
        let events: EventSink = crate::events::new_event_sink();
        let mut rx = events.subscribe();

        state.apply_trade(&AggTrade {
            aggregate_id: 1,
            price: 100.0,
            quantity: 1.0,
            buyer_is_maker: false,
            trade_time_ms: 0,
            event_time_ms: 0,
        });

        let (shutdown_handle, shutdown_rx) = super::super::shutdown::ShutdownHandle::new();
        let config = ConsumerConfig {
            emit_interval_ms: 5,
            knobs: Arc::new(super::knobs::SessionKnobs::new(0.0, false, false, false)),
        };

        let handle = tokio::spawn(run_consumer(state, telemetry.clone(), events, config, shutdown_rx));

        let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .unwrap();
        match event {
            MarketEvent::MarketFrameUpdate { candle: Some(c), .. } => {
                assert_eq!(c, Candle { t: 0, o: 100.0, h: 100.0, l: 100.0, c: 100.0, v: 1.0 });
            }
            other => panic!("unexpected event: {other:?}"),
        }

        shutdown_handle.signal();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("consumer did not stop after shutdown")
            .unwrap();
        assert_eq!(telemetry.emit_count(), 1);
    }
}
