// =============================================================================
// ConflatedState — the single mutable rendezvous between Producer (writer)
// and Consumer (reader). Guarded by a fast mutex whose critical section is
// arithmetic and field assignment only: no I/O, no allocation beyond what a
// field write implies.
// =============================================================================

use parking_lot::Mutex;

use super::types::{AggTrade, Candle, DeltaCandle, UiTick};
use crate::types::Timeframe;

struct Inner {
    current_candle: Option<Candle>,
    current_delta_candle: Option<DeltaCandle>,
    last_tick: Option<UiTick>,
    dirty: bool,
}

/// A point-in-time read of the conflated state, taken by the Consumer. The
/// three payload fields are only `Some` if a write has landed since the last
/// snapshot; `was_dirty` mirrors the state's `dirty` flag at read time.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitSnapshot {
    pub candle: Option<Candle>,
    pub delta_candle: Option<DeltaCandle>,
    pub last_tick: Option<UiTick>,
    pub was_dirty: bool,
}

pub struct ConflatedState {
    inner: Mutex<Inner>,
    bucket_ms: i64,
}

impl ConflatedState {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            inner: Mutex::new(Inner {
                current_candle: None,
                current_delta_candle: None,
                last_tick: None,
                dirty: false,
            }),
            bucket_ms: timeframe.bucket_ms(),
        }
    }

    /// Producer-only. Rolls the candle/delta-candle into a new bucket if the
    /// trade falls outside the current one, then folds the trade in.
    pub fn apply_trade(&self, trade: &AggTrade) {
        let t = (trade.trade_time_ms / self.bucket_ms) * self.bucket_ms;
        let mut inner = self.inner.lock();

        match &mut inner.current_candle {
            Some(c) if c.t == t => c.apply(trade.price, trade.quantity),
            _ => inner.current_candle = Some(Candle::open(t, trade.price, trade.quantity)),
        }

        let signed_q = trade.signed_quantity();
        match &mut inner.current_delta_candle {
            Some(d) if d.t == t => d.apply(signed_q, trade.quantity),
            _ => inner.current_delta_candle = Some(DeltaCandle::open(t, signed_q, trade.quantity)),
        }

        inner.last_tick = Some(UiTick {
            t: trade.trade_time_ms,
            p: trade.price,
            v: trade.quantity,
            d: trade.direction(),
        });
        inner.dirty = true;
    }

    /// Consumer-only. Reads the three fields, clears `dirty`, returns a copy.
    pub fn snapshot_for_emit(&self) -> EmitSnapshot {
        let mut inner = self.inner.lock();
        let snapshot = EmitSnapshot {
            candle: inner.current_candle,
            delta_candle: inner.current_delta_candle,
            last_tick: inner.last_tick,
            was_dirty: inner.dirty,
        };
        inner.dirty = false;
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(id: u64, t_ms: i64, price: f64, qty: f64, buyer_is_maker: bool) -> AggTrade {
        AggTrade {
            aggregate_id: id,
            price,
            quantity: qty,
            buyer_is_maker,
            trade_time_ms: t_ms,
            event_time_ms: t_ms,
        }
    }

    #[test]
    fn snapshot_clears_dirty_flag() {
        let state = ConflatedState::new(Timeframe::M1);
        state.apply_trade(&trade(1, 1_000, 100.0, 1.0, false));
        let first = state.snapshot_for_emit();
        assert!(first.was_dirty);

        let second = state.snapshot_for_emit();
        assert!(!second.was_dirty);
        // candle/tick are still returned by value even when not dirty.
        assert!(second.candle.is_some());
    }

    #[test]
    fn bucket_rollover_starts_a_fresh_candle() {
        let state = ConflatedState::new(Timeframe::M1);
        state.apply_trade(&trade(1, 59_999, 100.0, 1.0, false));
        let first = state.snapshot_for_emit().candle.unwrap();
        assert_eq!(first.t, 0);

        state.apply_trade(&trade(2, 60_001, 101.0, 1.0, false));
        let second = state.snapshot_for_emit().candle.unwrap();
        assert_eq!(second.t, 60_000);
        assert_eq!(second.o, 101.0);
    }

    #[test]
    fn happy_path_scenario_from_spec() {
        let state = ConflatedState::new(Timeframe::M1);
        state.apply_trade(&trade(100, 1_000, 100.0, 2.0, false));
        state.apply_trade(&trade(101, 2_000, 101.0, 1.0, true));
        state.apply_trade(&trade(102, 3_000, 100.5, 1.0, false));

        let snap = state.snapshot_for_emit();
        let candle = snap.candle.unwrap();
        assert_eq!(candle, Candle { t: 0, o: 100.0, h: 101.0, l: 100.0, c: 100.5, v: 4.0 });

        let delta = snap.delta_candle.unwrap();
        assert_eq!(delta.o, 2.0);
        assert_eq!(delta.h, 2.0);
        assert_eq!(delta.l, 1.0);
        assert_eq!(delta.c, 2.0);
        assert_eq!(delta.v, 4.0);
    }
}
