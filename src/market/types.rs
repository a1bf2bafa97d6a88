// =============================================================================
// Core data model: inbound AggTrade, the Candle/DeltaCandle aggregates, the
// minimal UiTick payload, and history-load progress reporting.
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single aggregated-trade event from the exchange WebSocket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggTrade {
    pub aggregate_id: u64,
    pub price: f64,
    pub quantity: f64,
    pub buyer_is_maker: bool,
    pub trade_time_ms: i64,
    pub event_time_ms: i64,
}

impl AggTrade {
    /// `p * q`, the USDT-equivalent size of the trade.
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }

    /// `-1` if the buyer was the maker (aggressive seller), `+1` otherwise.
    /// `0` is reserved for synthetic ticks with no direction, never produced
    /// here.
    pub fn direction(&self) -> i8 {
        if self.buyer_is_maker {
            -1
        } else {
            1
        }
    }

    /// The signed quantity this trade contributes to the running delta
    /// candle: positive for an aggressive buyer, negative for an aggressive
    /// seller.
    pub fn signed_quantity(&self) -> f64 {
        if self.buyer_is_maker {
            -self.quantity
        } else {
            self.quantity
        }
    }
}

/// OHLCV tuple for one bucket. `t` is the bucket open time in ms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

impl Candle {
    pub fn open(t: i64, price: f64, quantity: f64) -> Self {
        Self {
            t,
            o: price,
            h: price,
            l: price,
            c: price,
            v: quantity,
        }
    }

    pub fn apply(&mut self, price: f64, quantity: f64) {
        self.h = self.h.max(price);
        self.l = self.l.min(price);
        self.c = price;
        self.v += quantity;
    }

    /// `l <= min(o,c) <= max(o,c) <= h` and `v >= 0`.
    pub fn is_consistent(&self) -> bool {
        let lo = self.o.min(self.c);
        let hi = self.o.max(self.c);
        self.l <= lo && lo <= hi && hi <= self.h && self.v >= 0.0
    }
}

/// OHLCV-shaped view of signed trade flow: positive for buyer-aggressor,
/// negative for seller-aggressor. `h`/`l` are running-sum extremes, not
/// per-trade signed extremes (see design notes).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeltaCandle {
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

impl DeltaCandle {
    pub fn open(t: i64, signed_quantity: f64, quantity: f64) -> Self {
        Self {
            t,
            o: signed_quantity,
            h: signed_quantity,
            l: signed_quantity,
            c: signed_quantity,
            v: quantity,
        }
    }

    pub fn apply(&mut self, signed_quantity: f64, quantity: f64) {
        self.c += signed_quantity;
        self.h = self.h.max(self.c);
        self.l = self.l.min(self.c);
        self.v += quantity;
    }

    /// `l <= c <= h` and `|c - o|` bounded by `v`.
    pub fn is_consistent(&self) -> bool {
        self.l <= self.c && self.c <= self.h && (self.c - self.o).abs() <= self.v + f64::EPSILON
    }
}

/// Minimal per-trade payload, emitted only when legacy emission is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UiTick {
    pub t: i64,
    pub p: f64,
    pub v: f64,
    pub d: i8,
}

/// Progress record for a paginated full-history fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryLoadProgress {
    pub market_kind: crate::types::MarketKind,
    pub symbol: String,
    pub timeframe: crate::types::Timeframe,
    pub pages_fetched: u32,
    pub candles_fetched: u64,
    pub estimated_total_candles: Option<u64>,
    pub progress_pct: Option<f64>,
    pub done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_rollup_stays_consistent() {
        let mut c = Candle::open(0, 100.0, 2.0);
        c.apply(101.0, 1.0);
        c.apply(100.5, 1.0);
        assert_eq!(c, Candle { t: 0, o: 100.0, h: 101.0, l: 100.0, c: 100.5, v: 4.0 });
        assert!(c.is_consistent());
    }

    #[test]
    fn delta_candle_matches_scenario_one_from_spec() {
        // trades: +2 (buy), -1 (sell), +1 (buy)
        let mut d = DeltaCandle::open(0, 2.0, 2.0);
        d.apply(-1.0, 1.0);
        d.apply(1.0, 1.0);
        assert_eq!(d.o, 2.0);
        assert_eq!(d.h, 2.0);
        assert_eq!(d.l, 1.0);
        assert_eq!(d.c, 2.0);
        assert_eq!(d.v, 4.0);
        assert!(d.is_consistent());
    }

    #[test]
    fn direction_and_signed_quantity_match_buyer_is_maker() {
        let buy = AggTrade {
            aggregate_id: 1,
            price: 1.0,
            quantity: 2.0,
            buyer_is_maker: false,
            trade_time_ms: 0,
            event_time_ms: 0,
        };
        assert_eq!(buy.direction(), 1);
        assert_eq!(buy.signed_quantity(), 2.0);

        let sell = AggTrade {
            buyer_is_maker: true,
            ..buy
        };
        assert_eq!(sell.direction(), -1);
        assert_eq!(sell.signed_quantity(), -2.0);
    }

    #[test]
    fn notional_is_price_times_quantity() {
        let t = AggTrade {
            aggregate_id: 1,
            price: 10.0,
            quantity: 1.0,
            buyer_is_maker: false,
            trade_time_ms: 0,
            event_time_ms: 0,
        };
        assert_eq!(t.notional(), 10.0);
    }
}
