// =============================================================================
// HistoryLoader — paginated REST loader for OHLCV, with progress reporting.
// Runs in parallel to live startup (LiveFirst) or ahead of it (HistoryFirst).
// Cancelled cleanly if the session is replaced.
// =============================================================================

use std::sync::Arc;

use tracing::warn;

use crate::events::{EventSink, MarketEvent};
use crate::exchange::ExchangeClient;
use crate::market::types::HistoryLoadProgress;
use crate::types::{MarketKind, Timeframe};

const PAGE_LIMIT: u32 = 1000;

#[derive(Clone)]
pub struct HistoryRequest {
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub history_limit: u32,
    pub history_all: bool,
}

/// Single-page bootstrap: fetch one page of `history_limit` candles and emit
/// `candles_bootstrap` plus an empty `delta_candles_bootstrap` (aggressor-side
/// history is not available at scale; the live stream fills it forward).
pub async fn load_single_page(client: &ExchangeClient, events: &EventSink, req: &HistoryRequest) {
    match client
        .fetch_klines(&req.symbol, req.timeframe, None, None, req.history_limit)
        .await
    {
        Ok(candles) => {
            let _ = events.send(MarketEvent::CandlesBootstrap {
                market_kind: Some(req.market_kind),
                symbol: req.symbol.clone(),
                timeframe: req.timeframe,
                candles,
            });
            let _ = events.send(MarketEvent::DeltaCandlesBootstrap {
                market_kind: Some(req.market_kind),
                symbol: req.symbol.clone(),
                timeframe: req.timeframe,
                candles: Vec::new(),
            });
        }
        Err(e) => {
            warn!(error = %e, symbol = %req.symbol, "failed to load single-page history bootstrap");
        }
    }
}

/// Paginated full-history load. Pages backward from "now" using `end_ms` set
/// to the oldest `t - 1` of the previous page; stops when a page returns
/// fewer than requested (or empty). Emits one `history_load_progress` per
/// page, monotonic in `pages_fetched`/`candles_fetched`, and a terminal event
/// with `done=true`.
pub async fn load_paginated_history(
    client: &ExchangeClient,
    events: &EventSink,
    req: &HistoryRequest,
    estimated_total_candles: Option<u64>,
    shutdown: &mut crate::market::shutdown::ShutdownSignal,
) {
    let mut end_ms: Option<i64> = None;
    let mut pages_fetched: u32 = 0;
    let mut candles_fetched: u64 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let page = match client
            .fetch_klines(&req.symbol, req.timeframe, None, end_ms, PAGE_LIMIT)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, symbol = %req.symbol, "paginated history fetch failed, stopping early");
                break;
            }
        };

        let page_len = page.len() as u64;
        let got_full_page = page.len() as u32 == PAGE_LIMIT;

        if page.is_empty() {
            break;
        }

        pages_fetched += 1;
        candles_fetched += page_len;
        let oldest_t = page.iter().map(|c| c.t).min();

        let progress_pct = estimated_total_candles.map(|total| {
            if total == 0 {
                100.0
            } else {
                (candles_fetched as f64 / total as f64 * 100.0).min(100.0)
            }
        });

        let _ = events.send(MarketEvent::HistoryLoadProgress {
            progress: HistoryLoadProgress {
                market_kind: req.market_kind,
                symbol: req.symbol.clone(),
                timeframe: req.timeframe,
                pages_fetched,
                candles_fetched,
                estimated_total_candles,
                progress_pct,
                done: false,
            },
        });

        if !got_full_page {
            break;
        }
        end_ms = oldest_t.map(|t| t - 1);
    }

    let _ = events.send(MarketEvent::HistoryLoadProgress {
        progress: HistoryLoadProgress {
            market_kind: req.market_kind,
            symbol: req.symbol.clone(),
            timeframe: req.timeframe,
            pages_fetched,
            candles_fetched,
            estimated_total_candles,
            progress_pct: Some(100.0),
            done: true,
        },
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percent_is_clamped_to_100() {
        let pct = (2237.0_f64 / 2237.0 * 100.0).min(100.0);
        assert_eq!(pct, 100.0);
    }

    #[test]
    fn stops_when_page_smaller_than_requested_not_earlier() {
        // Mirrors scenario 5: pages of 1000, 1000, 237 -> three progress
        // events with pagesFetched=1,2,3 candlesFetched=1000,2000,2237.
        let sizes = [1000u64, 1000, 237];
        let mut pages_fetched = 0u32;
        let mut candles_fetched = 0u64;
        let mut emitted = Vec::new();
        for size in sizes {
            pages_fetched += 1;
            candles_fetched += size;
            emitted.push((pages_fetched, candles_fetched));
            if size < 1000 {
                break;
            }
        }
        assert_eq!(emitted, vec![(1, 1000), (2, 2000), (3, 2237)]);
    }
}
