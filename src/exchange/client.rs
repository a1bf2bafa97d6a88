// =============================================================================
// ExchangeClient — encapsulates endpoint topology and payload-shape variance
// between Spot and FuturesUsdm. Shared, read-only after construction.
// =============================================================================

use anyhow::{anyhow, bail, Context, Result};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::market::types::Candle;
use crate::types::{MarketKind, Timeframe};

use super::backoff::{is_retriable_status, with_retry, AttemptOutcome};

const REST_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_TIME_TIMEOUT: Duration = Duration::from_secs(5);

/// REST base URL and WS host for a given market kind.
fn rest_base(kind: MarketKind) -> &'static str {
    match kind {
        MarketKind::Spot => "https://api.binance.com/api/v3",
        MarketKind::FuturesUsdm => "https://fapi.binance.com/fapi/v1",
    }
}

fn ws_host(kind: MarketKind) -> &'static str {
    match kind {
        MarketKind::Spot => "wss://stream.binance.com:9443/ws",
        MarketKind::FuturesUsdm => "wss://fstream.binance.com/ws",
    }
}

/// Thin REST + WebSocket-URL client, parameterized by [`MarketKind`] at
/// construction time rather than by runtime inheritance.
pub struct ExchangeClient {
    market_kind: MarketKind,
    http: Client,
}

impl ExchangeClient {
    pub fn new(market_kind: MarketKind) -> Result<Self> {
        let http = Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .context("building reqwest client")?;
        Ok(Self { market_kind, http })
    }

    pub fn market_kind(&self) -> MarketKind {
        self.market_kind
    }

    pub fn websocket_agg_trade_url(&self, symbol: &str) -> String {
        format!("{}/{}@aggTrade", ws_host(self.market_kind), symbol.to_lowercase())
    }

    pub async fn fetch_server_time(&self) -> Result<i64> {
        let url = format!("{}/time", rest_base(self.market_kind));
        let body = with_retry("fetch_server_time", || async {
            self.get_json(&url, SERVER_TIME_TIMEOUT).await
        })
        .await?;
        body.get("serverTime")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("server time response missing serverTime"))
    }

    pub async fn fetch_last_agg_id(&self, symbol: &str) -> Result<u64> {
        let url = format!(
            "{}/aggTrades?symbol={}&limit=1",
            rest_base(self.market_kind),
            symbol.to_uppercase()
        );
        let body = with_retry("fetch_last_agg_id", || async {
            self.get_json(&url, REST_TIMEOUT).await
        })
        .await?;
        let arr = body
            .as_array()
            .ok_or_else(|| anyhow!("aggTrades response was not an array"))?;
        let last = arr
            .last()
            .ok_or_else(|| anyhow!("aggTrades response was empty"))?;
        let id = last
            .get("a")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("aggTrades entry missing `a`"))?;
        Ok(id)
    }

    pub async fn fetch_symbols(&self) -> Result<Vec<String>> {
        let url = format!("{}/exchangeInfo", rest_base(self.market_kind));
        let body = with_retry("fetch_symbols", || async {
            self.get_json(&url, REST_TIMEOUT).await
        })
        .await?;
        let symbols = body
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("exchangeInfo response missing symbols array"))?;
        let mut names: Vec<String> = symbols
            .iter()
            .filter_map(|s| s.get("symbol").and_then(Value::as_str).map(str::to_string))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// `[openTime, open, high, low, close, volume, closeTime, ...]`, numerics
    /// as quoted decimal strings. Futures adds trailing fields, ignored.
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let mut url = format!(
            "{}/klines?symbol={}&interval={}&limit={}",
            rest_base(self.market_kind),
            symbol.to_uppercase(),
            timeframe.as_exchange_str(),
            limit
        );
        if let Some(s) = start_ms {
            url.push_str(&format!("&startTime={s}"));
        }
        if let Some(e) = end_ms {
            url.push_str(&format!("&endTime={e}"));
        }

        let body = with_retry("fetch_klines", || async { self.get_json(&url, REST_TIMEOUT).await }).await?;
        let rows = body
            .as_array()
            .ok_or_else(|| anyhow!("klines response was not an array"))?;

        rows.iter().map(parse_kline_row).collect()
    }

    /// Issue a GET, classifying the outcome for the retry driver: success,
    /// retriable (network error or 5xx/429), or fail-fast (4xx).
    async fn get_json(&self, url: &str, timeout: Duration) -> AttemptOutcome<Value> {
        let resp = match self.http.get(url).timeout(timeout).send().await {
            Ok(r) => r,
            Err(e) => return AttemptOutcome::Retry(anyhow!(e).context("request failed")),
        };

        let status = resp.status();
        if status.is_success() {
            return match resp.json::<Value>().await {
                Ok(v) => AttemptOutcome::Success(v),
                Err(e) => AttemptOutcome::Retry(anyhow!(e).context("decoding JSON body")),
            };
        }

        let code = status.as_u16();
        debug!(url, status = code, "non-success REST response");
        if is_retriable_status(code) {
            AttemptOutcome::Retry(anyhow!("HTTP {code} from {url}"))
        } else {
            AttemptOutcome::FailFast(anyhow!("HTTP {code} from {url}"))
        }
    }
}

fn parse_f64(v: &Value) -> Result<f64> {
    match v {
        Value::String(s) => s.parse::<f64>().map_err(|e| anyhow!(e)),
        Value::Number(n) => n.as_f64().ok_or_else(|| anyhow!("non-finite kline number")),
        other => bail!("unexpected kline scalar shape: {other:?}"),
    }
}

fn parse_i64(v: &Value) -> Result<i64> {
    match v {
        Value::String(s) => s.parse::<i64>().map_err(|e| anyhow!(e)),
        Value::Number(n) => n.as_i64().ok_or_else(|| anyhow!("non-integral kline timestamp")),
        other => bail!("unexpected kline scalar shape: {other:?}"),
    }
}

fn parse_kline_row(row: &Value) -> Result<Candle> {
    let arr = row.as_array().ok_or_else(|| anyhow!("kline row was not an array"))?;
    if arr.len() < 6 {
        bail!("kline row had fewer than 6 fields: {arr:?}");
    }
    Ok(Candle {
        t: parse_i64(&arr[0]).context("openTime")?,
        o: parse_f64(&arr[1]).context("open")?,
        h: parse_f64(&arr[2]).context("high")?,
        l: parse_f64(&arr[3]).context("low")?,
        c: parse_f64(&arr[4]).context("close")?,
        v: parse_f64(&arr[5]).context("volume")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn websocket_url_differs_by_market_kind() {
        let spot = ExchangeClient::new(MarketKind::Spot).unwrap();
        assert_eq!(spot.websocket_agg_trade_url("BTCUSDT"), "wss://stream.binance.com:9443/ws/btcusdt@aggTrade");

        let fut = ExchangeClient::new(MarketKind::FuturesUsdm).unwrap();
        assert_eq!(fut.websocket_agg_trade_url("BTCUSDT"), "wss://fstream.binance.com/ws/btcusdt@aggTrade");
    }

    #[test]
    fn parse_kline_row_handles_quoted_strings_and_trailing_futures_fields() {
        let row = json!(["1609459200000", "100.0", "101.5", "99.5", "100.5", "12.3", "1609459259999", "extra", 0, "0", "0", "0"]);
        let candle = parse_kline_row(&row).unwrap();
        assert_eq!(candle.t, 1_609_459_200_000);
        assert_eq!(candle.o, 100.0);
        assert_eq!(candle.h, 101.5);
        assert_eq!(candle.l, 99.5);
        assert_eq!(candle.c, 100.5);
        assert_eq!(candle.v, 12.3);
    }

    #[test]
    fn parse_kline_row_rejects_short_rows() {
        let row = json!(["1609459200000", "100.0"]);
        assert!(parse_kline_row(&row).is_err());
    }
}
