use serde_json::Value;

use crate::schema::FetchFault;

use super::adapter::{ParsedTicker, TickerAdapter, price_field};

/// Kraken REST adapter (public Ticker)
///
/// URL:
/// https://api.kraken.com/0/public/Ticker?pair=ETHUSD
///
/// Notes:
/// - The result is keyed by Kraken's internal pair name (`XETHZUSD`),
///   which differs from the requested one; the first entry is used
/// - Last trade is `c[0]` (string)
/// - Errors come back with HTTP 200 and a non-empty `error` array
pub struct KrakenAdapter;

impl TickerAdapter for KrakenAdapter {
    fn name(&self) -> &'static str {
        "kraken"
    }

    fn ticker_url(&self, symbol: &str) -> String {
        format!("https://api.kraken.com/0/public/Ticker?pair={symbol}")
    }

    fn parse_ticker(&self, body: &Value) -> Result<ParsedTicker, FetchFault> {
        let has_errors = body
            .get("error")
            .and_then(Value::as_array)
            .is_some_and(|e| !e.is_empty());
        if has_errors {
            return Err(FetchFault::FetcherBadRequest);
        }

        let pair = body
            .get("result")
            .and_then(Value::as_object)
            .and_then(|r| r.values().next())
            .ok_or(FetchFault::FetcherNoField)?;

        Ok(ParsedTicker {
            price: price_field(pair.pointer("/c/0"))?,
            observed_at: None,
        })
    }
}
