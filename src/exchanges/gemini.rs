use serde_json::Value;

use crate::schema::FetchFault;

use super::adapter::{ParsedTicker, TickerAdapter, epoch_field, price_field};

/// Gemini REST adapter (v1 pubticker)
///
/// URL:
/// https://api.gemini.com/v1/pubticker/ethusd
///
/// Notes:
/// - Timestamp lives under `volume.timestamp` (ms)
/// - Errors are `{ "result": "error", "reason": ... }` with HTTP 400
pub struct GeminiAdapter;

impl TickerAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn ticker_url(&self, symbol: &str) -> String {
        format!("https://api.gemini.com/v1/pubticker/{symbol}")
    }

    fn parse_ticker(&self, body: &Value) -> Result<ParsedTicker, FetchFault> {
        if body.get("result").and_then(Value::as_str) == Some("error") {
            return Err(FetchFault::FetcherBadRequest);
        }

        Ok(ParsedTicker {
            price: price_field(body.get("last"))?,
            observed_at: epoch_field(body.pointer("/volume/timestamp")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_last_and_nested_timestamp() {
        let body = json!({ "last": "2450.00", "volume": { "ETH": "1", "timestamp": 1_700_000_000_500i64 } });
        let t = GeminiAdapter.parse_ticker(&body).unwrap();
        assert_eq!(t.price, 2450.0);
        assert_eq!(t.observed_at, Some(1_700_000_000_500));
    }
}
