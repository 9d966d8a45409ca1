use serde_json::Value;

use crate::schema::FetchFault;

use super::adapter::{ParsedTicker, TickerAdapter, epoch_field, price_field};

/// Bitstamp REST adapter (v2 ticker)
///
/// URL:
/// https://www.bitstamp.net/api/v2/ticker/ethusd/
///
/// Notes:
/// - No auth
/// - `last` and `timestamp` are strings (seconds)
pub struct BitstampAdapter;

impl TickerAdapter for BitstampAdapter {
    fn name(&self) -> &'static str {
        "bitstamp"
    }

    fn ticker_url(&self, symbol: &str) -> String {
        format!("https://www.bitstamp.net/api/v2/ticker/{symbol}/")
    }

    fn parse_ticker(&self, body: &Value) -> Result<ParsedTicker, FetchFault> {
        Ok(ParsedTicker {
            price: price_field(body.get("last"))?,
            observed_at: epoch_field(body.get("timestamp")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_last_and_timestamp() {
        let body = json!({ "last": "2451.3", "timestamp": "1700000000", "volume": "1.0" });
        let t = BitstampAdapter.parse_ticker(&body).unwrap();
        assert_eq!(t.price, 2451.3);
        assert_eq!(t.observed_at, Some(1_700_000_000_000));
    }
}
