use serde_json::Value;

use crate::schema::FetchFault;

use super::adapter::{ParsedTicker, TickerAdapter, price_field, rfc3339_field};

/// Coinbase Exchange REST adapter (product ticker)
///
/// URL:
/// https://api.exchange.coinbase.com/products/ETH-USD/ticker
///
/// Notes:
/// - Requires a User-Agent header (set on the shared client)
/// - `time` is RFC 3339
/// - Unknown products answer 404 with `{ "message": "NotFound" }`
pub struct CoinbaseAdapter;

impl TickerAdapter for CoinbaseAdapter {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    fn ticker_url(&self, symbol: &str) -> String {
        format!("https://api.exchange.coinbase.com/products/{symbol}/ticker")
    }

    fn parse_ticker(&self, body: &Value) -> Result<ParsedTicker, FetchFault> {
        Ok(ParsedTicker {
            price: price_field(body.get("price"))?,
            observed_at: rfc3339_field(body.get("time")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_price_and_time() {
        let body = json!({ "price": "2449.99", "time": "2024-01-01T00:00:00.000Z" });
        let t = CoinbaseAdapter.parse_ticker(&body).unwrap();
        assert_eq!(t.price, 2449.99);
        assert_eq!(t.observed_at, Some(1_704_067_200_000));
    }
}
