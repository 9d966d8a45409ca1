use serde_json::Value;

use crate::schema::FetchFault;

use super::adapter::{ParsedTicker, TickerAdapter, price_field};

/// Binance REST adapter (spot ticker price)
///
/// URL:
/// https://api.binance.com/api/v3/ticker/price?symbol=ETHUSDT
///
/// Notes:
/// - Symbol is uppercase without separator
/// - Errors are `{ "code": -1121, "msg": "Invalid symbol." }` with HTTP 400
/// - No timestamp in the payload
pub struct BinanceAdapter;

impl TickerAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn ticker_url(&self, symbol: &str) -> String {
        format!("https://api.binance.com/api/v3/ticker/price?symbol={symbol}")
    }

    fn parse_ticker(&self, body: &Value) -> Result<ParsedTicker, FetchFault> {
        if body.get("code").is_some() && body.get("msg").is_some() {
            return Err(FetchFault::FetcherBadRequest);
        }

        Ok(ParsedTicker {
            price: price_field(body.get("price"))?,
            observed_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_price() {
        let body = json!({ "symbol": "ETHUSDT", "price": "2450.01000000" });
        assert_eq!(BinanceAdapter.parse_ticker(&body).unwrap().price, 2450.01);
    }

    #[test]
    fn error_body_is_bad_request() {
        let body = json!({ "code": -1121, "msg": "Invalid symbol." });
        assert_eq!(BinanceAdapter.parse_ticker(&body), Err(FetchFault::FetcherBadRequest));
    }
}
