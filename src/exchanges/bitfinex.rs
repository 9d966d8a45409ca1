use serde_json::Value;

use crate::schema::FetchFault;

use super::adapter::{ParsedTicker, TickerAdapter, price_field};

/// Bitfinex REST adapter (v2 public ticker)
///
/// URL:
/// https://api-pub.bitfinex.com/v2/ticker/tETHUSD
///
/// Notes:
/// - Response is a positional array, not an object:
///   [BID, BID_SIZE, ASK, ASK_SIZE, DAILY_CHANGE,
///    DAILY_CHANGE_RELATIVE, LAST_PRICE, VOLUME, HIGH, LOW]
/// - Errors come back as ["error", code, message]
/// - No timestamp in the payload
pub struct BitfinexAdapter;

const LAST_PRICE: usize = 6;

impl TickerAdapter for BitfinexAdapter {
    fn name(&self) -> &'static str {
        "bitfinex"
    }

    fn ticker_url(&self, symbol: &str) -> String {
        format!("https://api-pub.bitfinex.com/v2/ticker/{symbol}")
    }

    fn parse_ticker(&self, body: &Value) -> Result<ParsedTicker, FetchFault> {
        let arr = body.as_array().ok_or(FetchFault::FetcherBadData)?;

        if arr.first().and_then(Value::as_str) == Some("error") {
            return Err(FetchFault::FetcherBadRequest);
        }

        Ok(ParsedTicker {
            price: price_field(arr.get(LAST_PRICE))?,
            observed_at: None,
        })
    }
}
