use serde_json::Value;

use crate::schema::FetchFault;

/// Price extracted from one ticker response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedTicker {
    pub price: f64,

    /// Exchange-reported time (ms), if the payload carries one
    pub observed_at: Option<i64>,
}

/// TickerAdapter is the abstraction layer between:
/// - The generic `Fetcher` runtime
/// - Exchange-specific REST ticker endpoints
///
/// Each exchange implementation must:
/// - Build the ticker URL for one symbol
/// - Extract the last traded price from the decoded JSON body
///
/// DESIGN GOALS:
/// - Zero exchange-specific logic outside adapters
/// - One adapter per exchange
/// - Adapters never perform I/O; the fetcher owns the HTTP client
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - Adapter instances are shared across concurrent fetches
///
pub trait TickerAdapter: Send + Sync {

    /// Returns the canonical exchange name.
    ///
    /// CONTRACT:
    /// - Must match `exchange.name` in configuration
    /// - Used for symbol conversion and as `TickerReading::source`
    ///
    fn name(&self) -> &'static str;

    /// Full REST URL of the ticker for `symbol`.
    ///
    /// `symbol` is already in exchange format (see `util::symbol_to_exchange`).
    fn ticker_url(&self, symbol: &str) -> String;

    /// Extracts the price from a decoded response body.
    ///
    /// IMPORTANT:
    /// - Must NEVER panic
    /// - Missing fields map to `FetcherNoField`
    /// - Present but unusable values map to `FetcherBadData`
    ///
    fn parse_ticker(&self, body: &Value) -> Result<ParsedTicker, FetchFault>;
}

/// Reads a price that may be encoded as a JSON number or a numeric string.
pub fn price_field(v: Option<&Value>) -> Result<f64, FetchFault> {
    let n = match v {
        None | Some(Value::Null) => return Err(FetchFault::FetcherNoField),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    match n {
        Some(n) if n.is_finite() && n > 0.0 => Ok(n),
        _ => Err(FetchFault::FetcherBadData),
    }
}

/// Reads an epoch timestamp (number or numeric string) as milliseconds.
///
/// Values below 10^12 are taken as seconds.
pub fn epoch_field(v: Option<&Value>) -> Option<i64> {
    let raw = match v? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };

    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    if raw < 1e12 {
        Some((raw * 1000.0) as i64)
    } else {
        Some(raw as i64)
    }
}

/// Reads an RFC 3339 timestamp as milliseconds.
pub fn rfc3339_field(v: Option<&Value>) -> Option<i64> {
    let s = v?.as_str()?;
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.timestamp_millis())
}
