//! Exchange adapter registry and feed collaborator
//!
//! This module provides:
//! - Central registration of all supported REST ticker adapters
//! - A factory function to resolve adapters by name
//! - The `Fetcher`, which turns configured exchanges into readings
//!
//! All exchange-specific logic must live in dedicated adapter modules.
//! The rest of the application must interact exclusively through
//! the `FeedSource` trait.

pub mod adapter;
pub mod fetcher;
mod binance;
mod bitfinex;
mod bitstamp;
mod coinbase;
mod gemini;
mod kraken;

use std::sync::Arc;
use adapter::TickerAdapter;

pub use fetcher::{ExchangeOpError, FeedSource, Fetcher};

/// Returns a ticker adapter instance by name.
///
/// CONTRACT:
/// - `name` MUST match the `exchange.name` field in config.json
/// - Adapter names are lowercase and stable
///
/// RETURNS:
/// - `None` if the exchange is unknown; the fetcher keeps such an
///   entry disabled with `FETCHER_BAD_CONFIG`
///
pub fn get_adapter(name: &str) -> Option<Arc<dyn TickerAdapter>> {
    match name {
        "bitfinex" => Some(Arc::new(bitfinex::BitfinexAdapter)),
        "bitstamp" => Some(Arc::new(bitstamp::BitstampAdapter)),
        "coinbase" => Some(Arc::new(coinbase::CoinbaseAdapter)),
        "gemini"   => Some(Arc::new(gemini::GeminiAdapter)),
        "kraken"   => Some(Arc::new(kraken::KrakenAdapter)),
        "binance"  => Some(Arc::new(binance::BinanceAdapter)),
        _ => None,
    }
}
