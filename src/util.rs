/// Utility helpers shared by both node roles.
///
/// This module contains:
/// - Time helpers
/// - Symbol conversion for the REST ticker adapters
/// - Random token generation
///
/// IMPORTANT:
/// - No exchange-specific business logic should live here.
/// - This module must remain lightweight and deterministic
///   (except for `random_token`, which is the one source of entropy).
///

use chrono::Utc;

/// Returns the current Unix timestamp in milliseconds.
///
/// Used for:
/// - Reading timestamps
/// - Session heartbeat bookkeeping
/// - Notification and history timestamps
///
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert an internal symbol into the exchange-specific REST format.
///
/// Input:
/// - exchange: exchange identifier (e.g. "kraken", "coinbase")
/// - symbol: internal format "BASE/QUOTE"
///
/// Examples:
/// - ("bitfinex", "ETH/USD")  -> "tETHUSD"
/// - ("bitstamp", "ETH/USD")  -> "ethusd"
/// - ("coinbase", "ETH/USD")  -> "ETH-USD"
/// - ("kraken", "ETH/USD")    -> "ETHUSD"
///
/// Symbols without a separator are passed through untouched so
/// configurations may already carry the exchange-native form.
///
pub fn symbol_to_exchange(exchange: &str, symbol: &str) -> String {
    if !symbol.contains('/') {
        return symbol.to_string();
    }

    match exchange {
        "bitfinex" => format!("t{}", symbol.replace('/', "").to_uppercase()),
        "bitstamp" | "gemini" => symbol.replace('/', "").to_lowercase(),
        "coinbase" => symbol.replace('/', "-").to_uppercase(),
        "kraken" | "binance" => symbol.replace('/', "").to_uppercase(),
        _ => symbol.to_string(),
    }
}

/// Installs the `ring` rustls CryptoProvider for this process.
///
/// rustls >= 0.23 requires an explicit provider before any TLS client
/// (reqwest, tokio-tungstenite) is built. Safe to call more than once;
/// returns `false` when a provider was already installed.
pub fn install_crypto_provider() -> bool {
    rustls::crypto::ring::default_provider().install_default().is_ok()
}

/// Returns `N` bytes from the thread-local CSPRNG, hex encoded.
///
/// The output length is always `2 * N` characters.
pub fn random_token<const N: usize>() -> String {
    let raw: [u8; N] = rand::random();
    hex::encode(raw)
}

/// Exits the process after `delay`, in the background.
///
/// Only the explicit shutdown path calls this.
pub fn terminate_after(delay: std::time::Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        log::warn!("Shutting down");
        std::process::exit(0);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_symbols_per_exchange() {
        assert_eq!(symbol_to_exchange("bitfinex", "ETH/USD"), "tETHUSD");
        assert_eq!(symbol_to_exchange("bitstamp", "ETH/USD"), "ethusd");
        assert_eq!(symbol_to_exchange("coinbase", "eth/usd"), "ETH-USD");
        assert_eq!(symbol_to_exchange("kraken", "ETH/USD"), "ETHUSD");
        assert_eq!(symbol_to_exchange("unknown", "ETH/USD"), "ETH/USD");
    }

    #[test]
    fn native_symbols_pass_through() {
        assert_eq!(symbol_to_exchange("kraken", "XETHZUSD"), "XETHZUSD");
    }

    #[test]
    fn random_tokens_have_fixed_length_and_differ() {
        let a = random_token::<32>();
        let b = random_token::<32>();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}
