use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::ExchangeConfig;
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::schema::{ExchangeInfo, FetchFault, TickerReading};
use crate::util::{now_ms, symbol_to_exchange};

use super::adapter::{ParsedTicker, TickerAdapter};
use super::get_adapter;

/// Rejections of the exchange on/off operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeOpError {
    #[error("unknown exchange id")]
    BadExchangeId,

    #[error("unsupported operation")]
    BadOperation,
}

impl ExchangeOpError {
    pub fn code(&self) -> &'static str {
        match self {
            ExchangeOpError::BadExchangeId => "BAD_EXCHANGE_ID",
            ExchangeOpError::BadOperation => "BAD_OPERATION",
        }
    }
}

/// Feed collaborator consumed by the collector controller.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// One reading per configured exchange, faulted where no value
    /// could be produced.
    async fn fetch_all(&self) -> Vec<TickerReading>;

    async fn exchanges(&self) -> Vec<ExchangeInfo>;

    /// `mode` is `"on"` or `"off"`.
    async fn exchange_on_off(&self, id: usize, mode: &str) -> Result<(), ExchangeOpError>;
}

struct FeedExchange {
    id: usize,
    name: String,

    /// As configured
    symbol: String,

    /// Converted for the adapter
    native_symbol: String,

    adapter: Option<Arc<dyn TickerAdapter>>,
    enabled: bool,
    fault: Option<FetchFault>,
}

// ------------------------------------------------------------
// Fetcher
// ------------------------------------------------------------
//
// Thin HTTP adapter producing normalized readings.
//
// DESIGN:
// - Exchange id = position in configuration
// - All enabled exchanges are fetched concurrently
// - The exchange list lock is never held across a request
//
pub struct Fetcher {
    http: reqwest::Client,
    exchanges: RwLock<Vec<FeedExchange>>,
}

impl Fetcher {
    pub fn new(configs: &[ExchangeConfig], request_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("price-oracle-network/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let exchanges = configs
            .iter()
            .enumerate()
            .map(|(id, cfg)| {
                let adapter = get_adapter(&cfg.name);
                if adapter.is_none() {
                    log::warn!("Exchange '{}' is not supported, loaded disabled", cfg.name);
                }

                FeedExchange {
                    id,
                    name: cfg.name.clone(),
                    symbol: cfg.symbol.clone(),
                    native_symbol: symbol_to_exchange(&cfg.name, &cfg.symbol),
                    enabled: adapter.is_some() && cfg.enabled,
                    fault: adapter.is_none().then_some(FetchFault::FetcherBadConfig),
                    adapter,
                }
            })
            .collect();

        Ok(Self {
            http,
            exchanges: RwLock::new(exchanges),
        })
    }

    async fn fetch_one(&self, adapter: &dyn TickerAdapter, native_symbol: &str) -> Result<ParsedTicker, FetchFault> {
        let url = adapter.ticker_url(native_symbol);
        log::debug!("fetch {} {}", adapter.name(), url);

        let resp = self.http.get(&url).send().await.map_err(|e| request_fault(&e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_fault(status.as_u16()));
        }

        let body: Value = resp.json().await.map_err(|e| {
            if e.is_timeout() { FetchFault::FetcherTimeout } else { FetchFault::FetcherParseError }
        })?;

        adapter.parse_ticker(&body)
    }
}

/// Maps a non-success HTTP status to a fault code.
pub fn status_fault(status: u16) -> FetchFault {
    match status {
        400 => FetchFault::FetcherBadRequest,
        403 => FetchFault::FetcherForbidden,
        404 => FetchFault::FetcherNotFound,
        500 => FetchFault::FetcherInternalServerError,
        503 => FetchFault::FetcherServiceTemporarilyUnavailable,
        _ => FetchFault::FetcherError,
    }
}

fn request_fault(e: &reqwest::Error) -> FetchFault {
    if e.is_timeout() {
        FetchFault::FetcherTimeout
    } else if e.is_connect() {
        FetchFault::FetcherConnectionRefused
    } else if e.is_decode() {
        FetchFault::FetcherParseError
    } else {
        FetchFault::FetcherError
    }
}

#[async_trait]
impl FeedSource for Fetcher {
    async fn fetch_all(&self) -> Vec<TickerReading> {
        let snapshot: Vec<_> = self
            .exchanges
            .read()
            .await
            .iter()
            .map(|e| (e.id, e.name.clone(), e.symbol.clone(), e.native_symbol.clone(), e.adapter.clone(), e.enabled, e.fault))
            .collect();

        let results = join_all(snapshot.into_iter().map(|(id, name, symbol, native, adapter, enabled, fault)| async move {
            let started = now_ms();
            let outcome = match (&adapter, enabled) {
                (Some(adapter), true) => self.fetch_one(adapter.as_ref(), &native).await,
                _ => Err(fault.unwrap_or(FetchFault::FetcherDisabled)),
            };
            let updated_at = now_ms();

            let reading = match outcome {
                Ok(t) => TickerReading {
                    source: name,
                    symbol,
                    value: t.price,
                    observed_at: t.observed_at.unwrap_or(started),
                    updated_at,
                    fault: None,
                },
                Err(fault) => TickerReading {
                    source: name,
                    symbol,
                    value: 0.0,
                    observed_at: started,
                    updated_at,
                    fault: Some(fault),
                },
            };
            (id, enabled, reading)
        }))
        .await;

        // Remember the last fault of every fetched exchange for state export.
        {
            let mut exchanges = self.exchanges.write().await;
            for (id, enabled, reading) in &results {
                if !enabled {
                    continue;
                }
                if let Some(e) = exchanges.get_mut(*id) {
                    e.fault = reading.fault;
                }
            }
        }

        let readings: Vec<_> = results.into_iter().map(|(_, _, r)| r).collect();

        for r in &readings {
            RuntimeMetrics::inc(&METRICS.readings_fetched);
            if let Some(fault) = r.fault {
                if fault != FetchFault::FetcherDisabled {
                    log::debug!("{} {}: {:?}", r.source, r.symbol, fault);
                }
                RuntimeMetrics::inc(&METRICS.readings_faulted);
            }
        }

        readings
    }

    async fn exchanges(&self) -> Vec<ExchangeInfo> {
        self.exchanges
            .read()
            .await
            .iter()
            .map(|e| ExchangeInfo {
                id: e.id,
                name: e.name.clone(),
                symbol: e.symbol.clone(),
                enabled: e.enabled,
                fault: e.fault,
            })
            .collect()
    }

    async fn exchange_on_off(&self, id: usize, mode: &str) -> Result<(), ExchangeOpError> {
        let mut exchanges = self.exchanges.write().await;
        let exchange = exchanges.get_mut(id).ok_or(ExchangeOpError::BadExchangeId)?;

        match mode {
            "on" if exchange.adapter.is_some() => {
                exchange.enabled = true;
                exchange.fault = None;
            }
            "off" => exchange.enabled = false,
            _ => return Err(ExchangeOpError::BadOperation),
        }

        log::info!("exchange {} ({}) turned {}", exchange.id, exchange.name, mode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str, enabled: bool) -> ExchangeConfig {
        crate::util::install_crypto_provider();

        ExchangeConfig {
            name: name.to_string(),
            symbol: "ETH/USD".to_string(),
            enabled,
        }
    }

    #[test]
    fn maps_status_codes() {
        assert_eq!(status_fault(400), FetchFault::FetcherBadRequest);
        assert_eq!(status_fault(403), FetchFault::FetcherForbidden);
        assert_eq!(status_fault(404), FetchFault::FetcherNotFound);
        assert_eq!(status_fault(500), FetchFault::FetcherInternalServerError);
        assert_eq!(status_fault(503), FetchFault::FetcherServiceTemporarilyUnavailable);
        assert_eq!(status_fault(418), FetchFault::FetcherError);
    }

    #[tokio::test]
    async fn unknown_adapter_is_loaded_disabled() {
        let f = Fetcher::new(&[cfg("wex", true), cfg("kraken", false)], Duration::from_secs(1)).unwrap();
        let list = f.exchanges().await;

        assert_eq!(list[0].fault, Some(FetchFault::FetcherBadConfig));
        assert!(!list[0].enabled);
        assert_eq!(list[1].id, 1);
        assert!(!list[1].enabled);
    }

    #[tokio::test]
    async fn disabled_exchanges_yield_faulted_readings_without_io() {
        let f = Fetcher::new(&[cfg("wex", true), cfg("kraken", false)], Duration::from_secs(1)).unwrap();
        let readings = f.fetch_all().await;

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].fault, Some(FetchFault::FetcherBadConfig));
        assert_eq!(readings[1].fault, Some(FetchFault::FetcherDisabled));
        assert!(readings.iter().all(|r| r.value == 0.0));
    }

    #[tokio::test]
    async fn exchange_on_off_validates_input() {
        let f = Fetcher::new(&[cfg("wex", true), cfg("kraken", false)], Duration::from_secs(1)).unwrap();

        assert_eq!(f.exchange_on_off(5, "on").await, Err(ExchangeOpError::BadExchangeId));
        assert_eq!(f.exchange_on_off(1, "toggle").await, Err(ExchangeOpError::BadOperation));
        assert_eq!(f.exchange_on_off(0, "on").await, Err(ExchangeOpError::BadOperation));

        f.exchange_on_off(1, "on").await.unwrap();
        assert!(f.exchanges().await[1].enabled);
        assert_eq!(ExchangeOpError::BadExchangeId.code(), "BAD_EXCHANGE_ID");
    }
}
