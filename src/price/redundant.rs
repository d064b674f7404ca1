//! Redundant price oracle over a set of provider adapters.
//!
//! Providers carry an `operational` mark: `Some(true)` once they answered,
//! `Some(false)` once they failed, `None` before the first probe. The first
//! operational provider is queried directly; everything else goes through a
//! first-to-succeed race. When every provider is marked failed the set is
//! reset so they are all probed again.

use crate::error::{Error, Result};
use crate::price::providers::{CoinBinding, PriceProvider, Ticker};
use crate::types::{FeeData, PricingInfo};
use crate::utils::retry_with_backoff;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Micro-sats in one bitcoin: 10^8 sats * 10^6.
const USAT_PER_BTC: u128 = 100_000_000_000_000;
const PPM: u128 = 1_000_000;

#[derive(Debug, Clone)]
pub struct RedundantSwapPriceConfig {
    /// Maximum tolerated relative difference between the market value and
    /// the quoted value, in parts per million.
    pub max_allowed_fee_diff_ppm: u64,
    /// How long a fetched price stays fresh.
    pub cache_ttl: Duration,
}

impl Default for RedundantSwapPriceConfig {
    fn default() -> Self {
        Self {
            max_allowed_fee_diff_ppm: 10_000,
            cache_ttl: Duration::from_secs(10),
        }
    }
}

struct ProviderEntry {
    provider: Arc<dyn PriceProvider>,
    operational: Mutex<Option<bool>>,
}

type CoinKey = (String, String);

/// The redundant multi-source price oracle.
pub struct RedundantSwapPrice {
    entries: Vec<ProviderEntry>,
    coins: HashMap<CoinKey, CoinBinding>,
    config: RedundantSwapPriceConfig,
    price_cache: Mutex<HashMap<CoinKey, (u128, Instant)>>,
    usd_cache: Mutex<Option<(Decimal, Instant)>>,
}

impl RedundantSwapPrice {
    pub fn new(
        providers: Vec<Arc<dyn PriceProvider>>,
        coins: Vec<CoinBinding>,
        config: RedundantSwapPriceConfig,
    ) -> Self {
        Self {
            entries: providers
                .into_iter()
                .map(|provider| ProviderEntry {
                    provider,
                    operational: Mutex::new(None),
                })
                .collect(),
            coins: coins
                .into_iter()
                .map(|c| ((c.chain_id.clone(), c.token.clone()), c))
                .collect(),
            config,
            price_cache: Mutex::new(HashMap::new()),
            usd_cache: Mutex::new(None),
        }
    }

    pub fn max_allowed_fee_diff_ppm(&self) -> u64 {
        self.config.max_allowed_fee_diff_ppm
    }

    fn binding(&self, chain_id: &str, token: &str) -> Result<&CoinBinding> {
        self.coins
            .get(&(chain_id.to_string(), token.to_string()))
            .ok_or_else(|| {
                Error::Parse(format!("Unknown token {} on chain {}", token, chain_id))
            })
    }

    fn mark(&self, index: usize, operational: Option<bool>) {
        if let Ok(mut guard) = self.entries[index].operational.lock() {
            *guard = operational;
        }
    }

    fn operational_index(&self) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.operational
                .lock()
                .map(|guard| *guard == Some(true))
                .unwrap_or(false)
        })
    }

    /// Indexes of providers eligible for the fallback race (`true` or not
    /// yet probed). Resets the whole set when everything is marked failed.
    fn fallback_indexes(&self) -> Vec<usize> {
        let candidates: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.operational
                    .lock()
                    .map(|guard| *guard != Some(false))
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect();
        if !candidates.is_empty() {
            return candidates;
        }
        for i in 0..self.entries.len() {
            self.mark(i, None);
        }
        (0..self.entries.len()).collect()
    }

    /// Convert a BTC-per-whole-token price into micro-sats per base unit.
    fn to_usat_per_unit(price_btc: Decimal, decimals: u8) -> Result<u128> {
        let usat = price_btc * Decimal::from(USAT_PER_BTC as u64);
        let per_unit = usat / Decimal::from(10u64.pow(decimals as u32));
        per_unit
            .round()
            .to_u128()
            .filter(|v| *v > 0)
            .ok_or_else(|| Error::Parse(format!("Unusable price {}", price_btc)))
    }

    async fn fetch_from(&self, index: usize, ticker: &Ticker, usd: bool) -> Result<Decimal> {
        let provider = &self.entries[index].provider;
        if usd {
            provider.fetch_usd_price().await
        } else {
            provider.fetch_price(ticker).await
        }
    }

    /// One pass of the §oracle scheduling: operational-first, then the race.
    async fn fetch_once(&self, ticker_of: impl Fn(&str) -> Option<Ticker>, usd: bool) -> Result<Decimal> {
        if let Some(index) = self.operational_index() {
            let name = self.entries[index].provider.name();
            if let Some(ticker) = ticker_of(name) {
                match self.fetch_from(index, &ticker, usd).await {
                    Ok(price) => return Ok(price),
                    Err(e) => {
                        log::warn!("operational price provider {} failed: {}", name, e);
                        self.mark(index, Some(false));
                    }
                }
            } else {
                self.mark(index, Some(false));
            }
        }

        let candidates = self.fallback_indexes();
        let mut race: FuturesUnordered<_> = candidates
            .into_iter()
            .filter_map(|index| {
                let name = self.entries[index].provider.name();
                let ticker = ticker_of(name)?;
                Some(async move { (index, self.fetch_from(index, &ticker, usd).await) })
            })
            .collect();

        let mut last_error = Error::Request("No price provider available".into());
        while let Some((index, result)) = race.next().await {
            match result {
                Ok(price) => {
                    self.mark(index, Some(true));
                    return Ok(price);
                }
                Err(e) => {
                    log::warn!(
                        "price provider {} failed: {}",
                        self.entries[index].provider.name(),
                        e
                    );
                    self.mark(index, Some(false));
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Price of the token in micro-sats per base unit, cached.
    pub async fn get_price(&self, chain_id: &str, token: &str) -> Result<u128> {
        let key = (chain_id.to_string(), token.to_string());
        if let Some((price, at)) = self.price_cache.lock().ok().and_then(|c| c.get(&key).copied())
        {
            if at.elapsed() < self.config.cache_ttl {
                return Ok(price);
            }
        }

        let binding = self.binding(chain_id, token)?;
        let price_btc = retry_with_backoff(
            || self.fetch_once(|name| binding.tickers.get(name).cloned(), false),
            |e| matches!(e, Error::Request(_)),
        )
        .await?;
        let price = Self::to_usat_per_unit(price_btc, binding.decimals)?;

        if let Ok(mut cache) = self.price_cache.lock() {
            cache.insert(key, (price, Instant::now()));
        }
        Ok(price)
    }

    /// USD per bitcoin, cached.
    pub async fn get_usd_price(&self) -> Result<Decimal> {
        if let Some((price, at)) = self.usd_cache.lock().ok().and_then(|c| *c) {
            if at.elapsed() < self.config.cache_ttl {
                return Ok(price);
            }
        }

        let price = retry_with_backoff(
            || self.fetch_once(|_| Some(Ticker::new("")), true),
            |e| matches!(e, Error::Request(_)),
        )
        .await?;

        if let Ok(mut cache) = self.usd_cache.lock() {
            *cache = Some((price, Instant::now()));
        }
        Ok(price)
    }

    /// Validate a quote in the send direction: the user pays `sats` and the
    /// LP quoted `token_amount` base units out.
    #[allow(clippy::too_many_arguments)]
    pub async fn is_valid_amount_send(
        &self,
        chain_id: &str,
        sats: u64,
        fee: FeeData,
        token_amount: u128,
        token: &str,
        prefetched_price: Option<u128>,
        prefetched_usd: Option<Decimal>,
    ) -> Result<PricingInfo> {
        let price = match prefetched_price {
            Some(p) => p,
            None => self.get_price(chain_id, token).await?,
        };
        let sats_after_fee = (sats as u128)
            .saturating_sub(fee.sats_base_fee as u128)
            .saturating_mul(PPM - fee.fee_ppm as u128)
            / PPM;
        let fair_units = sats_after_fee.saturating_mul(1_000_000) / price;
        self.build_pricing_info(price, fee, fair_units, token_amount, sats_after_fee, prefetched_usd)
            .await
    }

    /// Validate a quote in the receive direction: the user pays
    /// `token_amount` base units and the LP quoted `sats` out.
    #[allow(clippy::too_many_arguments)]
    pub async fn is_valid_amount_receive(
        &self,
        chain_id: &str,
        sats: u64,
        fee: FeeData,
        token_amount: u128,
        token: &str,
        prefetched_price: Option<u128>,
        prefetched_usd: Option<Decimal>,
    ) -> Result<PricingInfo> {
        let price = match prefetched_price {
            Some(p) => p,
            None => self.get_price(chain_id, token).await?,
        };
        let sats_with_fee = (sats as u128)
            .saturating_add(fee.sats_base_fee as u128)
            .saturating_mul(PPM + fee.fee_ppm as u128)
            / PPM;
        let fair_units = sats_with_fee.saturating_mul(1_000_000) / price;
        self.build_pricing_info(price, fee, fair_units, token_amount, sats_with_fee, prefetched_usd)
            .await
    }

    async fn build_pricing_info(
        &self,
        real_price: u128,
        fee: FeeData,
        fair_units: u128,
        quoted_units: u128,
        effective_sats: u128,
        prefetched_usd: Option<Decimal>,
    ) -> Result<PricingInfo> {
        let difference_ppm = if fair_units == 0 {
            i64::MAX
        } else {
            let diff = fair_units as i128 - quoted_units as i128;
            (diff.saturating_mul(PPM as i128) / fair_units as i128) as i64
        };
        let is_valid = difference_ppm.unsigned_abs() <= self.config.max_allowed_fee_diff_ppm;

        let swap_price = if quoted_units == 0 {
            real_price
        } else {
            effective_sats.saturating_mul(1_000_000) / quoted_units
        };

        let usd = match prefetched_usd {
            Some(p) => Some(p),
            None => match self.get_usd_price().await {
                Ok(p) => Some(p),
                Err(e) => {
                    log::debug!("usd price unavailable: {}", e);
                    None
                }
            },
        };

        Ok(PricingInfo {
            is_valid,
            difference_ppm,
            sats_base_fee: fee.sats_base_fee,
            fee_ppm: fee.fee_ppm,
            real_price_usat_per_token: real_price,
            real_price_usd_per_bitcoin: usd,
            swap_price_usat_per_token: swap_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockProvider {
        name: &'static str,
        result: std::result::Result<Decimal, &'static str>,
        request_shaped: bool,
        calls: AtomicU32,
    }

    impl MockProvider {
        fn ok(name: &'static str, price: Decimal) -> Arc<Self> {
            Arc::new(Self {
                name,
                result: Ok(price),
                request_shaped: false,
                calls: AtomicU32::new(0),
            })
        }

        fn failing(name: &'static str, request_shaped: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                result: Err("down"),
                request_shaped,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl PriceProvider for MockProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_price(&self, _ticker: &Ticker) -> Result<Decimal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Ok(p) => Ok(*p),
                Err(msg) if self.request_shaped => Err(Error::Request(msg.to_string())),
                Err(msg) => Err(Error::Other(msg.to_string())),
            }
        }

        async fn fetch_usd_price(&self) -> Result<Decimal> {
            self.fetch_price(&Ticker::new("")).await
        }
    }

    fn binding_for(providers: &[&str]) -> CoinBinding {
        CoinBinding {
            chain_id: "CHAIN".into(),
            token: "TOK".into(),
            decimals: 8,
            tickers: providers
                .iter()
                .map(|p| (p.to_string(), Ticker::new("TOKBTC")))
                .collect(),
        }
    }

    fn oracle_with(providers: Vec<Arc<MockProvider>>) -> RedundantSwapPrice {
        let names: Vec<&str> = providers.iter().map(|p| p.name).collect();
        let coins = vec![binding_for(&names)];
        RedundantSwapPrice::new(
            providers
                .into_iter()
                .map(|p| p as Arc<dyn PriceProvider>)
                .collect(),
            coins,
            RedundantSwapPriceConfig {
                max_allowed_fee_diff_ppm: 10_000,
                cache_ttl: Duration::from_secs(0),
            },
        )
    }

    #[tokio::test]
    async fn test_failover_marks_and_converges() {
        let a = MockProvider::failing("a", true);
        let b = MockProvider::failing("b", false);
        let c = MockProvider::ok("c", dec!(0.00001234));
        let oracle = oracle_with(vec![a.clone(), b.clone(), c.clone()]);

        // 0.00001234 BTC/token at 8 decimals -> 12.34 usat/unit -> rounds to 12
        let price = oracle.get_price("CHAIN", "TOK").await.unwrap();
        assert_eq!(price, 12);

        let marks: Vec<Option<bool>> = oracle
            .entries
            .iter()
            .map(|e| *e.operational.lock().unwrap())
            .collect();
        assert_eq!(marks, vec![Some(false), Some(false), Some(true)]);

        // Next call goes to the operational provider only.
        let a_calls = a.calls.load(Ordering::SeqCst);
        let b_calls = b.calls.load(Ordering::SeqCst);
        oracle.get_price("CHAIN", "TOK").await.unwrap();
        assert_eq!(a.calls.load(Ordering::SeqCst), a_calls);
        assert_eq!(b.calls.load(Ordering::SeqCst), b_calls);
        assert!(c.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_all_failed_resets_to_unknown() {
        let a = MockProvider::failing("a", false);
        let oracle = oracle_with(vec![a.clone()]);
        // Non-Request errors are retried 5 times; each pass marks a false,
        // resets, probes again.
        let res = oracle.get_price("CHAIN", "TOK").await;
        assert!(res.is_err());
        assert!(a.calls.load(Ordering::SeqCst) >= crate::utils::MAX_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_request_error_not_retried() {
        let a = MockProvider::failing("a", true);
        let oracle = oracle_with(vec![a.clone()]);
        let res = oracle.get_price("CHAIN", "TOK").await;
        assert!(matches!(res, Err(Error::Request(_))));
        // One direct probe, no retry loop.
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_amount_validity_send() {
        let c = MockProvider::ok("c", dec!(0.0001)); // 10_000 usat/unit at 8 decimals
        let oracle = oracle_with(vec![c]);
        let fee = FeeData {
            sats_base_fee: 10,
            fee_ppm: 1000,
        };
        // 100_000 sats in, fair: (100_000-10)*0.999 = 99_890.01 -> 99890 sats
        // -> 99_890_000_000 usat / 10_000 = 9_989_000 units
        let info = oracle
            .is_valid_amount_send("CHAIN", 100_000, fee, 9_989_000, "TOK", None, None)
            .await
            .unwrap();
        assert!(info.is_valid);
        assert_eq!(info.difference_ppm, 0);

        // LP quoting 2% less than fair is rejected at 1% tolerance.
        let info = oracle
            .is_valid_amount_send("CHAIN", 100_000, fee, 9_789_220, "TOK", None, None)
            .await
            .unwrap();
        assert!(!info.is_valid);
        assert!(info.difference_ppm > 10_000);
    }
}
