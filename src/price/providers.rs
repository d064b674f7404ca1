//! Price provider adapters for the public exchange APIs.
//!
//! Every adapter answers the same two questions: how many BTC one whole
//! token is worth, and how many USD one bitcoin is worth. The redundant
//! oracle in [`super::redundant`] handles scheduling, caching and failover.

use crate::error::{Error, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;

/// How a smart-chain token maps onto a provider's ticker space.
#[derive(Debug, Clone)]
pub struct CoinBinding {
    /// Opaque chain identifier the token lives on.
    pub chain_id: String,
    /// Token address on that chain.
    pub token: String,
    /// Decimals of the token's base unit.
    pub decimals: u8,
    /// Per-provider ticker symbol, keyed by provider name. A missing entry
    /// means the provider cannot price this token.
    pub tickers: HashMap<String, Ticker>,
}

/// A provider-specific ticker, optionally inverted (ticker quotes BTC in
/// token terms rather than the token in BTC terms).
#[derive(Debug, Clone)]
pub struct Ticker {
    pub symbol: String,
    pub invert: bool,
}

impl Ticker {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            invert: false,
        }
    }

    pub fn inverted(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            invert: true,
        }
    }
}

/// A single upstream price source.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Stable name used to pick tickers out of a [`CoinBinding`].
    fn name(&self) -> &'static str;

    /// Price of one whole token in BTC.
    async fn fetch_price(&self, ticker: &Ticker) -> Result<Decimal>;

    /// USD per bitcoin.
    async fn fetch_usd_price(&self) -> Result<Decimal>;
}

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

async fn get_json(client: &reqwest::Client, url: &str) -> Result<serde_json::Value> {
    let response = client
        .get(url)
        .timeout(HTTP_TIMEOUT)
        .send()
        .await
        .map_err(|e| Error::Request(format!("Failed to send request to {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(Error::Request(format!(
            "Price request to {} failed: {}",
            url,
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| Error::Parse(format!("Failed to parse response from {}: {}", url, e)))
}

fn decimal_field(value: &serde_json::Value, context: &str) -> Result<Decimal> {
    let parsed = match value {
        serde_json::Value::String(s) => s.parse::<Decimal>().ok(),
        serde_json::Value::Number(n) => n.to_string().parse::<Decimal>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| Error::Parse(format!("No numeric price in {} response", context)))
}

fn apply_inversion(price: Decimal, ticker: &Ticker) -> Result<Decimal> {
    if !ticker.invert {
        return Ok(price);
    }
    if price.is_zero() {
        return Err(Error::Parse("Zero price cannot be inverted".into()));
    }
    Ok(Decimal::ONE / price)
}

/// Binance spot ticker API.
#[derive(Debug, Clone)]
pub struct BinancePriceProvider {
    client: reqwest::Client,
    api_url: String,
}

impl BinancePriceProvider {
    pub fn new() -> Self {
        Self::with_url("https://api.binance.com/api/v3")
    }

    pub fn with_url(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for BinancePriceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceProvider for BinancePriceProvider {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn fetch_price(&self, ticker: &Ticker) -> Result<Decimal> {
        let url = format!("{}/ticker/price?symbol={}", self.api_url, ticker.symbol);
        let body = get_json(&self.client, &url).await?;
        let price = decimal_field(&body["price"], "binance")?;
        apply_inversion(price, ticker)
    }

    async fn fetch_usd_price(&self) -> Result<Decimal> {
        let url = format!("{}/ticker/price?symbol=BTCUSDC", self.api_url);
        let body = get_json(&self.client, &url).await?;
        decimal_field(&body["price"], "binance")
    }
}

/// OKX market ticker API.
#[derive(Debug, Clone)]
pub struct OkxPriceProvider {
    client: reqwest::Client,
    api_url: String,
}

impl OkxPriceProvider {
    pub fn new() -> Self {
        Self::with_url("https://www.okx.com/api/v5")
    }

    pub fn with_url(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for OkxPriceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceProvider for OkxPriceProvider {
    fn name(&self) -> &'static str {
        "okx"
    }

    async fn fetch_price(&self, ticker: &Ticker) -> Result<Decimal> {
        let url = format!("{}/market/ticker?instId={}", self.api_url, ticker.symbol);
        let body = get_json(&self.client, &url).await?;
        let last = body["data"]
            .get(0)
            .map(|entry| &entry["last"])
            .ok_or_else(|| Error::Parse("No ticker data in okx response".into()))?;
        let price = decimal_field(last, "okx")?;
        apply_inversion(price, ticker)
    }

    async fn fetch_usd_price(&self) -> Result<Decimal> {
        let url = format!("{}/market/ticker?instId=BTC-USDC", self.api_url);
        let body = get_json(&self.client, &url).await?;
        let last = body["data"]
            .get(0)
            .map(|entry| &entry["last"])
            .ok_or_else(|| Error::Parse("No ticker data in okx response".into()))?;
        decimal_field(last, "okx")
    }
}

/// CoinGecko simple price API; tickers are coin ids ("ethereum").
#[derive(Debug, Clone)]
pub struct CoinGeckoPriceProvider {
    client: reqwest::Client,
    api_url: String,
}

impl CoinGeckoPriceProvider {
    pub fn new() -> Self {
        Self::with_url("https://api.coingecko.com/api/v3")
    }

    pub fn with_url(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for CoinGeckoPriceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceProvider for CoinGeckoPriceProvider {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    async fn fetch_price(&self, ticker: &Ticker) -> Result<Decimal> {
        let url = format!(
            "{}/simple/price?ids={}&vs_currencies=btc",
            self.api_url, ticker.symbol
        );
        let body = get_json(&self.client, &url).await?;
        let price = decimal_field(&body[&ticker.symbol]["btc"], "coingecko")?;
        apply_inversion(price, ticker)
    }

    async fn fetch_usd_price(&self) -> Result<Decimal> {
        let url = format!(
            "{}/simple/price?ids=bitcoin&vs_currencies=usd",
            self.api_url
        );
        let body = get_json(&self.client, &url).await?;
        decimal_field(&body["bitcoin"]["usd"], "coingecko")
    }
}

/// CoinPaprika ticker API; tickers are coin ids ("eth-ethereum").
#[derive(Debug, Clone)]
pub struct CoinPaprikaPriceProvider {
    client: reqwest::Client,
    api_url: String,
}

impl CoinPaprikaPriceProvider {
    pub fn new() -> Self {
        Self::with_url("https://api.coinpaprika.com/v1")
    }

    pub fn with_url(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for CoinPaprikaPriceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceProvider for CoinPaprikaPriceProvider {
    fn name(&self) -> &'static str {
        "coinpaprika"
    }

    async fn fetch_price(&self, ticker: &Ticker) -> Result<Decimal> {
        let url = format!("{}/tickers/{}?quotes=BTC", self.api_url, ticker.symbol);
        let body = get_json(&self.client, &url).await?;
        let price = decimal_field(&body["quotes"]["BTC"]["price"], "coinpaprika")?;
        apply_inversion(price, ticker)
    }

    async fn fetch_usd_price(&self) -> Result<Decimal> {
        let url = format!("{}/tickers/btc-bitcoin?quotes=USD", self.api_url);
        let body = get_json(&self.client, &url).await?;
        decimal_field(&body["quotes"]["USD"]["price"], "coinpaprika")
    }
}

/// Kraken public ticker API.
#[derive(Debug, Clone)]
pub struct KrakenPriceProvider {
    client: reqwest::Client,
    api_url: String,
}

impl KrakenPriceProvider {
    pub fn new() -> Self {
        Self::with_url("https://api.kraken.com/0/public")
    }

    pub fn with_url(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn last_trade(body: &serde_json::Value) -> Result<Decimal> {
        let result = body["result"]
            .as_object()
            .and_then(|pairs| pairs.values().next())
            .ok_or_else(|| Error::Parse("No pair data in kraken response".into()))?;
        decimal_field(&result["c"][0], "kraken")
    }
}

impl Default for KrakenPriceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceProvider for KrakenPriceProvider {
    fn name(&self) -> &'static str {
        "kraken"
    }

    async fn fetch_price(&self, ticker: &Ticker) -> Result<Decimal> {
        let url = format!("{}/Ticker?pair={}", self.api_url, ticker.symbol);
        let body = get_json(&self.client, &url).await?;
        let price = Self::last_trade(&body)?;
        apply_inversion(price, ticker)
    }

    async fn fetch_usd_price(&self) -> Result<Decimal> {
        let url = format!("{}/Ticker?pair=XBTUSD", self.api_url);
        let body = get_json(&self.client, &url).await?;
        Self::last_trade(&body)
    }
}

/// A custom price endpoint returning `{"price": <number>}` for
/// `{url}/price/{ticker}` and `{"price": <number>}` for `{url}/usd`.
#[derive(Debug, Clone)]
pub struct CustomPriceProvider {
    client: reqwest::Client,
    api_url: String,
}

impl CustomPriceProvider {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PriceProvider for CustomPriceProvider {
    fn name(&self) -> &'static str {
        "custom"
    }

    async fn fetch_price(&self, ticker: &Ticker) -> Result<Decimal> {
        let url = format!("{}/price/{}", self.api_url, ticker.symbol);
        let body = get_json(&self.client, &url).await?;
        let price = decimal_field(&body["price"], "custom")?;
        apply_inversion(price, ticker)
    }

    async fn fetch_usd_price(&self) -> Result<Decimal> {
        let url = format!("{}/usd", self.api_url);
        let body = get_json(&self.client, &url).await?;
        decimal_field(&body["price"], "custom")
    }
}
