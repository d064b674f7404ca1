//! HTTP client for the intermediary (LP) API.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

use super::types::*;

/// The LP API surface the swap state machines consume.
///
/// Kept behind a trait so tests can drive the state machines without a live
/// intermediary.
#[async_trait]
pub trait IntermediaryApi: Send + Sync {
    async fn get_from_btc_quote(
        &self,
        lp_url: &str,
        request: &FromBtcQuoteRequest,
    ) -> Result<FromBtcQuoteResponse>;

    async fn get_from_ln_quote(
        &self,
        lp_url: &str,
        request: &FromLnQuoteRequest,
    ) -> Result<FromLnQuoteResponse>;

    async fn get_spv_quote(
        &self,
        lp_url: &str,
        request: &FromBtcQuoteRequest,
    ) -> Result<SpvQuoteResponse>;

    async fn post_spv_psbt(&self, lp_url: &str, quote_id: &str, psbt_hex: &str) -> Result<()>;

    async fn get_invoice_status(
        &self,
        lp_url: &str,
        payment_hash: &str,
    ) -> Result<InvoiceStatusResponse>;

    async fn get_ln_for_gas_quote(
        &self,
        lp_url: &str,
        request: &TrustedGasQuoteRequest,
    ) -> Result<LnForGasQuoteResponse>;

    async fn get_onchain_for_gas_quote(
        &self,
        lp_url: &str,
        request: &TrustedGasQuoteRequest,
    ) -> Result<OnchainForGasQuoteResponse>;

    async fn get_to_btc_quote(
        &self,
        lp_url: &str,
        request: &ToBtcQuoteRequest,
    ) -> Result<ToBtcQuoteResponse>;

    async fn get_to_ln_quote(
        &self,
        lp_url: &str,
        request: &ToBtcQuoteRequest,
    ) -> Result<ToBtcQuoteResponse>;

    async fn get_payment_status(
        &self,
        lp_url: &str,
        payment_hash: &str,
    ) -> Result<PaymentStatusResponse>;
}

/// Reqwest-backed [`IntermediaryApi`] implementation.
#[derive(Debug, Clone)]
pub struct HttpIntermediaryApi {
    client: reqwest::Client,
    get_timeout: Duration,
    post_timeout: Duration,
}

impl HttpIntermediaryApi {
    pub fn new(get_timeout: Duration, post_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            get_timeout,
            post_timeout,
        }
    }

    fn base(url: &str) -> &str {
        url.trim_end_matches('/')
    }

    /// Map a non-success response into the error taxonomy: transport
    /// failures and 5xx are retryable [`Error::Request`], everything else is
    /// a semantic [`Error::Intermediary`] rejection.
    async fn error_for(response: reqwest::Response) -> Error {
        let status = response.status();
        let body: ApiError = response.json().await.unwrap_or(ApiError {
            code: None,
            msg: "Unknown error".to_string(),
        });
        if status.is_server_error() {
            Error::Request(format!("LP returned {}: {}", status, body.msg))
        } else {
            Error::Intermediary(body.msg)
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .timeout(self.get_timeout)
            .send()
            .await
            .map_err(|e| Error::Request(format!("Failed to send request to {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::Request(format!("Failed to read response: {}", e)))?;

        log::debug!("GET {} response: {}", url, text);

        serde_json::from_str(&text)
            .map_err(|e| Error::Parse(format!("Failed to parse response: {}. Body: {}", e, text)))
    }

    async fn post_json<T: serde::de::DeserializeOwned, R: serde::Serialize>(
        &self,
        url: &str,
        body: &R,
    ) -> Result<T> {
        let response = self
            .client
            .post(url)
            .timeout(self.post_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Request(format!("Failed to send request to {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::Request(format!("Failed to read response: {}", e)))?;

        log::debug!("POST {} response: {}", url, text);

        serde_json::from_str(&text)
            .map_err(|e| Error::Parse(format!("Failed to parse response: {}. Body: {}", e, text)))
    }
}

impl Default for HttpIntermediaryApi {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(15))
    }
}

#[async_trait]
impl IntermediaryApi for HttpIntermediaryApi {
    async fn get_from_btc_quote(
        &self,
        lp_url: &str,
        request: &FromBtcQuoteRequest,
    ) -> Result<FromBtcQuoteResponse> {
        let url = format!("{}/frombtc/getQuote", Self::base(lp_url));
        self.post_json(&url, request).await
    }

    async fn get_from_ln_quote(
        &self,
        lp_url: &str,
        request: &FromLnQuoteRequest,
    ) -> Result<FromLnQuoteResponse> {
        let url = format!("{}/frombtcln/getQuote", Self::base(lp_url));
        self.post_json(&url, request).await
    }

    async fn get_spv_quote(
        &self,
        lp_url: &str,
        request: &FromBtcQuoteRequest,
    ) -> Result<SpvQuoteResponse> {
        let url = format!("{}/frombtc_spv/getQuote", Self::base(lp_url));
        self.post_json(&url, request).await
    }

    async fn post_spv_psbt(&self, lp_url: &str, quote_id: &str, psbt_hex: &str) -> Result<()> {
        let url = format!("{}/frombtc_spv/postPsbt", Self::base(lp_url));
        let request = PostPsbtRequest {
            quote_id: quote_id.to_string(),
            psbt_hex: psbt_hex.to_string(),
        };
        let _: serde_json::Value = self.post_json(&url, &request).await?;
        Ok(())
    }

    async fn get_invoice_status(
        &self,
        lp_url: &str,
        payment_hash: &str,
    ) -> Result<InvoiceStatusResponse> {
        let url = format!(
            "{}/invoiceStatus?paymentHash={}",
            Self::base(lp_url),
            payment_hash
        );
        self.get_json(&url).await
    }

    async fn get_ln_for_gas_quote(
        &self,
        lp_url: &str,
        request: &TrustedGasQuoteRequest,
    ) -> Result<LnForGasQuoteResponse> {
        let url = format!("{}/lnforgas/getQuote", Self::base(lp_url));
        self.post_json(&url, request).await
    }

    async fn get_onchain_for_gas_quote(
        &self,
        lp_url: &str,
        request: &TrustedGasQuoteRequest,
    ) -> Result<OnchainForGasQuoteResponse> {
        let url = format!("{}/onchainforgas/getQuote", Self::base(lp_url));
        self.post_json(&url, request).await
    }

    async fn get_to_btc_quote(
        &self,
        lp_url: &str,
        request: &ToBtcQuoteRequest,
    ) -> Result<ToBtcQuoteResponse> {
        let url = format!("{}/tobtc/getQuote", Self::base(lp_url));
        self.post_json(&url, request).await
    }

    async fn get_to_ln_quote(
        &self,
        lp_url: &str,
        request: &ToBtcQuoteRequest,
    ) -> Result<ToBtcQuoteResponse> {
        let url = format!("{}/tobtcln/getQuote", Self::base(lp_url));
        self.post_json(&url, request).await
    }

    async fn get_payment_status(
        &self,
        lp_url: &str,
        payment_hash: &str,
    ) -> Result<PaymentStatusResponse> {
        let url = format!(
            "{}/getPaymentStatus?paymentHash={}",
            Self::base(lp_url),
            payment_hash
        );
        self.get_json(&url).await
    }
}
