//! Wire types for the intermediary (LP) HTTP API.
//!
//! These match the LP endpoint schemas; every big integer travels as a
//! decimal string.

use crate::chain::SignatureData;
use crate::types::{dec_u64, dec_u64_opt, dec_u128};
use serde::{Deserialize, Serialize};

/// Request body for `POST {lpUrl}/frombtc/getQuote`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromBtcQuoteRequest {
    /// Smart-chain address of the claimer (the user).
    pub address: String,
    /// Requested amount; satoshis in when `exact_in`, token base units out
    /// otherwise.
    #[serde(with = "dec_u128")]
    pub amount: u128,
    pub token: String,
    pub exact_in: bool,
    /// Random 64-bit sequence the escrow must carry.
    #[serde(with = "dec_u64")]
    pub sequence: u64,
    /// Token the security deposit is denominated in.
    pub deposit_token: String,
    /// Requested gas drop in native token base units.
    #[serde(with = "dec_u128")]
    pub gas_amount: u128,
}

/// Response of `POST {lpUrl}/frombtc/getQuote`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromBtcQuoteResponse {
    /// Bitcoin address the user must pay.
    pub btc_address: String,
    /// Satoshis the user must send.
    #[serde(with = "dec_u64")]
    pub amount: u64,
    /// Token base units the escrow will carry.
    #[serde(with = "dec_u128")]
    pub total: u128,
    #[serde(with = "dec_u128")]
    pub swap_fee: u128,
    #[serde(default, with = "dec_u64_opt")]
    pub swap_fee_btc: Option<u64>,
    /// Required bitcoin confirmations; inferred from the claim hash when
    /// absent.
    pub confirmations: Option<u32>,
    /// Extra data the escrow init will carry, hex encoded; must equal the
    /// contract's expected extra data for the quoted tuple.
    pub extra_data: String,
    /// Quote expiry, UNIX milliseconds.
    #[serde(with = "dec_u64")]
    pub expiry: u64,
    /// Serialized chain-specific escrow data.
    pub data: serde_json::Value,
    pub signature_data: SignatureData,
}

/// Request body for `POST {lpUrl}/frombtcln/getQuote`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromLnQuoteRequest {
    /// Smart-chain address of the claimer (the user).
    pub address: String,
    /// Hash of the secret pre-image the invoice must be locked to.
    pub payment_hash: String,
    #[serde(with = "dec_u128")]
    pub amount: u128,
    pub token: String,
    pub exact_in: bool,
    pub deposit_token: String,
    #[serde(with = "dec_u128")]
    pub gas_amount: u128,
    /// Whether watchtowers should settle on the user's behalf.
    pub auto_settle: bool,
}

/// Response of `POST {lpUrl}/frombtcln/getQuote`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromLnQuoteResponse {
    /// BOLT-11 payment request locked to the supplied payment hash.
    pub pr: String,
    /// Token base units the escrow will carry.
    #[serde(with = "dec_u128")]
    pub total: u128,
    #[serde(with = "dec_u128")]
    pub swap_fee: u128,
    #[serde(default, with = "dec_u64_opt")]
    pub swap_fee_btc: Option<u64>,
    /// Satoshis of the invoice attributable to the swap itself.
    #[serde(with = "dec_u64")]
    pub btc_amount_swap: u64,
    /// Satoshis of the invoice attributable to the gas drop.
    #[serde(with = "dec_u64")]
    pub btc_amount_gas: u64,
    /// Quote expiry, UNIX milliseconds.
    #[serde(with = "dec_u64")]
    pub expiry: u64,
}

/// Response of `POST {lpUrl}/frombtc_spv/getQuote`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpvQuoteResponse {
    pub quote_id: String,
    pub vault_owner: String,
    #[serde(with = "dec_u64")]
    pub vault_id: u64,
    pub vault_required_confirmations: u32,
    /// Multipliers scaling the OP_RETURN raw amounts into token base units;
    /// index 0 is the swap token, index 1 the gas token.
    pub vault_token_multipliers: Vec<String>,
    pub vault_btc_address: String,
    /// The current vault UTXO as `txid:vout`.
    pub vault_utxo: String,
    #[serde(with = "dec_u64")]
    pub vault_utxo_value: u64,
    pub btc_destination_address: String,
    #[serde(with = "dec_u64")]
    pub btc_amount: u64,
    #[serde(with = "dec_u64")]
    pub btc_amount_swap: u64,
    #[serde(with = "dec_u64")]
    pub btc_amount_gas: u64,
    #[serde(with = "dec_u64")]
    pub minimum_btc_fee_rate: u64,
    #[serde(with = "dec_u128")]
    pub output_total_swap: u128,
    pub output_swap_token: String,
    #[serde(with = "dec_u128")]
    pub output_total_gas: u128,
    pub output_gas_token: String,
    #[serde(with = "dec_u64")]
    pub gas_swap_fee_btc: u64,
    #[serde(with = "dec_u128")]
    pub gas_swap_fee: u128,
    #[serde(with = "dec_u64")]
    pub caller_fee_share: u64,
    #[serde(with = "dec_u64")]
    pub fronting_fee_share: u64,
    #[serde(with = "dec_u64")]
    pub execution_fee_share: u64,
    /// Quote expiry, UNIX milliseconds.
    #[serde(with = "dec_u64")]
    pub expiry: u64,
    #[serde(with = "dec_u128")]
    pub swap_fee: u128,
    #[serde(with = "dec_u64")]
    pub swap_fee_btc: u64,
}

impl SpvQuoteResponse {
    pub fn vault_token_multiplier(&self, index: usize) -> crate::Result<u128> {
        self.vault_token_multipliers
            .get(index)
            .and_then(|m| m.parse().ok())
            .ok_or_else(|| {
                crate::Error::Intermediary(format!("Missing vault token multiplier {}", index))
            })
    }
}

/// Request body for `POST {lpUrl}/frombtc_spv/postPsbt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPsbtRequest {
    pub quote_id: String,
    pub psbt_hex: String,
}

/// Status codes of `GET {lpUrl}/invoiceStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatusCode {
    AwaitPayment,
    Pending,
    TxSent,
    Paid,
    Expired,
    Refunded,
    Refundable,
    /// Anything the SDK does not know about.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceStatusData {
    pub tx_id: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Response of `GET {lpUrl}/invoiceStatus?paymentHash=…`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceStatusResponse {
    pub code: InvoiceStatusCode,
    pub data: Option<InvoiceStatusData>,
    #[serde(default)]
    pub msg: String,
}

/// Request body for the trusted gas-swap quote endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedGasQuoteRequest {
    /// Smart-chain address receiving the gas drop.
    pub address: String,
    /// Requested native token base units.
    #[serde(with = "dec_u128")]
    pub amount: u128,
}

/// Response of `POST {lpUrl}/lnforgas/getQuote`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LnForGasQuoteResponse {
    /// BOLT-11 payment request.
    pub pr: String,
    #[serde(with = "dec_u128")]
    pub total: u128,
    #[serde(with = "dec_u128")]
    pub swap_fee: u128,
    #[serde(with = "dec_u64")]
    pub swap_fee_sats: u64,
    /// Quote expiry, UNIX milliseconds.
    #[serde(with = "dec_u64")]
    pub expires_at: u64,
}

/// Response of `POST {lpUrl}/onchainforgas/getQuote`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnchainForGasQuoteResponse {
    pub btc_address: String,
    /// Identifier used for `/invoiceStatus` polling.
    pub payment_hash: String,
    #[serde(with = "dec_u64")]
    pub amount: u64,
    #[serde(with = "dec_u128")]
    pub total: u128,
    #[serde(with = "dec_u128")]
    pub swap_fee: u128,
    #[serde(with = "dec_u64")]
    pub swap_fee_sats: u64,
    #[serde(with = "dec_u64")]
    pub expires_at: u64,
}

/// Request body for `POST {lpUrl}/tobtc/getQuote` and `/tobtcln/getQuote`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToBtcQuoteRequest {
    /// Smart-chain address of the offerer (the user).
    pub address: String,
    /// Bitcoin destination: an address for on-chain, a BOLT-11 payment
    /// request for Lightning.
    pub destination: String,
    /// Satoshis out when `exact_in` is false, token base units in otherwise.
    #[serde(with = "dec_u128")]
    pub amount: u128,
    pub token: String,
    pub exact_in: bool,
    #[serde(with = "dec_u64")]
    pub sequence: u64,
}

/// Response of the TO-side quote endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToBtcQuoteResponse {
    /// Satoshis the LP will pay out.
    #[serde(with = "dec_u64")]
    pub amount: u64,
    /// Token base units the escrow must carry (incl. fees).
    #[serde(with = "dec_u128")]
    pub total: u128,
    #[serde(with = "dec_u128")]
    pub swap_fee: u128,
    #[serde(with = "dec_u64")]
    pub swap_fee_btc: u64,
    /// Bitcoin network fee the LP charges on top, in token base units.
    #[serde(with = "dec_u128")]
    pub network_fee: u128,
    #[serde(with = "dec_u64")]
    pub network_fee_btc: u64,
    /// Identifier the LP reports payment progress under.
    pub payment_hash: String,
    pub data: serde_json::Value,
    pub signature_data: SignatureData,
}

/// Status codes of the TO-side payment-result endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatusCode {
    Pending,
    Paid,
    NotFound,
    RefundAvailable,
    #[serde(other)]
    Unknown,
}

/// Response of `GET {lpUrl}/getPaymentStatus?paymentHash=…`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusResponse {
    pub code: PaymentStatusCode,
    /// Bitcoin txid of the payout (on-chain destinations).
    pub tx_id: Option<String>,
    /// Pre-image proving a Lightning payout.
    pub secret: Option<String>,
    #[serde(default)]
    pub msg: String,
}

/// Error body LPs return on semantic rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub msg: String,
}
