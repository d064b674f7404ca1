//! Trusted gas-drop swaps: tiny LN or on-chain BTC payments exchanged for
//! native gas token, with the LP trusted to send the destination
//! transaction.

use crate::api::{InvoiceStatusCode, TrustedGasQuoteRequest};
use crate::chain::{ChainEvent, TxStatus};
use crate::error::{Error, Result};
use crate::events::SwapEventEmitter;
use crate::swap::wrapper::{LpDescriptor, SwapWrapper, VerifyFees, WrapperSwap};
use crate::swap::{
    SWAP_SCHEMA_VERSION, StateCompare, StoredSwapCore, Swap, SwapContext, SwapCore, SwapShared,
    SwapState,
};
use crate::types::{PriceInfo, SwapKind, dec_u64_opt, dec_u128};
use crate::utils::{CancelHandle, cancellable_sleep, now_millis, retry_with_backoff};
use async_trait::async_trait;
use lightning_invoice::Bolt11Invoice;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How often the LP's invoice status is polled.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Status polling runs every N ticks.
const STATUS_POLL_TICKS: u32 = 5;

/// States of a trusted gas swap. Declaration order matches the numeric
/// state order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum TrustedGasState {
    /// The LP refunded the payment.
    Refunded = -4,
    /// The LP could not complete the swap and no refund is pending.
    Failed = -3,
    /// The quote expired unpaid.
    Expired = -2,
    /// Quote issued, awaiting the bitcoin/Lightning payment.
    PrCreated = 0,
    /// The LP received the payment.
    PrPaid = 1,
    /// The destination transaction confirmed; swap settled.
    Finished = 2,
    /// The LP offers a refund; awaiting it.
    Refundable = 3,
}

impl SwapState for TrustedGasState {
    fn to_i32(self) -> i32 {
        self as i32
    }

    fn from_i32(value: i32) -> Result<Self> {
        Ok(match value {
            -4 => Self::Refunded,
            -3 => Self::Failed,
            -2 => Self::Expired,
            0 => Self::PrCreated,
            1 => Self::PrPaid,
            2 => Self::Finished,
            3 => Self::Refundable,
            other => {
                return Err(Error::Parse(format!("Unknown trusted-gas state {}", other)));
            }
        })
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Refunded | Self::Failed | Self::Expired | Self::Finished
        )
    }

    fn is_success(self) -> bool {
        self == Self::Finished
    }

    fn is_quote_expired(self) -> bool {
        self == Self::Expired
    }

    fn transitions() -> &'static [(Self, Self)] {
        use TrustedGasState::*;
        &[
            (PrCreated, PrPaid),
            (PrCreated, Expired),
            (PrPaid, Finished),
            (PrPaid, Failed),
            (PrPaid, Refundable),
            (Refundable, Refunded),
            (Refundable, Finished),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredTrustedGas {
    #[serde(flatten)]
    core: StoredSwapCore,
    /// BOLT-11 invoice (Lightning kind).
    pr: Option<String>,
    /// Deposit address and amount (on-chain kind).
    btc_address: Option<String>,
    #[serde(with = "dec_u64_opt")]
    btc_amount: Option<u64>,
    payment_hash: String,
    /// Smart-chain address receiving the gas drop.
    recipient: String,
    /// Native gas token the drop pays out.
    token: String,
    /// Gas token base units the LP owes.
    #[serde(with = "dec_u128")]
    output_amount: u128,
    output_tx_id: Option<String>,
}

struct TrustedGasInner {
    core: SwapCore,
    state: TrustedGasState,
    pr: Option<String>,
    btc_address: Option<String>,
    btc_amount: Option<u64>,
    payment_hash: String,
    recipient: String,
    token: String,
    output_amount: u128,
    output_tx_id: Option<String>,
    tick_counter: u32,
}

impl TrustedGasInner {
    fn to_record(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(StoredTrustedGas {
            core: self.core.to_stored(self.state.to_i32()),
            pr: self.pr.clone(),
            btc_address: self.btc_address.clone(),
            btc_amount: self.btc_amount,
            payment_hash: self.payment_hash.clone(),
            recipient: self.recipient.clone(),
            token: self.token.clone(),
            output_amount: self.output_amount,
            output_tx_id: self.output_tx_id.clone(),
        })?)
    }
}

/// A trusted gas swap instance (TRUSTED_FROM_LN or TRUSTED_FROM_BTC).
pub struct TrustedGasSwap {
    id: String,
    kind: SwapKind,
    shared: SwapShared,
    inner: Mutex<TrustedGasInner>,
}

impl TrustedGasSwap {
    fn new(
        ctx: Arc<SwapContext>,
        emitter: SwapEventEmitter,
        kind: SwapKind,
        inner: TrustedGasInner,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: inner.core.id.clone(),
            kind,
            shared: SwapShared::new(ctx, emitter, inner.state.to_i32()),
            inner: Mutex::new(inner),
        })
    }

    async fn save_and_emit(
        &self,
        inner: &mut TrustedGasInner,
        state: TrustedGasState,
    ) -> Result<()> {
        if state != inner.state {
            if inner.state.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "Swap already settled as {:?}",
                    inner.state
                )));
            }
            if !TrustedGasState::can_transition(inner.state, state) {
                return Err(Error::InvalidState(format!(
                    "Illegal transition {:?} -> {:?}",
                    inner.state, state
                )));
            }
            inner.state = state;
        }
        self.shared
            .save_record(
                &self.id,
                inner.core.initiated,
                inner.state.is_quote_expired(),
                inner.to_record()?,
            )
            .await?;
        self.shared
            .emit_state(inner.core.kind, &self.id, inner.state.to_i32());
        Ok(())
    }

    pub async fn typed_state(&self) -> TrustedGasState {
        self.inner.lock().await.state
    }

    /// The BOLT-11 invoice to pay (Lightning kind).
    pub async fn get_payment_request(&self) -> Option<String> {
        self.inner.lock().await.pr.clone()
    }

    /// The deposit address and amount to pay (on-chain kind).
    pub async fn get_bitcoin_payment(&self) -> Option<(String, u64)> {
        let inner = self.inner.lock().await;
        Some((inner.btc_address.clone()?, inner.btc_amount?))
    }

    /// Transaction id of the destination gas-drop transaction.
    pub async fn get_output_tx_id(&self) -> Option<String> {
        self.inner.lock().await.output_tx_id.clone()
    }

    async fn poll_status(&self, inner: &mut TrustedGasInner) -> Result<()> {
        let status = self
            .shared
            .ctx
            .api
            .get_invoice_status(&inner.core.url, &inner.payment_hash)
            .await?;
        let tx_id = status.data.as_ref().and_then(|d| d.tx_id.clone());
        match status.code {
            InvoiceStatusCode::AwaitPayment => {}
            InvoiceStatusCode::Pending | InvoiceStatusCode::TxSent => {
                let learned_txid = tx_id.is_some() && inner.output_tx_id != tx_id;
                if let Some(tx_id) = tx_id {
                    inner.output_tx_id = Some(tx_id);
                }
                if inner.state == TrustedGasState::PrCreated {
                    inner.core.initiated = true;
                    self.save_and_emit(inner, TrustedGasState::PrPaid).await?;
                } else if learned_txid {
                    // Persist the newly learned destination txid; the state
                    // did not change, so nothing is emitted.
                    self.shared
                        .save_record(
                            &self.id,
                            inner.core.initiated,
                            inner.state.is_quote_expired(),
                            inner.to_record()?,
                        )
                        .await?;
                }
            }
            InvoiceStatusCode::Paid => {
                if let Some(tx_id) = tx_id {
                    inner.output_tx_id = Some(tx_id);
                }
                if inner.state == TrustedGasState::PrCreated {
                    inner.core.initiated = true;
                    self.save_and_emit(inner, TrustedGasState::PrPaid).await?;
                }
                // The LP says paid; trust but verify the destination tx.
                let Some(tx_id) = inner.output_tx_id.clone() else {
                    return Ok(());
                };
                match self.shared.ctx.chain.get_tx_status(&tx_id).await? {
                    TxStatus::Success => {
                        self.save_and_emit(inner, TrustedGasState::Finished).await?;
                    }
                    TxStatus::Reverted => {
                        self.save_and_emit(inner, TrustedGasState::Failed).await?;
                    }
                    TxStatus::Pending | TxStatus::NotFound => {}
                }
            }
            InvoiceStatusCode::Expired => {
                if inner.state == TrustedGasState::PrCreated {
                    self.save_and_emit(inner, TrustedGasState::Expired).await?;
                } else if inner.state == TrustedGasState::PrPaid {
                    self.save_and_emit(inner, TrustedGasState::Failed).await?;
                }
            }
            InvoiceStatusCode::Refundable => {
                if inner.state == TrustedGasState::PrPaid {
                    self.save_and_emit(inner, TrustedGasState::Refundable).await?;
                }
            }
            InvoiceStatusCode::Refunded => {
                if !inner.state.is_terminal() {
                    if inner.state == TrustedGasState::PrPaid {
                        self.save_and_emit(inner, TrustedGasState::Refundable).await?;
                    }
                    self.save_and_emit(inner, TrustedGasState::Refunded).await?;
                }
            }
            InvoiceStatusCode::Unknown => {}
        }
        Ok(())
    }

    /// Poll until the swap settles. Returns `true` when the gas drop was
    /// confirmed on the destination chain.
    pub async fn execute(&self, cancel: Option<&CancelHandle>) -> Result<bool> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                match inner.state {
                    TrustedGasState::Finished => return Ok(true),
                    TrustedGasState::Expired => {
                        return Err(Error::Expired("Quote expired unpaid".into()));
                    }
                    TrustedGasState::Failed => {
                        return Err(Error::CatastrophicFailure("Gas swap failed".into()));
                    }
                    TrustedGasState::Refunded => {
                        return Err(Error::CatastrophicFailure("Gas swap refunded".into()));
                    }
                    _ => {}
                }
                let before = (inner.state, inner.output_tx_id.clone());
                self.poll_status(&mut inner).await?;
                if (inner.state, inner.output_tx_id.clone()) != before {
                    continue;
                }
                if inner.state == TrustedGasState::PrCreated && inner.core.is_quote_expired() {
                    self.save_and_emit(&mut inner, TrustedGasState::Expired).await?;
                    return Err(Error::Expired("Quote expired unpaid".into()));
                }
            }
            cancellable_sleep(STATUS_POLL_INTERVAL, cancel).await?;
        }
    }
}

#[async_trait]
impl Swap for TrustedGasSwap {
    fn kind(&self) -> SwapKind {
        self.kind
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn state_id(&self) -> i32 {
        self.shared.current_state()
    }

    async fn is_initiated(&self) -> bool {
        self.inner.lock().await.core.initiated
    }

    async fn is_finished(&self) -> bool {
        self.typed_state().await.is_terminal()
    }

    async fn is_successful(&self) -> bool {
        self.typed_state().await.is_success()
    }

    async fn is_quote_expired(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.state.is_quote_expired()
            || (inner.state == TrustedGasState::PrCreated && inner.core.is_quote_expired())
    }

    async fn get_price_info(&self) -> Result<PriceInfo> {
        self.inner.lock().await.core.get_price_info()
    }

    async fn has_valid_price(&self) -> bool {
        self.inner.lock().await.core.has_valid_price()
    }

    async fn refresh_price_data(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let pricing = inner
            .core
            .pricing_info
            .clone()
            .ok_or_else(|| Error::InvalidState("Swap has no pricing info".into()))?;
        let sats = inner.btc_amount.unwrap_or(0);
        let refreshed = self
            .shared
            .ctx
            .prices
            .is_valid_amount_send(
                &inner.core.chain_identifier,
                sats,
                crate::types::FeeData {
                    sats_base_fee: pricing.sats_base_fee,
                    fee_ppm: pricing.fee_ppm,
                },
                inner.output_amount,
                &inner.token,
                None,
                pricing.real_price_usd_per_bitcoin,
            )
            .await?;
        inner.core.pricing_info = Some(refreshed);
        Ok(())
    }

    async fn wait_till_state(
        &self,
        target: i32,
        mode: StateCompare,
        cancel: Option<&CancelHandle>,
    ) -> Result<i32> {
        self.shared.wait_till_state(target, mode, cancel).await
    }

    async fn serialize(&self) -> Result<serde_json::Value> {
        self.inner.lock().await.to_record()
    }
}

#[async_trait]
impl WrapperSwap for TrustedGasSwap {
    fn from_record(
        ctx: Arc<SwapContext>,
        emitter: SwapEventEmitter,
        record: serde_json::Value,
    ) -> Result<Arc<Self>> {
        let stored: StoredTrustedGas = serde_json::from_value(record)?;
        let kind = stored.core.kind;
        let (core, state) = SwapCore::from_stored(stored.core);
        let inner = TrustedGasInner {
            state: TrustedGasState::from_i32(state)?,
            core,
            pr: stored.pr,
            btc_address: stored.btc_address,
            btc_amount: stored.btc_amount,
            payment_hash: stored.payment_hash,
            recipient: stored.recipient,
            token: stored.token,
            output_amount: stored.output_amount,
            output_tx_id: stored.output_tx_id,
            tick_counter: 0,
        };
        Ok(Self::new(ctx, emitter, kind, inner))
    }

    async fn sync(self: &Arc<Self>, _save: bool) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.state;
        if !inner.state.is_terminal() {
            if let Err(e) = self.poll_status(&mut inner).await {
                log::warn!("invoice status poll failed: {}", e);
            }
        }
        Ok(inner.state != before)
    }

    async fn tick_swap(self: &Arc<Self>, _save: bool) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.state;
        if inner.state == TrustedGasState::PrCreated && inner.core.is_quote_expired() {
            self.save_and_emit(&mut inner, TrustedGasState::Expired).await?;
            return Ok(true);
        }
        if !inner.state.is_terminal() {
            inner.tick_counter += 1;
            if inner.tick_counter % STATUS_POLL_TICKS == 0 {
                if let Err(e) = self.poll_status(&mut inner).await {
                    log::warn!("invoice status poll failed: {}", e);
                }
            }
        }
        Ok(inner.state != before)
    }

    async fn process_event(self: &Arc<Self>, _event: &ChainEvent) -> Result<()> {
        // Trusted swaps settle off the event plane; the LP status endpoint
        // is authoritative.
        Ok(())
    }

    async fn is_pending(&self) -> bool {
        !self.typed_state().await.is_terminal()
    }

    async fn is_quote_expired_final(&self) -> bool {
        self.typed_state().await.is_quote_expired()
    }
}

impl SwapWrapper<TrustedGasSwap> {
    /// Request a trusted Lightning gas-drop quote. The swap id is the
    /// invoice payment hash.
    pub async fn create_ln(
        self: &Arc<Self>,
        recipient: &str,
        amount: u128,
        gas_token: &str,
        lp: &LpDescriptor,
    ) -> Result<Arc<TrustedGasSwap>> {
        if self.kind != SwapKind::TrustedFromLn {
            return Err(Error::InvalidState("Wrapper does not own TRUSTED_FROM_LN".into()));
        }
        let request = TrustedGasQuoteRequest {
            address: recipient.to_string(),
            amount,
        };
        let quote = retry_with_backoff(
            || self.ctx.api.get_ln_for_gas_quote(&lp.url, &request),
            |e| !e.is_retryable(),
        )
        .await?;

        let invoice = Bolt11Invoice::from_str(&quote.pr)
            .map_err(|e| Error::Intermediary(format!("Invalid invoice: {}", e)))?;
        let payment_hash = {
            use bitcoin::hashes::Hash;
            hex::encode(invoice.payment_hash().to_byte_array())
        };
        let invoice_sats = invoice
            .amount_milli_satoshis()
            .map(|msat| msat / 1000)
            .ok_or_else(|| Error::Intermediary("Invoice carries no amount".into()))?;

        let pricing = self
            .verify_returned_price(
                false,
                invoice_sats,
                quote.total,
                gas_token,
                VerifyFees {
                    sats_base_fee: lp.sats_base_fee,
                    fee_ppm: lp.fee_ppm,
                    network_fee_token: 0,
                },
                None,
                None,
                None,
            )
            .await?;

        let core = SwapCore {
            kind: SwapKind::TrustedFromLn,
            id: payment_hash.clone(),
            escrow_hash: payment_hash.clone(),
            initiator: recipient.to_string(),
            chain_identifier: self.ctx.chain.chain_identifier(),
            url: lp.url.clone(),
            version: SWAP_SCHEMA_VERSION,
            initiated: false,
            exact_in: false,
            created_at: now_millis(),
            random_nonce: String::new(),
            expiry: quote.expires_at,
            swap_fee: quote.swap_fee,
            swap_fee_btc: quote.swap_fee_sats,
            pricing_info: Some(pricing),
        };
        let swap = TrustedGasSwap::new(
            self.ctx.clone(),
            self.emitter.clone(),
            SwapKind::TrustedFromLn,
            TrustedGasInner {
                core,
                state: TrustedGasState::PrCreated,
                pr: Some(quote.pr.clone()),
                btc_address: None,
                btc_amount: Some(invoice_sats),
                payment_hash,
                recipient: recipient.to_string(),
                token: gas_token.to_string(),
                output_amount: quote.total,
                output_tx_id: None,
                tick_counter: 0,
            },
        );
        self.track(&swap);
        Ok(swap)
    }

    /// Request a trusted on-chain gas-drop quote.
    pub async fn create_onchain(
        self: &Arc<Self>,
        recipient: &str,
        amount: u128,
        gas_token: &str,
        lp: &LpDescriptor,
    ) -> Result<Arc<TrustedGasSwap>> {
        if self.kind != SwapKind::TrustedFromBtc {
            return Err(Error::InvalidState(
                "Wrapper does not own TRUSTED_FROM_BTC".into(),
            ));
        }
        let request = TrustedGasQuoteRequest {
            address: recipient.to_string(),
            amount,
        };
        let quote = retry_with_backoff(
            || self.ctx.api.get_onchain_for_gas_quote(&lp.url, &request),
            |e| !e.is_retryable(),
        )
        .await?;
        crate::swap::escrow::locking_script(&quote.btc_address, self.ctx.btc_network)?;

        let pricing = self
            .verify_returned_price(
                false,
                quote.amount,
                quote.total,
                gas_token,
                VerifyFees {
                    sats_base_fee: lp.sats_base_fee,
                    fee_ppm: lp.fee_ppm,
                    network_fee_token: 0,
                },
                None,
                None,
                None,
            )
            .await?;

        let core = SwapCore {
            kind: SwapKind::TrustedFromBtc,
            id: quote.payment_hash.clone(),
            escrow_hash: quote.payment_hash.clone(),
            initiator: recipient.to_string(),
            chain_identifier: self.ctx.chain.chain_identifier(),
            url: lp.url.clone(),
            version: SWAP_SCHEMA_VERSION,
            initiated: false,
            exact_in: false,
            created_at: now_millis(),
            random_nonce: String::new(),
            expiry: quote.expires_at,
            swap_fee: quote.swap_fee,
            swap_fee_btc: quote.swap_fee_sats,
            pricing_info: Some(pricing),
        };
        let swap = TrustedGasSwap::new(
            self.ctx.clone(),
            self.emitter.clone(),
            SwapKind::TrustedFromBtc,
            TrustedGasInner {
                core,
                state: TrustedGasState::PrCreated,
                pr: None,
                btc_address: Some(quote.btc_address.clone()),
                btc_amount: Some(quote.amount),
                payment_hash: quote.payment_hash.clone(),
                recipient: recipient.to_string(),
                token: gas_token.to_string(),
                output_amount: quote.total,
                output_tx_id: None,
                tick_counter: 0,
            },
        );
        self.track(&swap);
        Ok(swap)
    }
}
