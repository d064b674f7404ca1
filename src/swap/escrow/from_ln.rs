//! Lightning → smart chain escrow swap, manual and watchtower-settled.
//!
//! The user holds a secret pre-image and receives a BOLT-11 invoice locked
//! to its hash. Once the LP receives the Lightning payment it produces the
//! escrow: in the manual kind the user commits it with the LP's
//! authorization, in the auto kind the LP initiates it directly and the
//! user (or a watchtower fed through the messenger plane) claims with the
//! secret.

use crate::api::{FromLnQuoteRequest, InvoiceStatusCode};
use crate::chain::{
    ChainEvent, EscrowStatus, EscrowType, SignatureData, SignerCapability,
    SwapClaimWitnessMessage, SwapData,
};
use crate::error::{Error, Result};
use crate::events::SwapEventEmitter;
use crate::swap::escrow::{EscrowDetails, LnAmounts, StoredEscrow};
use crate::swap::wrapper::{LpDescriptor, SwapWrapper, VerifyFees, WrapperSwap};
use crate::swap::{
    SWAP_SCHEMA_VERSION, StateCompare, StoredSwapCore, Swap, SwapContext, SwapCore, SwapShared,
    SwapState,
};
use crate::types::{PriceInfo, SwapKind};
use crate::utils::{CancelHandle, cancellable, cancellable_sleep, now_millis, random_nonce,
    retry_with_backoff};
use async_trait::async_trait;
use lightning_invoice::Bolt11Invoice;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How often the LP's invoice status is polled while waiting for payment.
const INVOICE_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// The secret is re-broadcast over the messenger every N ticks while the
/// escrow is committed.
const SECRET_BROADCAST_TICKS: u8 = 3;

/// States of a FROM_LN / FROM_LN_AUTO escrow swap. Declaration order
/// matches the numeric state order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum FromLnState {
    /// The escrow expired and was refunded to the LP.
    Failed = -4,
    /// The committed escrow passed its on-chain expiry.
    Expired = -3,
    /// The quote (or its invoice) definitively lapsed.
    QuoteExpired = -2,
    QuoteSoftExpired = -1,
    /// Invoice issued, not yet paid.
    PrCreated = 0,
    /// The LP received the Lightning payment.
    PrPaid = 1,
    /// The escrow is live on the smart chain.
    ClaimCommited = 2,
    /// Escrow claimed with the secret; swap settled.
    ClaimClaimed = 3,
}

impl SwapState for FromLnState {
    fn to_i32(self) -> i32 {
        self as i32
    }

    fn from_i32(value: i32) -> Result<Self> {
        Ok(match value {
            -4 => Self::Failed,
            -3 => Self::Expired,
            -2 => Self::QuoteExpired,
            -1 => Self::QuoteSoftExpired,
            0 => Self::PrCreated,
            1 => Self::PrPaid,
            2 => Self::ClaimCommited,
            3 => Self::ClaimClaimed,
            other => {
                return Err(Error::Parse(format!("Unknown FROM_LN state {}", other)));
            }
        })
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::QuoteExpired | Self::ClaimClaimed)
    }

    fn is_success(self) -> bool {
        self == Self::ClaimClaimed
    }

    fn is_quote_expired(self) -> bool {
        self == Self::QuoteExpired
    }

    fn transitions() -> &'static [(Self, Self)] {
        use FromLnState::*;
        &[
            (PrCreated, PrPaid),
            (PrCreated, ClaimCommited),
            (PrCreated, QuoteSoftExpired),
            (QuoteSoftExpired, QuoteExpired),
            (QuoteSoftExpired, PrPaid),
            (QuoteSoftExpired, ClaimCommited),
            (PrPaid, ClaimCommited),
            (PrPaid, Expired),
            (ClaimCommited, ClaimClaimed),
            (ClaimCommited, Expired),
            (Expired, Failed),
        ]
    }
}

/// Init authorization the LP hands out once the invoice is paid (manual
/// kind); carried inside the `/invoiceStatus` PAID payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaidInvoicePayload {
    data: serde_json::Value,
    signature: SignatureData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredFromLn {
    #[serde(flatten)]
    core: StoredSwapCore,
    pr: String,
    payment_hash: String,
    secret: String,
    #[serde(flatten)]
    amounts: LnAmounts,
    /// Present once the escrow data is known.
    escrow: Option<StoredEscrow>,
    lnurl_callback: Option<String>,
}

struct FromLnInner {
    core: SwapCore,
    state: FromLnState,
    pr: String,
    payment_hash: String,
    /// Hex-encoded secret pre-image.
    secret: String,
    amounts: LnAmounts,
    escrow: Option<EscrowDetails>,
    lnurl_callback: Option<String>,
    tick_counter: u8,
}

impl FromLnInner {
    fn to_record(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(StoredFromLn {
            core: self.core.to_stored(self.state.to_i32()),
            pr: self.pr.clone(),
            payment_hash: self.payment_hash.clone(),
            secret: self.secret.clone(),
            amounts: self.amounts.clone(),
            escrow: self.escrow.as_ref().map(EscrowDetails::to_stored),
            lnurl_callback: self.lnurl_callback.clone(),
        })?)
    }

    fn escrow(&self) -> Result<&EscrowDetails> {
        self.escrow
            .as_ref()
            .ok_or_else(|| Error::InvalidState("Escrow data not yet known".into()))
    }
}

/// A FROM_LN or FROM_LN_AUTO escrow swap instance.
pub struct FromLnSwap {
    id: String,
    kind: SwapKind,
    shared: SwapShared,
    inner: Mutex<FromLnInner>,
}

impl FromLnSwap {
    fn new(
        ctx: Arc<SwapContext>,
        emitter: SwapEventEmitter,
        kind: SwapKind,
        inner: FromLnInner,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: inner.core.id.clone(),
            kind,
            shared: SwapShared::new(ctx, emitter, inner.state.to_i32()),
            inner: Mutex::new(inner),
        })
    }

    fn is_auto(&self) -> bool {
        self.kind == SwapKind::FromLnAuto
    }

    async fn save_and_emit(&self, inner: &mut FromLnInner, state: FromLnState) -> Result<()> {
        if state != inner.state {
            if inner.state.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "Swap already settled as {:?}",
                    inner.state
                )));
            }
            if !FromLnState::can_transition(inner.state, state) {
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

    pub async fn typed_state(&self) -> FromLnState {
        self.inner.lock().await.state
    }

    /// The BOLT-11 invoice the user must pay.
    pub async fn get_payment_request(&self) -> String {
        self.inner.lock().await.pr.clone()
    }

    /// Satoshis the invoice carries net of the LP's fee; `None` when the
    /// swap amount is unknown.
    pub async fn get_input_amount_without_fee(&self) -> Option<u64> {
        let inner = self.inner.lock().await;
        inner.amounts.input_amount_without_fee(inner.core.swap_fee_btc)
    }

    pub async fn get_claim_txid(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .escrow
            .as_ref()
            .and_then(|e| e.claim_txid.clone())
    }

    /// Validate escrow data against this swap's commitments and the quote.
    fn verify_escrow_data(&self, inner: &FromLnInner, data: &dyn SwapData) -> Result<()> {
        let secret = hex::decode(&inner.secret)
            .map_err(|e| Error::Parse(format!("Bad secret encoding: {}", e)))?;
        let expected_claim_hash =
            hex::encode(self.shared.ctx.contract.get_hash_for_htlc(&secret));
        if data.claim_hash() != expected_claim_hash {
            return Err(Error::Intermediary(
                "Escrow claim hash does not match the secret".into(),
            ));
        }
        if data.claimer() != inner.core.initiator {
            return Err(Error::Intermediary("Caller is not the escrow claimer".into()));
        }
        if data.escrow_type() != EscrowType::Htlc {
            return Err(Error::Intermediary("Wrong escrow type".into()));
        }
        if data.has_success_action() {
            return Err(Error::Intermediary("Unexpected success action".into()));
        }
        Ok(())
    }

    /// Adopt newly learned escrow data (from the PAID payload, the chain, or
    /// an event) after validation.
    async fn adopt_escrow(
        &self,
        inner: &mut FromLnInner,
        data: Arc<dyn SwapData>,
        signature: Option<SignatureData>,
        committed: bool,
    ) -> Result<()> {
        self.verify_escrow_data(inner, data.as_ref())?;
        inner.core.escrow_hash = data.escrow_hash();
        inner.escrow = Some(EscrowDetails::new(data, signature));
        let state = if committed {
            FromLnState::ClaimCommited
        } else {
            inner.state
        };
        self.save_and_emit(inner, state).await?;
        Ok(())
    }

    async fn handle_invoice_status(
        &self,
        inner: &mut FromLnInner,
        code: InvoiceStatusCode,
        data: Option<crate::api::InvoiceStatusData>,
    ) -> Result<()> {
        match code {
            InvoiceStatusCode::Paid => {
                if inner.state == FromLnState::PrCreated
                    || inner.state == FromLnState::QuoteSoftExpired
                {
                    inner.core.initiated = true;
                    self.save_and_emit(inner, FromLnState::PrPaid).await?;
                }
                // The manual kind gets its init authorization with the PAID
                // status.
                if inner.escrow.is_none() {
                    if let Some(payload) = data.and_then(|d| d.data) {
                        if let Ok(payload) =
                            serde_json::from_value::<PaidInvoicePayload>(payload)
                        {
                            let data = self
                                .shared
                                .ctx
                                .contract
                                .deserialize_swap_data(payload.data)?;
                            self.adopt_escrow(inner, data, Some(payload.signature), false)
                                .await?;
                        }
                    }
                }
            }
            InvoiceStatusCode::Expired => {
                if matches!(
                    inner.state,
                    FromLnState::PrCreated | FromLnState::QuoteSoftExpired
                ) {
                    if inner.state == FromLnState::PrCreated {
                        self.save_and_emit(inner, FromLnState::QuoteSoftExpired)
                            .await?;
                    }
                    self.save_and_emit(inner, FromLnState::QuoteExpired).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Poll the LP until the Lightning payment is received, then (for the
    /// auto kind) until the LP commits the escrow.
    pub async fn wait_for_payment(&self, cancel: Option<&CancelHandle>) -> Result<()> {
        loop {
            let progressed = {
                let mut inner = self.inner.lock().await;
                if inner.state.is_terminal() {
                    return Err(Error::InvalidState(format!(
                        "Swap settled as {:?}",
                        inner.state
                    )));
                }
                if inner.state >= FromLnState::PrPaid {
                    if !self.is_auto() || inner.state >= FromLnState::ClaimCommited {
                        return Ok(());
                    }
                    // Auto kind: look for the LP-initiated escrow.
                    let claim_hash = {
                        let secret = hex::decode(&inner.secret)
                            .map_err(|e| Error::Parse(format!("Bad secret: {}", e)))?;
                        hex::encode(self.shared.ctx.contract.get_hash_for_htlc(&secret))
                    };
                    if let Some(data) = self
                        .shared
                        .ctx
                        .contract
                        .get_committed_data(&claim_hash)
                        .await?
                    {
                        self.adopt_escrow(&mut inner, data, None, true).await?;
                        return Ok(());
                    }
                    false
                } else {
                    let before = inner.state;
                    let status = self
                        .shared
                        .ctx
                        .api
                        .get_invoice_status(&inner.core.url, &inner.payment_hash)
                        .await?;
                    self.handle_invoice_status(&mut inner, status.code, status.data)
                        .await?;
                    if inner.state == FromLnState::QuoteExpired {
                        return Err(Error::Expired("Invoice expired unpaid".into()));
                    }
                    inner.state != before
                }
            };
            if !progressed {
                cancellable_sleep(INVOICE_POLL_INTERVAL, cancel).await?;
            }
        }
    }

    /// Post the invoice to an LNURL-withdraw callback so the counterparty
    /// pays it, then monitor for payment receipt.
    pub async fn withdraw_via_lnurl(
        &self,
        callback_url: &str,
        k1: &str,
        cancel: Option<&CancelHandle>,
    ) -> Result<()> {
        if callback_url.is_empty() {
            return Err(Error::User("Malformed LNURL-withdraw callback".into()));
        }
        let lnurl = self
            .shared
            .ctx
            .lnurl
            .clone()
            .ok_or_else(|| Error::User("No LNURL client configured".into()))?;
        let pr = {
            let mut inner = self.inner.lock().await;
            if inner.state != FromLnState::PrCreated {
                return Err(Error::InvalidState(format!(
                    "Cannot withdraw from {:?}",
                    inner.state
                )));
            }
            inner.lnurl_callback = Some(callback_url.to_string());
            inner.pr.clone()
        };
        lnurl.submit_invoice(callback_url, k1, &pr).await?;
        self.wait_for_payment(cancel).await
    }

    /// Commit the escrow with the LP's authorization (manual kind).
    pub async fn commit(
        &self,
        signer: &dyn SignerCapability,
        cancel: Option<&CancelHandle>,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        if inner.state != FromLnState::PrPaid {
            return Err(Error::InvalidState(format!(
                "Cannot commit from {:?}",
                inner.state
            )));
        }
        if signer.address() != inner.core.initiator {
            return Err(Error::User("Signer does not match swap initiator".into()));
        }
        let escrow = inner.escrow()?.clone();
        let signature = escrow
            .signature
            .clone()
            .ok_or_else(|| Error::InvalidState("Swap has no init authorization".into()))?;
        let txs = self
            .shared
            .ctx
            .contract
            .txs_init(escrow.data.as_ref(), &signature)
            .await?;
        let txid = self
            .shared
            .ctx
            .contract
            .send_and_confirm(signer, txs, cancel)
            .await?;
        if let Some(escrow) = inner.escrow.as_mut() {
            escrow.commit_txid = Some(txid.clone());
        }
        self.save_and_emit(&mut inner, FromLnState::ClaimCommited)
            .await?;
        Ok(txid)
    }

    /// Claim the committed escrow by revealing the secret.
    pub async fn claim(
        &self,
        signer: &dyn SignerCapability,
        cancel: Option<&CancelHandle>,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        if inner.state != FromLnState::ClaimCommited {
            return Err(Error::InvalidState(format!(
                "Cannot claim from {:?}",
                inner.state
            )));
        }
        let secret = hex::decode(&inner.secret)
            .map_err(|e| Error::Parse(format!("Bad secret encoding: {}", e)))?;
        let data = inner.escrow()?.data.clone();

        let ctx = &self.shared.ctx;
        let claim_attempt = async {
            let txs = ctx
                .contract
                .txs_claim_with_secret(&signer.address(), data.as_ref(), &secret)
                .await?;
            ctx.contract.send_and_confirm(signer, txs, cancel).await
        };

        match claim_attempt.await {
            Ok(txid) => {
                if let Some(escrow) = inner.escrow.as_mut() {
                    escrow.claim_txid = Some(txid.clone());
                }
                self.save_and_emit(&mut inner, FromLnState::ClaimClaimed)
                    .await?;
                Ok(txid)
            }
            Err(claim_err) => {
                let status = ctx
                    .contract
                    .get_commit_status(&inner.core.initiator, data.as_ref())
                    .await?;
                if let EscrowStatus::Paid { claim_txid } = status {
                    if let Some(escrow) = inner.escrow.as_mut() {
                        escrow.claim_txid = claim_txid.clone();
                    }
                    self.save_and_emit(&mut inner, FromLnState::ClaimClaimed)
                        .await?;
                    return Ok(claim_txid.unwrap_or_default());
                }
                Err(claim_err)
            }
        }
    }

    /// Publish the claim witness over the messenger gossip plane so a
    /// watchtower can settle on the user's behalf.
    ///
    /// Only broadcasts while the escrow is committed and the secret
    /// validates against its claim hash.
    pub async fn broadcast_secret(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        if inner.state != FromLnState::ClaimCommited {
            return Err(Error::InvalidState(format!(
                "No committed escrow to settle from {:?}",
                inner.state
            )));
        }
        let escrow = inner.escrow()?;
        let secret = hex::decode(&inner.secret)
            .map_err(|e| Error::Parse(format!("Bad secret encoding: {}", e)))?;
        let expected = hex::encode(self.shared.ctx.contract.get_hash_for_htlc(&secret));
        if escrow.data.claim_hash() != expected {
            return Err(Error::InvalidState(
                "Secret does not match the escrow claim hash".into(),
            ));
        }
        let messenger = self
            .shared
            .ctx
            .messenger
            .clone()
            .ok_or_else(|| Error::InvalidState("No messenger configured".into()))?;
        messenger
            .broadcast(SwapClaimWitnessMessage {
                data: escrow.data.serialize(),
                secret: inner.secret.clone(),
            })
            .await
    }

    /// Drive the swap to settlement. Returns `true` when the escrow claim
    /// was observed, `false` only when the automatic-settlement window
    /// lapsed and the caller should `claim()` themselves.
    pub async fn execute(&self, cancel: Option<&CancelHandle>) -> Result<bool> {
        self.wait_for_payment(cancel).await?;
        let state = self.typed_state().await;
        if state.is_terminal() {
            return if state.is_success() {
                Ok(true)
            } else {
                Err(Error::InvalidState(format!("Swap failed as {:?}", state)))
            };
        }

        if self.is_auto() {
            self.broadcast_secret().await?;
        }

        let waited = cancellable(
            async {
                tokio::time::timeout(
                    self.shared.ctx.options.max_wait_till_automatic_settlement,
                    self.shared.wait_till_state(
                        FromLnState::ClaimClaimed.to_i32(),
                        StateCompare::Eq,
                        None,
                    ),
                )
                .await
                .map_err(|_| Error::Expired("settlement window lapsed".into()))?
            },
            cancel,
        )
        .await;

        match waited {
            Ok(_) => Ok(true),
            Err(Error::Expired(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn sync_inner(&self, inner: &mut FromLnInner) -> Result<bool> {
        let before = inner.state;
        match inner.state {
            FromLnState::PrCreated | FromLnState::QuoteSoftExpired => {
                match self
                    .shared
                    .ctx
                    .api
                    .get_invoice_status(&inner.core.url, &inner.payment_hash)
                    .await
                {
                    Ok(status) => {
                        self.handle_invoice_status(inner, status.code, status.data)
                            .await?
                    }
                    Err(e) => log::warn!("invoice status poll failed: {}", e),
                }
                if inner.state == FromLnState::PrCreated && inner.core.is_quote_expired() {
                    self.save_and_emit(inner, FromLnState::QuoteSoftExpired)
                        .await?;
                }
            }
            FromLnState::PrPaid => {
                let claim_hash = {
                    let secret = hex::decode(&inner.secret)
                        .map_err(|e| Error::Parse(format!("Bad secret: {}", e)))?;
                    hex::encode(self.shared.ctx.contract.get_hash_for_htlc(&secret))
                };
                if inner.escrow.is_none() {
                    if let Some(data) = self
                        .shared
                        .ctx
                        .contract
                        .get_committed_data(&claim_hash)
                        .await?
                    {
                        self.adopt_escrow(inner, data, None, true).await?;
                    }
                } else {
                    let escrow = inner.escrow()?.data.clone();
                    let status = self
                        .shared
                        .ctx
                        .contract
                        .get_commit_status(&inner.core.initiator, escrow.as_ref())
                        .await?;
                    if matches!(status, EscrowStatus::Committed) {
                        self.save_and_emit(inner, FromLnState::ClaimCommited).await?;
                    }
                }
            }
            FromLnState::ClaimCommited => {
                let escrow = inner.escrow()?.data.clone();
                let status = self
                    .shared
                    .ctx
                    .contract
                    .get_commit_status(&inner.core.initiator, escrow.as_ref())
                    .await?;
                match status {
                    EscrowStatus::Paid { claim_txid } => {
                        if let Some(escrow) = inner.escrow.as_mut() {
                            escrow.claim_txid = claim_txid;
                        }
                        self.save_and_emit(inner, FromLnState::ClaimClaimed).await?;
                    }
                    EscrowStatus::Expired => {
                        self.save_and_emit(inner, FromLnState::Expired).await?;
                    }
                    EscrowStatus::Refunded | EscrowStatus::NotCommitted => {
                        self.save_and_emit(inner, FromLnState::Expired).await?;
                        self.save_and_emit(inner, FromLnState::Failed).await?;
                    }
                    EscrowStatus::Committed => {}
                }
            }
            FromLnState::Expired => {
                self.save_and_emit(inner, FromLnState::Failed).await?;
            }
            _ => {}
        }
        Ok(inner.state != before)
    }
}

#[async_trait]
impl Swap for FromLnSwap {
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
            || (inner.state == FromLnState::PrCreated && inner.core.is_quote_expired())
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
        let sats = inner
            .amounts
            .btc_amount_swap
            .unwrap_or(0)
            .saturating_add(inner.amounts.btc_amount_gas.unwrap_or(0));
        let token_amount = inner
            .escrow
            .as_ref()
            .map(|e| e.data.amount())
            .unwrap_or(0);
        let token = inner
            .escrow
            .as_ref()
            .map(|e| e.data.token())
            .unwrap_or_default();
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
                token_amount,
                &token,
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
impl WrapperSwap for FromLnSwap {
    fn from_record(
        ctx: Arc<SwapContext>,
        emitter: SwapEventEmitter,
        record: serde_json::Value,
    ) -> Result<Arc<Self>> {
        let stored: StoredFromLn = serde_json::from_value(record)?;
        let kind = stored.core.kind;
        let (core, state) = SwapCore::from_stored(stored.core);
        let inner = FromLnInner {
            escrow: stored
                .escrow
                .map(|e| EscrowDetails::from_stored(ctx.contract.as_ref(), e))
                .transpose()?,
            state: FromLnState::from_i32(state)?,
            core,
            pr: stored.pr,
            payment_hash: stored.payment_hash,
            secret: stored.secret,
            amounts: stored.amounts,
            lnurl_callback: stored.lnurl_callback,
            tick_counter: 0,
        };
        Ok(Self::new(ctx, emitter, kind, inner))
    }

    async fn sync(self: &Arc<Self>, _save: bool) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        self.sync_inner(&mut inner).await
    }

    async fn tick_swap(self: &Arc<Self>, _save: bool) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.state;
        match inner.state {
            FromLnState::PrCreated if inner.core.is_quote_expired() => {
                self.save_and_emit(&mut inner, FromLnState::QuoteSoftExpired)
                    .await?;
            }
            FromLnState::ClaimCommited if self.is_auto() => {
                // Re-broadcast the claim witness every third tick so late
                // watchtowers still pick it up.
                let counter = inner.tick_counter;
                inner.tick_counter = (inner.tick_counter + 1) % SECRET_BROADCAST_TICKS;
                if counter == 0 {
                    drop(inner);
                    if let Err(e) = self.broadcast_secret().await {
                        log::warn!("secret broadcast failed: {}", e);
                    }
                    return Ok(false);
                }
            }
            _ => {}
        }
        Ok(inner.state != before)
    }

    async fn process_event(self: &Arc<Self>, event: &ChainEvent) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match event {
            ChainEvent::Initialize { .. } => {
                if inner.state < FromLnState::ClaimCommited && !inner.state.is_terminal() {
                    inner.core.initiated = true;
                    if inner.escrow.is_some() {
                        self.save_and_emit(&mut inner, FromLnState::ClaimCommited)
                            .await?;
                    } else {
                        let claim_hash = {
                            let secret = hex::decode(&inner.secret)
                                .map_err(|e| Error::Parse(format!("Bad secret: {}", e)))?;
                            hex::encode(self.shared.ctx.contract.get_hash_for_htlc(&secret))
                        };
                        if let Some(data) = self
                            .shared
                            .ctx
                            .contract
                            .get_committed_data(&claim_hash)
                            .await?
                        {
                            if inner.state < FromLnState::PrPaid {
                                self.save_and_emit(&mut inner, FromLnState::PrPaid).await?;
                            }
                            self.adopt_escrow(&mut inner, data, None, true).await?;
                        }
                    }
                }
            }
            ChainEvent::Claim { txid, .. } => {
                if !inner.state.is_terminal() {
                    if let Some(escrow) = inner.escrow.as_mut() {
                        escrow.claim_txid = txid.clone();
                    }
                    self.save_and_emit(&mut inner, FromLnState::ClaimClaimed)
                        .await?;
                }
            }
            ChainEvent::Refund { .. } => {
                if !inner.state.is_terminal() && inner.state >= FromLnState::PrPaid {
                    self.save_and_emit(&mut inner, FromLnState::Expired).await?;
                    self.save_and_emit(&mut inner, FromLnState::Failed).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn is_pending(&self) -> bool {
        !self.typed_state().await.is_terminal()
    }

    async fn is_quote_expired_final(&self) -> bool {
        self.typed_state().await.is_quote_expired()
    }
}

impl SwapWrapper<FromLnSwap> {
    /// Request a Lightning quote from the LP and build the verified swap.
    ///
    /// The generated secret stays local; the invoice is locked to its hash.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        self: &Arc<Self>,
        signer: &dyn SignerCapability,
        lp: &LpDescriptor,
        amount: u128,
        token: &str,
        exact_in: bool,
        gas_amount: u128,
        deposit_token: &str,
    ) -> Result<Arc<FromLnSwap>> {
        let secret: [u8; 32] = rand::random();
        let payment_hash = hex::encode(Sha256::digest(secret));
        let claim_hash = hex::encode(self.ctx.contract.get_hash_for_htlc(&secret));

        let request = FromLnQuoteRequest {
            address: signer.address(),
            payment_hash: payment_hash.clone(),
            amount,
            token: token.to_string(),
            exact_in,
            deposit_token: deposit_token.to_string(),
            gas_amount,
            auto_settle: self.kind == SwapKind::FromLnAuto,
        };

        let prefetched_price = self.pre_fetch_price(token).await;
        let prefetched_usd = self.pre_fetch_usd_price().await;

        let quote = retry_with_backoff(
            || self.ctx.api.get_from_ln_quote(&lp.url, &request),
            |e| !e.is_retryable(),
        )
        .await?;

        let invoice = Bolt11Invoice::from_str(&quote.pr)
            .map_err(|e| Error::Intermediary(format!("Invalid invoice: {}", e)))?;
        let invoice_payment_hash = {
            use bitcoin::hashes::Hash;
            hex::encode(invoice.payment_hash().to_byte_array())
        };
        if invoice_payment_hash != payment_hash {
            return Err(Error::Intermediary(
                "Invoice is not locked to the swap secret".into(),
            ));
        }
        let invoice_sats = invoice
            .amount_milli_satoshis()
            .map(|msat| msat / 1000)
            .ok_or_else(|| Error::Intermediary("Invoice carries no amount".into()))?;
        if invoice_sats != quote.btc_amount_swap + quote.btc_amount_gas {
            return Err(Error::Intermediary("Invoice amount mismatch".into()));
        }
        let now = now_millis();
        if quote.expiry < now + self.ctx.options.min_send_window.as_millis() as u64 {
            return Err(Error::Intermediary("Send window too short".into()));
        }

        let pricing = self
            .verify_returned_price(
                false,
                invoice_sats,
                quote.total,
                token,
                VerifyFees {
                    sats_base_fee: lp.sats_base_fee,
                    fee_ppm: lp.fee_ppm,
                    network_fee_token: 0,
                },
                prefetched_price,
                prefetched_usd,
                None,
            )
            .await?;

        let nonce = random_nonce();
        let core = SwapCore {
            kind: self.kind,
            id: format!("{}{}", claim_hash, nonce),
            // Until the escrow exists, events resolve through the claim
            // hash.
            escrow_hash: claim_hash,
            initiator: signer.address(),
            chain_identifier: self.ctx.chain.chain_identifier(),
            url: lp.url.clone(),
            version: SWAP_SCHEMA_VERSION,
            initiated: false,
            exact_in,
            created_at: now,
            random_nonce: nonce,
            expiry: quote.expiry,
            swap_fee: quote.swap_fee,
            swap_fee_btc: quote.swap_fee_btc.unwrap_or(0),
            pricing_info: Some(pricing),
        };
        let swap = FromLnSwap::new(
            self.ctx.clone(),
            self.emitter.clone(),
            self.kind,
            FromLnInner {
                core,
                state: FromLnState::PrCreated,
                pr: quote.pr.clone(),
                payment_hash,
                secret: hex::encode(secret),
                amounts: LnAmounts {
                    btc_amount_swap: Some(quote.btc_amount_swap),
                    btc_amount_gas: Some(quote.btc_amount_gas),
                },
                escrow: None,
                lnurl_callback: None,
                tick_counter: 0,
            },
        );
        self.track(&swap);
        Ok(swap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UnifiedSwapEventListener;
    use crate::testutil::*;

    const USER: &str = "0xUSER";

    fn ln_swap(world: &MockWorld, auto: bool) -> (Arc<FromLnSwap>, MockSwapData) {
        let secret = [7u8; 32];
        let secret_hex = hex::encode(secret);
        let claim_hash = sha256_hex(&secret);
        let data = MockSwapData {
            claimer: USER.into(),
            offerer: "0xLP".into(),
            amount: 1_000_000,
            claim_hash: claim_hash.clone(),
            escrow_hash: sha256_hex(claim_hash.as_bytes()),
            escrow_type: EscrowType::Htlc,
            ..MockSwapData::default()
        };
        let kind = if auto {
            SwapKind::FromLnAuto
        } else {
            SwapKind::FromLn
        };
        let core = SwapCore {
            kind,
            id: format!("{}nonce", claim_hash),
            escrow_hash: claim_hash.clone(),
            initiator: USER.into(),
            chain_identifier: MOCK_CHAIN_ID.into(),
            url: "http://lp".into(),
            version: SWAP_SCHEMA_VERSION,
            initiated: false,
            exact_in: true,
            created_at: now_millis(),
            random_nonce: "nonce".into(),
            expiry: now_millis() + 3_600_000,
            swap_fee: 100,
            swap_fee_btc: 10,
            pricing_info: None,
        };
        let swap = FromLnSwap::new(
            world.context(),
            SwapEventEmitter::new(),
            kind,
            FromLnInner {
                core,
                state: FromLnState::PrCreated,
                pr: "lnbcrt1invoice".into(),
                payment_hash: claim_hash.clone(),
                secret: secret_hex,
                amounts: LnAmounts {
                    btc_amount_swap: Some(10_000),
                    btc_amount_gas: Some(500),
                },
                escrow: None,
                lnurl_callback: None,
                tick_counter: 0,
            },
        );
        (swap, data)
    }

    fn paid_status(payload: Option<serde_json::Value>) -> crate::api::InvoiceStatusResponse {
        crate::api::InvoiceStatusResponse {
            code: InvoiceStatusCode::Paid,
            data: Some(crate::api::InvoiceStatusData {
                tx_id: None,
                data: payload,
            }),
            msg: String::new(),
        }
    }

    #[tokio::test]
    async fn test_manual_flow_paid_then_commit_then_claim() {
        let world = MockWorld::new();
        let (swap, data) = ln_swap(&world, false);

        let payload = serde_json::json!({
            "data": SwapData::serialize(&data),
            "signature": {
                "prefix": "init",
                "timeout": "99999999999",
                "signature": "cafe",
            },
        });
        world
            .api
            .invoice_statuses
            .lock()
            .unwrap()
            .push_back(paid_status(Some(payload)));

        swap.wait_for_payment(None).await.unwrap();
        assert_eq!(swap.typed_state().await, FromLnState::PrPaid);
        assert!(swap.is_initiated().await);

        swap.commit(&MockSigner(USER.into()), None).await.unwrap();
        assert_eq!(swap.typed_state().await, FromLnState::ClaimCommited);

        swap.claim(&MockSigner(USER.into()), None).await.unwrap();
        assert_eq!(swap.typed_state().await, FromLnState::ClaimClaimed);
        assert!(swap.is_successful().await);
    }

    #[tokio::test]
    async fn test_auto_flow_lp_initiates_and_secret_broadcast() {
        let world = MockWorld::new();
        let (swap, data) = ln_swap(&world, true);
        let claim_hash = data.claim_hash.clone();

        world
            .api
            .invoice_statuses
            .lock()
            .unwrap()
            .push_back(paid_status(None));
        // LP commits the escrow as soon as the payment lands.
        world
            .contract
            .committed_data
            .lock()
            .unwrap()
            .insert(claim_hash, Arc::new(data.clone()));

        swap.wait_for_payment(None).await.unwrap();
        assert_eq!(swap.typed_state().await, FromLnState::ClaimCommited);

        // Tick counter {0,1,2}: broadcast fires on 0 only.
        for _ in 0..6 {
            swap.tick_swap(true).await.unwrap();
        }
        assert_eq!(world.messenger.broadcasts.lock().unwrap().len(), 2);
        let message = world.messenger.broadcasts.lock().unwrap()[0].clone();
        assert_eq!(message.secret, hex::encode([7u8; 32]));
        assert_eq!(message.data, SwapData::serialize(&data));
    }

    #[tokio::test]
    async fn test_broadcast_rejects_wrong_secret() {
        let world = MockWorld::new();
        let (swap, data) = ln_swap(&world, true);
        {
            let mut inner = swap.inner.lock().await;
            inner.escrow = Some(EscrowDetails::new(Arc::new(data), None));
            inner.state = FromLnState::ClaimCommited;
            // Corrupt the secret after the escrow was adopted.
            inner.secret = hex::encode([9u8; 32]);
        }
        let res = swap.broadcast_secret().await;
        assert!(matches!(res, Err(Error::InvalidState(_))));
        assert!(world.messenger.broadcasts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invoice_expiry_is_definitive() {
        let world = MockWorld::new();
        let (swap, _) = ln_swap(&world, false);
        world.api.invoice_statuses.lock().unwrap().push_back(
            crate::api::InvoiceStatusResponse {
                code: InvoiceStatusCode::Expired,
                data: None,
                msg: String::new(),
            },
        );
        let res = swap.wait_for_payment(None).await;
        assert!(matches!(res, Err(Error::Expired(_))));
        assert_eq!(swap.typed_state().await, FromLnState::QuoteExpired);
    }

    #[tokio::test]
    async fn test_lnurl_withdraw_posts_invoice() {
        let world = MockWorld::new();
        let (swap, data) = ln_swap(&world, false);
        let payload = serde_json::json!({
            "data": SwapData::serialize(&data),
            "signature": {"prefix": "p", "timeout": "1", "signature": "s"},
        });
        world
            .api
            .invoice_statuses
            .lock()
            .unwrap()
            .push_back(paid_status(Some(payload)));

        swap.withdraw_via_lnurl("https://lnurl/cb", "k1value", None)
            .await
            .unwrap();
        let submitted = world.lnurl.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0, "https://lnurl/cb");
        assert_eq!(submitted[0].2, "lnbcrt1invoice");
        assert_eq!(swap.typed_state().await, FromLnState::PrPaid);
    }

    #[tokio::test]
    async fn test_event_routes_by_claim_hash_before_escrow_known() {
        let world = MockWorld::new();
        let ctx = world.context();
        let router = Arc::new(UnifiedSwapEventListener::new(world.storage.clone()));
        let wrapper: Arc<SwapWrapper<FromLnSwap>> =
            SwapWrapper::new(SwapKind::FromLnAuto, ctx, router);
        let (swap, data) = ln_swap(&world, true);
        let claim_hash = data.claim_hash.clone();
        world
            .contract
            .committed_data
            .lock()
            .unwrap()
            .insert(claim_hash.clone(), Arc::new(data.clone()));
        wrapper.track(&swap);

        swap.process_event(&ChainEvent::Initialize {
            escrow_hash: data.escrow_hash.clone(),
            claim_hash,
            txid: Some("committx".into()),
        })
        .await
        .unwrap();
        assert_eq!(swap.typed_state().await, FromLnState::ClaimCommited);
        // The adopted escrow re-keys the record under the real escrow hash.
        let record = swap.serialize().await.unwrap();
        assert_eq!(record["escrowHash"], data.escrow_hash);
    }
}
