//! Smart chain → Bitcoin escrow swaps, on-chain and Lightning payouts.
//!
//! The user locks tokens in an escrow claimable by the LP against proof of
//! the bitcoin payout (a confirmed transaction for on-chain destinations, a
//! revealed pre-image for Lightning). When the LP never pays, the user
//! refunds after the escrow expires.

use crate::api::{PaymentStatusCode, ToBtcQuoteRequest};
use crate::chain::{ChainEvent, EscrowStatus, EscrowType, SignerCapability};
use crate::error::{Error, Result};
use crate::events::SwapEventEmitter;
use crate::swap::escrow::{EscrowDetails, StoredEscrow};
use crate::swap::wrapper::{LpDescriptor, SwapWrapper, VerifyFees, WrapperSwap};
use crate::swap::{
    SWAP_SCHEMA_VERSION, StateCompare, StoredSwapCore, Swap, SwapContext, SwapCore, SwapShared,
    SwapState,
};
use crate::types::{PriceInfo, SwapKind, dec_u64, dec_u128};
use crate::utils::{CancelHandle, cancellable_sleep, now_millis, random_nonce, retry_with_backoff};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How often the LP's payment result is polled after commit.
const PAYMENT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// States of a TO_BTC / TO_LN escrow swap. Declaration order matches the
/// numeric state order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ToBtcState {
    /// The committed escrow was refunded back to the user.
    Refunded = -3,
    /// The quote definitively lapsed unused.
    QuoteExpired = -2,
    QuoteSoftExpired = -1,
    /// Quote accepted, escrow not yet committed.
    Created = 0,
    /// The escrow is live; the LP owes the bitcoin payout.
    Commited = 1,
    /// The LP reported the payout; proof not yet claimed on chain.
    SoftClaimed = 2,
    /// The LP claimed the escrow with the payout proof; swap settled.
    Claimed = 3,
    /// The escrow expired unclaimed; the user may refund.
    Refundable = 4,
}

impl SwapState for ToBtcState {
    fn to_i32(self) -> i32 {
        self as i32
    }

    fn from_i32(value: i32) -> Result<Self> {
        Ok(match value {
            -3 => Self::Refunded,
            -2 => Self::QuoteExpired,
            -1 => Self::QuoteSoftExpired,
            0 => Self::Created,
            1 => Self::Commited,
            2 => Self::SoftClaimed,
            3 => Self::Claimed,
            4 => Self::Refundable,
            other => {
                return Err(Error::Parse(format!("Unknown TO_BTC state {}", other)));
            }
        })
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Refunded | Self::QuoteExpired | Self::Claimed)
    }

    fn is_success(self) -> bool {
        self == Self::Claimed
    }

    fn is_quote_expired(self) -> bool {
        self == Self::QuoteExpired
    }

    fn transitions() -> &'static [(Self, Self)] {
        use ToBtcState::*;
        &[
            (Created, Commited),
            (Created, QuoteSoftExpired),
            (QuoteSoftExpired, QuoteExpired),
            (QuoteSoftExpired, Commited),
            (Commited, SoftClaimed),
            (Commited, Claimed),
            (Commited, Refundable),
            (SoftClaimed, Claimed),
            (SoftClaimed, Refundable),
            (Refundable, Claimed),
            (Refundable, Refunded),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredToBtc {
    #[serde(flatten)]
    core: StoredSwapCore,
    #[serde(flatten)]
    escrow: StoredEscrow,
    /// Bitcoin address or BOLT-11 payment request.
    destination: String,
    payment_hash: String,
    #[serde(with = "dec_u64")]
    btc_amount: u64,
    #[serde(with = "dec_u128")]
    network_fee: u128,
    #[serde(with = "dec_u64")]
    network_fee_btc: u64,
    /// Payout proof: bitcoin txid or revealed pre-image.
    output_proof: Option<String>,
}

struct ToBtcInner {
    core: SwapCore,
    state: ToBtcState,
    escrow: EscrowDetails,
    destination: String,
    payment_hash: String,
    btc_amount: u64,
    network_fee: u128,
    network_fee_btc: u64,
    output_proof: Option<String>,
}

impl ToBtcInner {
    fn to_record(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(StoredToBtc {
            core: self.core.to_stored(self.state.to_i32()),
            escrow: self.escrow.to_stored(),
            destination: self.destination.clone(),
            payment_hash: self.payment_hash.clone(),
            btc_amount: self.btc_amount,
            network_fee: self.network_fee,
            network_fee_btc: self.network_fee_btc,
            output_proof: self.output_proof.clone(),
        })?)
    }
}

/// A TO_BTC or TO_LN escrow swap instance.
pub struct ToBtcSwap {
    id: String,
    kind: SwapKind,
    shared: SwapShared,
    inner: Mutex<ToBtcInner>,
}

impl ToBtcSwap {
    fn new(
        ctx: Arc<SwapContext>,
        emitter: SwapEventEmitter,
        kind: SwapKind,
        inner: ToBtcInner,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: inner.core.id.clone(),
            kind,
            shared: SwapShared::new(ctx, emitter, inner.state.to_i32()),
            inner: Mutex::new(inner),
        })
    }

    async fn save_and_emit(&self, inner: &mut ToBtcInner, state: ToBtcState) -> Result<()> {
        if state != inner.state {
            if inner.state.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "Swap already settled as {:?}",
                    inner.state
                )));
            }
            if !ToBtcState::can_transition(inner.state, state) {
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

    pub async fn typed_state(&self) -> ToBtcState {
        self.inner.lock().await.state
    }

    /// The payout proof once the LP paid: a bitcoin txid for on-chain
    /// destinations, the revealed pre-image for Lightning.
    pub async fn get_output_proof(&self) -> Option<String> {
        self.inner.lock().await.output_proof.clone()
    }

    /// Satoshis the LP pays out at the destination.
    pub async fn get_output_amount(&self) -> u64 {
        self.inner.lock().await.btc_amount
    }

    /// Commit the escrow, locking the quoted token total.
    pub async fn commit(
        &self,
        signer: &dyn SignerCapability,
        cancel: Option<&CancelHandle>,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        if inner.state != ToBtcState::Created {
            return Err(Error::InvalidState(format!(
                "Cannot commit from {:?}",
                inner.state
            )));
        }
        if signer.address() != inner.core.initiator {
            return Err(Error::User("Signer does not match swap initiator".into()));
        }
        if inner.core.is_quote_expired() {
            self.save_and_emit(&mut inner, ToBtcState::QuoteSoftExpired)
                .await?;
            return Err(Error::Expired("Quote expired before commit".into()));
        }
        let signature = inner
            .escrow
            .signature
            .clone()
            .ok_or_else(|| Error::InvalidState("Swap has no init authorization".into()))?;
        let txs = self
            .shared
            .ctx
            .contract
            .txs_init(inner.escrow.data.as_ref(), &signature)
            .await?;
        let txid = self
            .shared
            .ctx
            .contract
            .send_and_confirm(signer, txs, cancel)
            .await?;
        inner.core.initiated = true;
        inner.escrow.commit_txid = Some(txid.clone());
        self.save_and_emit(&mut inner, ToBtcState::Commited).await?;
        Ok(txid)
    }

    async fn apply_payment_status(
        &self,
        inner: &mut ToBtcInner,
        status: crate::api::PaymentStatusResponse,
    ) -> Result<()> {
        match status.code {
            PaymentStatusCode::Paid => {
                inner.output_proof = status.tx_id.or(status.secret);
                if inner.state < ToBtcState::SoftClaimed {
                    self.save_and_emit(inner, ToBtcState::SoftClaimed).await?;
                }
            }
            PaymentStatusCode::RefundAvailable => {
                if matches!(inner.state, ToBtcState::Commited | ToBtcState::SoftClaimed) {
                    self.save_and_emit(inner, ToBtcState::Refundable).await?;
                }
            }
            PaymentStatusCode::NotFound => {
                // Only meaningful once the escrow is expired; checked by the
                // caller.
            }
            _ => {}
        }
        Ok(())
    }

    /// Poll the LP for the payout result. Resolves `true` once the payout
    /// was reported, `false` once the swap became refundable.
    pub async fn wait_for_payment(&self, cancel: Option<&CancelHandle>) -> Result<bool> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                match inner.state {
                    ToBtcState::Claimed | ToBtcState::SoftClaimed => return Ok(true),
                    ToBtcState::Refundable | ToBtcState::Refunded => return Ok(false),
                    ToBtcState::QuoteExpired => {
                        return Err(Error::Expired("Quote expired".into()));
                    }
                    ToBtcState::Commited => {}
                    other => {
                        return Err(Error::InvalidState(format!(
                            "Cannot await payment from {:?}",
                            other
                        )));
                    }
                }
                let status = self
                    .shared
                    .ctx
                    .api
                    .get_payment_status(&inner.core.url, &inner.payment_hash)
                    .await?;
                let code = status.code;
                self.apply_payment_status(&mut inner, status).await?;
                match inner.state {
                    ToBtcState::SoftClaimed => return Ok(true),
                    ToBtcState::Refundable => return Ok(false),
                    _ => {}
                }
                if code == PaymentStatusCode::NotFound
                    && self
                        .shared
                        .ctx
                        .contract
                        .is_expired(&inner.core.initiator, inner.escrow.data.as_ref())
                        .await?
                {
                    self.save_and_emit(&mut inner, ToBtcState::Refundable).await?;
                    return Ok(false);
                }
            }
            cancellable_sleep(PAYMENT_POLL_INTERVAL, cancel).await?;
        }
    }

    /// Refund the expired escrow back to the user.
    pub async fn refund(
        &self,
        signer: &dyn SignerCapability,
        cancel: Option<&CancelHandle>,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        if inner.state != ToBtcState::Refundable {
            return Err(Error::InvalidState(format!(
                "Cannot refund from {:?}",
                inner.state
            )));
        }
        if signer.address() != inner.core.initiator {
            return Err(Error::User("Signer does not match swap initiator".into()));
        }
        let txs = self
            .shared
            .ctx
            .contract
            .txs_refund(&signer.address(), inner.escrow.data.as_ref())
            .await?;
        let txid = self
            .shared
            .ctx
            .contract
            .send_and_confirm(signer, txs, cancel)
            .await?;
        inner.escrow.refund_txid = Some(txid.clone());
        self.save_and_emit(&mut inner, ToBtcState::Refunded).await?;
        Ok(txid)
    }

    async fn sync_inner(&self, inner: &mut ToBtcInner) -> Result<bool> {
        let before = inner.state;
        match inner.state {
            ToBtcState::Created | ToBtcState::QuoteSoftExpired => {
                let status = self
                    .shared
                    .ctx
                    .contract
                    .get_commit_status(&inner.core.initiator, inner.escrow.data.as_ref())
                    .await?;
                if matches!(status, EscrowStatus::Committed) {
                    inner.core.initiated = true;
                    self.save_and_emit(inner, ToBtcState::Commited).await?;
                } else if inner.core.is_quote_expired() {
                    if inner.state == ToBtcState::Created {
                        self.save_and_emit(inner, ToBtcState::QuoteSoftExpired).await?;
                    }
                    let definitively_expired = match &inner.escrow.signature {
                        Some(signature) => {
                            self.shared
                                .ctx
                                .contract
                                .is_init_authorization_expired(
                                    inner.escrow.data.as_ref(),
                                    signature,
                                )
                                .await?
                        }
                        None => true,
                    };
                    if definitively_expired {
                        self.save_and_emit(inner, ToBtcState::QuoteExpired).await?;
                    }
                }
            }
            ToBtcState::Commited | ToBtcState::SoftClaimed | ToBtcState::Refundable => {
                let status = self
                    .shared
                    .ctx
                    .contract
                    .get_commit_status(&inner.core.initiator, inner.escrow.data.as_ref())
                    .await?;
                match status {
                    EscrowStatus::Paid { claim_txid } => {
                        if let Some(txid) = claim_txid {
                            inner.escrow.claim_txid = Some(txid);
                        }
                        self.save_and_emit(inner, ToBtcState::Claimed).await?;
                    }
                    EscrowStatus::Expired => {
                        if inner.state != ToBtcState::Refundable {
                            self.save_and_emit(inner, ToBtcState::Refundable).await?;
                        }
                    }
                    EscrowStatus::Refunded => {
                        if inner.state != ToBtcState::Refundable {
                            self.save_and_emit(inner, ToBtcState::Refundable).await?;
                        }
                        self.save_and_emit(inner, ToBtcState::Refunded).await?;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(inner.state != before)
    }
}

#[async_trait]
impl Swap for ToBtcSwap {
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
            || (inner.state == ToBtcState::Created && inner.core.is_quote_expired())
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
        let token_amount = inner
            .escrow
            .data
            .amount()
            .saturating_sub(inner.network_fee);
        let refreshed = self
            .shared
            .ctx
            .prices
            .is_valid_amount_receive(
                &inner.core.chain_identifier,
                inner.btc_amount,
                crate::types::FeeData {
                    sats_base_fee: pricing.sats_base_fee,
                    fee_ppm: pricing.fee_ppm,
                },
                token_amount,
                &inner.escrow.data.token(),
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
impl WrapperSwap for ToBtcSwap {
    fn from_record(
        ctx: Arc<SwapContext>,
        emitter: SwapEventEmitter,
        record: serde_json::Value,
    ) -> Result<Arc<Self>> {
        let stored: StoredToBtc = serde_json::from_value(record)?;
        let kind = stored.core.kind;
        let (core, state) = SwapCore::from_stored(stored.core);
        let inner = ToBtcInner {
            escrow: EscrowDetails::from_stored(ctx.contract.as_ref(), stored.escrow)?,
            state: ToBtcState::from_i32(state)?,
            core,
            destination: stored.destination,
            payment_hash: stored.payment_hash,
            btc_amount: stored.btc_amount,
            network_fee: stored.network_fee,
            network_fee_btc: stored.network_fee_btc,
            output_proof: stored.output_proof,
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
            ToBtcState::Created if inner.core.is_quote_expired() => {
                self.save_and_emit(&mut inner, ToBtcState::QuoteSoftExpired)
                    .await?;
            }
            ToBtcState::Commited | ToBtcState::SoftClaimed => {
                if self
                    .shared
                    .ctx
                    .contract
                    .is_expired(&inner.core.initiator, inner.escrow.data.as_ref())
                    .await?
                {
                    self.save_and_emit(&mut inner, ToBtcState::Refundable).await?;
                }
            }
            _ => {}
        }
        Ok(inner.state != before)
    }

    async fn process_event(self: &Arc<Self>, event: &ChainEvent) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match event {
            ChainEvent::Initialize { txid, .. } => {
                if matches!(
                    inner.state,
                    ToBtcState::Created | ToBtcState::QuoteSoftExpired
                ) {
                    inner.core.initiated = true;
                    inner.escrow.commit_txid = txid.clone();
                    self.save_and_emit(&mut inner, ToBtcState::Commited).await?;
                }
            }
            ChainEvent::Claim { txid, secret, .. } => {
                if !inner.state.is_terminal() {
                    inner.escrow.claim_txid = txid.clone();
                    if inner.output_proof.is_none() {
                        inner.output_proof = secret.clone();
                    }
                    self.save_and_emit(&mut inner, ToBtcState::Claimed).await?;
                }
            }
            ChainEvent::Refund { txid, .. } => {
                if !inner.state.is_terminal() && inner.state >= ToBtcState::Commited {
                    if inner.state != ToBtcState::Refundable {
                        self.save_and_emit(&mut inner, ToBtcState::Refundable).await?;
                    }
                    inner.escrow.refund_txid = txid.clone();
                    self.save_and_emit(&mut inner, ToBtcState::Refunded).await?;
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

impl SwapWrapper<ToBtcSwap> {
    /// Request a TO-side quote and build the verified swap. `destination`
    /// is a bitcoin address for TO_BTC, a BOLT-11 payment request for
    /// TO_LN.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        self: &Arc<Self>,
        signer: &dyn SignerCapability,
        lp: &LpDescriptor,
        destination: &str,
        amount: u128,
        token: &str,
        exact_in: bool,
    ) -> Result<Arc<ToBtcSwap>> {
        let sequence = rand::random::<u64>();
        let request = ToBtcQuoteRequest {
            address: signer.address(),
            destination: destination.to_string(),
            amount,
            token: token.to_string(),
            exact_in,
            sequence,
        };

        let prefetched_price = self.pre_fetch_price(token).await;
        let prefetched_usd = self.pre_fetch_usd_price().await;

        let quote = retry_with_backoff(
            || async {
                if self.kind == SwapKind::ToLn {
                    self.ctx.api.get_to_ln_quote(&lp.url, &request).await
                } else {
                    self.ctx.api.get_to_btc_quote(&lp.url, &request).await
                }
            },
            |e| !e.is_retryable(),
        )
        .await?;

        let data = self.ctx.contract.deserialize_swap_data(quote.data.clone())?;
        if data.offerer() != signer.address() {
            return Err(Error::Intermediary("Caller is not the escrow offerer".into()));
        }
        if data.claimer() != lp.address {
            return Err(Error::Intermediary("LP is not the escrow claimer".into()));
        }
        if !data.is_pay_in() {
            return Err(Error::Intermediary("Escrow is not pay-in".into()));
        }
        if data.amount() != quote.total {
            return Err(Error::Intermediary("Escrow amount does not match total".into()));
        }
        if data.sequence() != sequence {
            return Err(Error::Intermediary("Sequence mismatch".into()));
        }
        let expected_type = if self.kind == SwapKind::ToLn {
            EscrowType::Htlc
        } else {
            EscrowType::Chain
        };
        if data.escrow_type() != expected_type {
            return Err(Error::Intermediary("Wrong escrow type".into()));
        }
        let expiry = now_millis() + 10 * 60 * 1000;

        let pricing = self
            .verify_returned_price(
                true,
                quote.amount,
                quote.total,
                token,
                VerifyFees {
                    sats_base_fee: lp.sats_base_fee,
                    fee_ppm: lp.fee_ppm,
                    network_fee_token: quote.network_fee,
                },
                prefetched_price,
                prefetched_usd,
                None,
            )
            .await?;

        let nonce = random_nonce();
        let core = SwapCore {
            kind: self.kind,
            id: format!("{}{}", data.claim_hash(), nonce),
            escrow_hash: data.escrow_hash(),
            initiator: signer.address(),
            chain_identifier: self.ctx.chain.chain_identifier(),
            url: lp.url.clone(),
            version: SWAP_SCHEMA_VERSION,
            initiated: false,
            exact_in,
            created_at: now_millis(),
            random_nonce: nonce,
            expiry,
            swap_fee: quote.swap_fee,
            swap_fee_btc: quote.swap_fee_btc,
            pricing_info: Some(pricing),
        };
        let swap = ToBtcSwap::new(
            self.ctx.clone(),
            self.emitter.clone(),
            self.kind,
            ToBtcInner {
                core,
                state: ToBtcState::Created,
                escrow: EscrowDetails::new(data, Some(quote.signature_data.clone())),
                destination: destination.to_string(),
                payment_hash: quote.payment_hash.clone(),
                btc_amount: quote.amount,
                network_fee: quote.network_fee,
                network_fee_btc: quote.network_fee_btc,
                output_proof: None,
            },
        );
        self.track(&swap);
        Ok(swap)
    }
}
