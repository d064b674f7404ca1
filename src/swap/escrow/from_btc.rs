//! On-chain BTC → smart chain escrow swap.
//!
//! The LP locks tokens in an escrow claimable against a confirmed bitcoin
//! payment; the user commits the escrow init, pays the quoted bitcoin
//! address, and claims (or lets a watchtower claim) once the payment
//! confirms.

use crate::api::FromBtcQuoteRequest;
use crate::chain::{
    BtcTxProof, ChainEvent, EscrowStatus, EscrowType, SignerCapability, wait_for_address_txo,
};
use crate::error::{Error, Result};
use crate::events::SwapEventEmitter;
use crate::swap::escrow::{
    EscrowDetails, StoredEscrow, expected_claimer_bounty, infer_required_confirmations,
    locking_script,
};
use crate::swap::wrapper::{LpDescriptor, SwapWrapper, VerifyFees, WrapperSwap};
use crate::swap::{
    SWAP_SCHEMA_VERSION, StateCompare, StoredSwapCore, Swap, SwapContext, SwapCore, SwapShared,
    SwapState,
};
use crate::types::{PriceInfo, SwapKind, dec_u64};
use crate::utils::{CancelHandle, cancellable, now_millis, random_nonce, retry_with_backoff};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// States of a FROM_BTC escrow swap. Declaration order matches the numeric
/// state order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum FromBtcState {
    /// The LP refunded the expired escrow; nothing left to do.
    Failed = -4,
    /// The on-chain escrow expired before the claim.
    Expired = -3,
    /// The quote lapsed, verified against the init authorization.
    QuoteExpired = -2,
    /// The quote's expiry passed; awaiting definitive verification.
    QuoteSoftExpired = -1,
    /// Quote accepted, escrow not yet committed.
    PrCreated = 0,
    /// The escrow init is confirmed on the smart chain.
    ClaimCommited = 1,
    /// The bitcoin payment reached its required confirmations.
    BtcTxConfirmed = 2,
    /// Escrow claimed; swap settled.
    ClaimClaimed = 3,
}

impl SwapState for FromBtcState {
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
            1 => Self::ClaimCommited,
            2 => Self::BtcTxConfirmed,
            3 => Self::ClaimClaimed,
            other => {
                return Err(Error::Parse(format!("Unknown FROM_BTC state {}", other)));
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
        use FromBtcState::*;
        &[
            (PrCreated, ClaimCommited),
            (PrCreated, QuoteSoftExpired),
            (QuoteSoftExpired, QuoteExpired),
            (QuoteSoftExpired, ClaimCommited),
            (ClaimCommited, BtcTxConfirmed),
            (ClaimCommited, ClaimClaimed),
            (ClaimCommited, Expired),
            (BtcTxConfirmed, ClaimClaimed),
            (BtcTxConfirmed, Expired),
            (Expired, Failed),
        ]
    }
}

/// Kind-specific persisted fields next to the common core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredFromBtc {
    #[serde(flatten)]
    core: StoredSwapCore,
    #[serde(flatten)]
    escrow: StoredEscrow,
    btc_address: String,
    #[serde(with = "dec_u64")]
    btc_amount: u64,
    required_confirmations: Option<u32>,
    btc_txid: Option<String>,
    btc_vout: Option<u32>,
}

struct FromBtcInner {
    core: SwapCore,
    state: FromBtcState,
    escrow: EscrowDetails,
    btc_address: String,
    btc_amount: u64,
    required_confirmations: Option<u32>,
    btc_txid: Option<String>,
    btc_vout: Option<u32>,
}

impl FromBtcInner {
    fn to_record(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(StoredFromBtc {
            core: self.core.to_stored(self.state.to_i32()),
            escrow: self.escrow.to_stored(),
            btc_address: self.btc_address.clone(),
            btc_amount: self.btc_amount,
            required_confirmations: self.required_confirmations,
            btc_txid: self.btc_txid.clone(),
            btc_vout: self.btc_vout,
        })?)
    }
}

/// A FROM_BTC escrow swap instance.
pub struct FromBtcSwap {
    id: String,
    shared: SwapShared,
    inner: Mutex<FromBtcInner>,
}

impl FromBtcSwap {
    fn new(ctx: Arc<SwapContext>, emitter: SwapEventEmitter, inner: FromBtcInner) -> Arc<Self> {
        Arc::new(Self {
            id: inner.core.id.clone(),
            shared: SwapShared::new(ctx, emitter, inner.state.to_i32()),
            inner: Mutex::new(inner),
        })
    }

    /// Apply a state transition, persist, then emit. Terminal states are
    /// absorbing; transitions outside the graph are rejected.
    async fn save_and_emit(&self, inner: &mut FromBtcInner, state: FromBtcState) -> Result<()> {
        if state != inner.state {
            if inner.state.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "Swap already settled as {:?}",
                    inner.state
                )));
            }
            if !FromBtcState::can_transition(inner.state, state) {
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

    pub async fn typed_state(&self) -> FromBtcState {
        self.inner.lock().await.state
    }

    /// The bitcoin address and amount the user must pay once committed.
    pub async fn get_bitcoin_payment(&self) -> (String, u64) {
        let inner = self.inner.lock().await;
        (inner.btc_address.clone(), inner.btc_amount)
    }

    pub async fn get_commit_txid(&self) -> Option<String> {
        self.inner.lock().await.escrow.commit_txid.clone()
    }

    pub async fn get_claim_txid(&self) -> Option<String> {
        self.inner.lock().await.escrow.claim_txid.clone()
    }

    /// Submit the escrow init transaction. The signer must be the swap's
    /// initiator.
    pub async fn commit(
        &self,
        signer: &dyn SignerCapability,
        cancel: Option<&CancelHandle>,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        if inner.state != FromBtcState::PrCreated {
            return Err(Error::InvalidState(format!(
                "Cannot commit from {:?}",
                inner.state
            )));
        }
        if signer.address() != inner.core.initiator {
            return Err(Error::User("Signer does not match swap initiator".into()));
        }
        if inner.core.is_quote_expired() {
            self.save_and_emit(&mut inner, FromBtcState::QuoteSoftExpired)
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
        self.save_and_emit(&mut inner, FromBtcState::ClaimCommited)
            .await?;
        Ok(txid)
    }

    /// Watch bitcoin for the expected payment until it reaches the required
    /// confirmations.
    pub async fn wait_for_bitcoin_transaction(
        &self,
        cancel: Option<&CancelHandle>,
    ) -> Result<String> {
        let (address, amount, script, claim_hash, state) = {
            let inner = self.inner.lock().await;
            (
                inner.btc_address.clone(),
                inner.btc_amount,
                locking_script(&inner.btc_address, self.shared.ctx.btc_network)?,
                inner.escrow.data.claim_hash(),
                inner.state,
            )
        };
        if state != FromBtcState::ClaimCommited {
            return Err(Error::InvalidState(format!(
                "Cannot await payment from {:?}",
                state
            )));
        }

        let confirmations = {
            let inner = self.inner.lock().await;
            inner.required_confirmations
        };
        let confirmations = match confirmations {
            Some(c) => c,
            None => infer_required_confirmations(
                self.shared.ctx.contract.as_ref(),
                &script,
                amount,
                &claim_hash,
            )
            .ok_or_else(|| {
                Error::Intermediary("Claim hash does not commit to the quoted output".into())
            })?,
        };

        let (utxo, _tx) = wait_for_address_txo(
            self.shared.ctx.btc_rpc.as_ref(),
            &address,
            confirmations,
            |utxo| utxo.value == amount,
            cancel,
        )
        .await?;

        let mut inner = self.inner.lock().await;
        inner.required_confirmations = Some(confirmations);
        inner.btc_txid = Some(utxo.txid.clone());
        inner.btc_vout = Some(utxo.vout);
        if inner.state == FromBtcState::ClaimCommited {
            self.save_and_emit(&mut inner, FromBtcState::BtcTxConfirmed)
                .await?;
        }
        Ok(utxo.txid)
    }

    /// Claim the escrow against the confirmed bitcoin payment.
    ///
    /// A failure while the contract already shows the escrow paid (a
    /// watchtower won the race) is silently upgraded to settled.
    pub async fn claim(
        &self,
        signer: &dyn SignerCapability,
        cancel: Option<&CancelHandle>,
    ) -> Result<String> {
        let mut inner = self.inner.lock().await;
        if inner.state != FromBtcState::BtcTxConfirmed {
            return Err(Error::InvalidState(format!(
                "Cannot claim from {:?}",
                inner.state
            )));
        }
        let btc_txid = inner
            .btc_txid
            .clone()
            .ok_or_else(|| Error::InvalidState("No bitcoin payment recorded".into()))?;
        let vout = inner.btc_vout.unwrap_or(0);
        let confirmations = inner.required_confirmations.unwrap_or(1);
        let data = inner.escrow.data.clone();

        let ctx = &self.shared.ctx;
        let claim_attempt = async {
            let tx = ctx
                .btc_rpc
                .get_transaction(&btc_txid)
                .await?
                .ok_or_else(|| Error::Bitcoin(format!("Payment {} disappeared", btc_txid)))?;
            let proof = BtcTxProof {
                blockhash: tx.blockhash.clone().unwrap_or_default(),
                confirmations: tx.confirmations,
                txid: tx.txid.clone(),
                hex: tx.hex.clone(),
                height: tx.block_height.unwrap_or(0),
            };
            let txs = ctx
                .contract
                .txs_claim_with_tx_data(
                    &signer.address(),
                    data.as_ref(),
                    &proof,
                    confirmations,
                    vout,
                    ctx.synchronizer.as_deref(),
                )
                .await?;
            ctx.contract.send_and_confirm(signer, txs, cancel).await
        };

        match claim_attempt.await {
            Ok(txid) => {
                inner.escrow.claim_txid = Some(txid.clone());
                self.save_and_emit(&mut inner, FromBtcState::ClaimClaimed)
                    .await?;
                Ok(txid)
            }
            Err(claim_err) => {
                let status = self
                    .shared
                    .ctx
                    .contract
                    .get_commit_status(&inner.core.initiator, inner.escrow.data.as_ref())
                    .await?;
                if let EscrowStatus::Paid { claim_txid } = status {
                    inner.escrow.claim_txid = claim_txid.clone();
                    self.save_and_emit(&mut inner, FromBtcState::ClaimClaimed)
                        .await?;
                    return Ok(claim_txid.unwrap_or_default());
                }
                Err(claim_err)
            }
        }
    }

    /// Drive the swap to settlement: await the bitcoin payment, then give
    /// the watchtowers a bounded window before handing the claim back to the
    /// caller.
    ///
    /// Returns `true` when settlement was observed; `false` only when the
    /// automatic-settlement window lapsed and the caller should `claim()`.
    pub async fn execute(&self, cancel: Option<&CancelHandle>) -> Result<bool> {
        let state = self.typed_state().await;
        if state.is_terminal() {
            return if state.is_success() {
                Ok(true)
            } else {
                Err(Error::InvalidState(format!("Swap failed as {:?}", state)))
            };
        }
        if state == FromBtcState::ClaimCommited {
            self.wait_for_bitcoin_transaction(cancel).await?;
        }

        let waited = cancellable(
            async {
                tokio::time::timeout(
                    self.shared.ctx.options.max_wait_till_automatic_settlement,
                    self.shared.wait_till_state(
                        FromBtcState::ClaimClaimed.to_i32(),
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

    async fn sync_inner(&self, inner: &mut FromBtcInner) -> Result<bool> {
        let before = inner.state;
        match inner.state {
            FromBtcState::PrCreated | FromBtcState::QuoteSoftExpired => {
                let status = self
                    .shared
                    .ctx
                    .contract
                    .get_commit_status(&inner.core.initiator, inner.escrow.data.as_ref())
                    .await?;
                match status {
                    EscrowStatus::Committed => {
                        inner.core.initiated = true;
                        self.save_and_emit(inner, FromBtcState::ClaimCommited).await?;
                    }
                    _ => {
                        if inner.core.is_quote_expired() {
                            if inner.state == FromBtcState::PrCreated {
                                self.save_and_emit(inner, FromBtcState::QuoteSoftExpired)
                                    .await?;
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
                                self.save_and_emit(inner, FromBtcState::QuoteExpired).await?;
                            }
                        }
                    }
                }
            }
            FromBtcState::ClaimCommited | FromBtcState::BtcTxConfirmed => {
                let status = self
                    .shared
                    .ctx
                    .contract
                    .get_commit_status(&inner.core.initiator, inner.escrow.data.as_ref())
                    .await?;
                match status {
                    EscrowStatus::Paid { claim_txid } => {
                        inner.escrow.claim_txid = claim_txid;
                        self.save_and_emit(inner, FromBtcState::ClaimClaimed).await?;
                    }
                    EscrowStatus::Expired => {
                        self.save_and_emit(inner, FromBtcState::Expired).await?;
                    }
                    EscrowStatus::Refunded | EscrowStatus::NotCommitted => {
                        self.save_and_emit(inner, FromBtcState::Expired).await?;
                        self.save_and_emit(inner, FromBtcState::Failed).await?;
                    }
                    EscrowStatus::Committed => {}
                }
            }
            FromBtcState::Expired => {
                let status = self
                    .shared
                    .ctx
                    .contract
                    .get_commit_status(&inner.core.initiator, inner.escrow.data.as_ref())
                    .await?;
                if matches!(
                    status,
                    EscrowStatus::Refunded | EscrowStatus::NotCommitted
                ) {
                    self.save_and_emit(inner, FromBtcState::Failed).await?;
                }
            }
            _ => {}
        }
        Ok(inner.state != before)
    }
}

#[async_trait]
impl Swap for FromBtcSwap {
    fn kind(&self) -> SwapKind {
        SwapKind::FromBtc
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
            || (inner.state == FromBtcState::PrCreated && inner.core.is_quote_expired())
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
        let refreshed = self
            .shared
            .ctx
            .prices
            .is_valid_amount_send(
                &inner.core.chain_identifier,
                inner.btc_amount,
                crate::types::FeeData {
                    sats_base_fee: pricing.sats_base_fee,
                    fee_ppm: pricing.fee_ppm,
                },
                inner.escrow.data.amount(),
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
impl WrapperSwap for FromBtcSwap {
    fn from_record(
        ctx: Arc<SwapContext>,
        emitter: SwapEventEmitter,
        record: serde_json::Value,
    ) -> Result<Arc<Self>> {
        let stored: StoredFromBtc = serde_json::from_value(record)?;
        let (core, state) = SwapCore::from_stored(stored.core);
        let inner = FromBtcInner {
            escrow: EscrowDetails::from_stored(ctx.contract.as_ref(), stored.escrow)?,
            state: FromBtcState::from_i32(state)?,
            core,
            btc_address: stored.btc_address,
            btc_amount: stored.btc_amount,
            required_confirmations: stored.required_confirmations,
            btc_txid: stored.btc_txid,
            btc_vout: stored.btc_vout,
        };
        Ok(Self::new(ctx, emitter, inner))
    }

    async fn sync(self: &Arc<Self>, _save: bool) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        self.sync_inner(&mut inner).await
    }

    async fn tick_swap(self: &Arc<Self>, _save: bool) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.state;
        match inner.state {
            FromBtcState::PrCreated if inner.core.is_quote_expired() => {
                self.save_and_emit(&mut inner, FromBtcState::QuoteSoftExpired)
                    .await?;
            }
            FromBtcState::ClaimCommited | FromBtcState::BtcTxConfirmed => {
                if self
                    .shared
                    .ctx
                    .contract
                    .is_expired(&inner.core.initiator, inner.escrow.data.as_ref())
                    .await?
                {
                    self.save_and_emit(&mut inner, FromBtcState::Expired).await?;
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
                    FromBtcState::PrCreated | FromBtcState::QuoteSoftExpired
                ) {
                    inner.core.initiated = true;
                    inner.escrow.commit_txid = txid.clone();
                    self.save_and_emit(&mut inner, FromBtcState::ClaimCommited)
                        .await?;
                }
            }
            ChainEvent::Claim { txid, .. } => {
                if !inner.state.is_terminal() {
                    inner.escrow.claim_txid = txid.clone();
                    self.save_and_emit(&mut inner, FromBtcState::ClaimClaimed)
                        .await?;
                }
            }
            ChainEvent::Refund { .. } => {
                if !inner.state.is_terminal() {
                    self.save_and_emit(&mut inner, FromBtcState::Expired).await?;
                    self.save_and_emit(&mut inner, FromBtcState::Failed).await?;
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

impl SwapWrapper<FromBtcSwap> {
    /// Request a FROM_BTC quote from the LP and build the verified swap.
    ///
    /// The swap is uninitiated until [`FromBtcSwap::commit`]; it lives only
    /// in the weakly-referenced pending index until then.
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
    ) -> Result<Arc<FromBtcSwap>> {
        let sequence = rand::random::<u64>();
        let request = FromBtcQuoteRequest {
            address: signer.address(),
            amount,
            token: token.to_string(),
            exact_in,
            sequence,
            deposit_token: deposit_token.to_string(),
            gas_amount,
        };

        let prefetched_price = self.pre_fetch_price(token).await;
        let prefetched_usd = self.pre_fetch_usd_price().await;

        let quote = retry_with_backoff(
            || self.ctx.api.get_from_btc_quote(&lp.url, &request),
            |e| !e.is_retryable(),
        )
        .await?;

        let data = self.ctx.contract.deserialize_swap_data(quote.data.clone())?;
        let script = locking_script(&quote.btc_address, self.ctx.btc_network)?;

        // Full quote verification; any mismatch is a semantic LP rejection.
        let confirmations = match quote.confirmations {
            Some(confs) => {
                let expected =
                    self.ctx
                        .contract
                        .get_hash_for_onchain(&script, quote.amount, confs);
                if hex::encode(expected) != data.claim_hash() {
                    return Err(Error::Intermediary(
                        "Claim hash does not commit to the quoted output".into(),
                    ));
                }
                confs
            }
            None => infer_required_confirmations(
                self.ctx.contract.as_ref(),
                &script,
                quote.amount,
                &data.claim_hash(),
            )
            .ok_or_else(|| {
                Error::Intermediary("Claim hash does not commit to the quoted output".into())
            })?,
        };

        let expected_bounty = expected_claimer_bounty(&self.ctx.options);
        if data.claimer_bounty() != expected_bounty {
            return Err(Error::Intermediary(format!(
                "Claimer bounty {} does not match expected {}",
                data.claimer_bounty(),
                expected_bounty
            )));
        }
        let expected_extra =
            self.ctx
                .contract
                .get_extra_data(&script, quote.amount, sequence);
        if quote.extra_data != hex::encode(expected_extra) {
            return Err(Error::Intermediary("Extra data mismatch".into()));
        }
        if data.sequence() != sequence {
            return Err(Error::Intermediary("Sequence mismatch".into()));
        }
        if data.offerer() != lp.address {
            return Err(Error::Intermediary("LP is not the escrow offerer".into()));
        }
        if data.claimer() != signer.address() {
            return Err(Error::Intermediary("Caller is not the escrow claimer".into()));
        }
        if data.deposit_token() != deposit_token {
            return Err(Error::Intermediary("Deposit token mismatch".into()));
        }
        if data.has_success_action() {
            return Err(Error::Intermediary("Unexpected success action".into()));
        }
        if data.escrow_type() != EscrowType::Chain {
            return Err(Error::Intermediary("Wrong escrow type".into()));
        }
        let now = now_millis();
        if quote.expiry < now + self.ctx.options.min_send_window.as_millis() as u64 {
            return Err(Error::Intermediary("Send window too short".into()));
        }

        let pricing = self
            .verify_returned_price(
                false,
                quote.amount,
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
            kind: SwapKind::FromBtc,
            id: format!("{}{}", data.claim_hash(), nonce),
            escrow_hash: data.escrow_hash(),
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
        let swap = FromBtcSwap::new(
            self.ctx.clone(),
            self.emitter.clone(),
            FromBtcInner {
                core,
                state: FromBtcState::PrCreated,
                escrow: EscrowDetails::new(data, Some(quote.signature_data.clone())),
                btc_address: quote.btc_address.clone(),
                btc_amount: quote.amount,
                required_confirmations: Some(confirmations),
                btc_txid: None,
                btc_vout: None,
            },
        );
        self.track(&swap);
        Ok(swap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SignatureData;
    use crate::events::UnifiedSwapEventListener;
    use crate::testutil::*;
    use crate::types::BtcUtxo;

    const USER: &str = "0xUSER";
    const LP: &str = "0xLP";

    fn lp() -> LpDescriptor {
        LpDescriptor {
            url: "http://lp".into(),
            address: LP.into(),
            sats_base_fee: 0,
            fee_ppm: 0,
        }
    }

    fn signature() -> SignatureData {
        SignatureData {
            prefix: "claim".into(),
            timeout: "99999999999".into(),
            signature: "deadbeef".into(),
        }
    }

    /// A consistent quote+escrow pair against the mock contract's hash
    /// functions and the 10_000 usat/unit oracle. The mock LP echoes the
    /// request's sequence and claimer into the escrow data.
    fn quote() -> crate::api::FromBtcQuoteResponse {
        let btc_address = test_btc_address(1);
        let script = locking_script(&btc_address, bitcoin::Network::Regtest).unwrap();
        let amount: u64 = 100_000;
        // 100_000 sats at 10_000 usat/unit -> 10_000_000 base units.
        let total: u128 = 10_000_000;
        let confirmations = 3;
        let claim_hash = MockEscrowContract::onchain_hash(&script, amount, confirmations);
        let data = MockSwapData {
            claimer: USER.into(),
            offerer: LP.into(),
            amount: total,
            claim_hash: claim_hash.clone(),
            escrow_hash: sha256_hex(claim_hash.as_bytes()),
            ..MockSwapData::default()
        };
        crate::api::FromBtcQuoteResponse {
            btc_address,
            amount,
            total,
            swap_fee: 100,
            swap_fee_btc: Some(1),
            confirmations: Some(confirmations),
            extra_data: String::new(),
            expiry: now_millis() + 3_600_000,
            data: crate::chain::SwapData::serialize(&data),
            signature_data: signature(),
        }
    }

    async fn wrapper_for(world: &MockWorld) -> Arc<SwapWrapper<FromBtcSwap>> {
        let ctx = world.context();
        let router = Arc::new(UnifiedSwapEventListener::new(world.storage.clone()));
        SwapWrapper::new(SwapKind::FromBtc, ctx, router)
    }

    async fn create_prepared(
        world: &MockWorld,
        wrapper: &Arc<SwapWrapper<FromBtcSwap>>,
    ) -> Arc<FromBtcSwap> {
        *world.api.from_btc_quote.lock().unwrap() = Some(quote());
        wrapper
            .create(&MockSigner(USER.into()), &lp(), 100_000, MOCK_TOKEN, true, 0, MOCK_GAS_TOKEN)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_verifies_quote() {
        let world = MockWorld::new();
        let wrapper = wrapper_for(&world).await;
        let swap = create_prepared(&world, &wrapper).await;
        assert_eq!(swap.typed_state().await, FromBtcState::PrCreated);
        assert!(!swap.is_initiated().await);
        // Uninitiated swaps are never persisted.
        assert_eq!(world.storage.len(), 0);
        assert!(swap.has_valid_price().await);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_claim_hash() {
        let world = MockWorld::new();
        let wrapper = wrapper_for(&world).await;
        let mut quote = quote();
        quote.amount += 1; // breaks H(script ∥ amount ∥ confs)
        *world.api.from_btc_quote.lock().unwrap() = Some(quote);
        let res = wrapper
            .create(&MockSigner(USER.into()), &lp(), 100_000, MOCK_TOKEN, true, 0, MOCK_GAS_TOKEN)
            .await;
        assert!(matches!(res, Err(Error::Intermediary(_))));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_price() {
        let world = MockWorld::new();
        let wrapper = wrapper_for(&world).await;
        let mut quote = quote();
        // LP keeps 50% of the fair amount; claim hash must stay consistent,
        // so only the token total changes.
        quote.total /= 2;
        if let Ok(mut data) = serde_json::from_value::<MockSwapData>(quote.data.clone()) {
            data.amount = quote.total;
            quote.data = crate::chain::SwapData::serialize(&data);
        }
        *world.api.from_btc_quote.lock().unwrap() = Some(quote);
        let res = wrapper
            .create(&MockSigner(USER.into()), &lp(), 100_000, MOCK_TOKEN, true, 0, MOCK_GAS_TOKEN)
            .await;
        match res {
            Err(Error::Intermediary(msg)) => assert_eq!(msg, "Fee too high"),
            other => panic!("expected fee rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_commit_then_confirm_then_claim() {
        let world = MockWorld::new();
        let wrapper = wrapper_for(&world).await;
        let swap = create_prepared(&world, &wrapper).await;

        let txid = swap.commit(&MockSigner(USER.into()), None).await.unwrap();
        assert!(!txid.is_empty());
        assert_eq!(swap.typed_state().await, FromBtcState::ClaimCommited);
        assert!(swap.is_initiated().await);
        // Initiated swaps persist.
        assert_eq!(world.storage.len(), 1);

        // Pay the quoted address with the exact amount, 3 confs.
        let (address, amount) = swap.get_bitcoin_payment().await;
        world.btc_rpc.add_utxo(
            &address,
            BtcUtxo {
                txid: "payment".into(),
                vout: 1,
                value: amount,
            },
        );
        world.btc_rpc.add_tx(crate::chain::BtcTx {
            txid: "payment".into(),
            hex: String::new(),
            confirmations: 3,
            block_height: Some(100),
            blockhash: Some("hash".into()),
            outs: vec![],
            ins: vec![],
        });
        let btc_txid = swap.wait_for_bitcoin_transaction(None).await.unwrap();
        assert_eq!(btc_txid, "payment");
        assert_eq!(swap.typed_state().await, FromBtcState::BtcTxConfirmed);

        let claim_txid = swap.claim(&MockSigner(USER.into()), None).await.unwrap();
        assert!(!claim_txid.is_empty());
        assert_eq!(swap.typed_state().await, FromBtcState::ClaimClaimed);
        assert!(swap.is_successful().await);
        let sent = world.contract.sent.lock().unwrap();
        assert_eq!(sent[0].0, "init");
        assert_eq!(sent[1].0, "claimTxData");
    }

    #[tokio::test]
    async fn test_commit_rejects_wrong_signer() {
        let world = MockWorld::new();
        let wrapper = wrapper_for(&world).await;
        let swap = create_prepared(&world, &wrapper).await;
        let res = swap.commit(&MockSigner("0xOTHER".into()), None).await;
        assert!(matches!(res, Err(Error::User(_))));
    }

    #[tokio::test]
    async fn test_claim_upgrades_when_watchtower_won() {
        let world = MockWorld::new();
        let wrapper = wrapper_for(&world).await;
        let swap = create_prepared(&world, &wrapper).await;
        swap.commit(&MockSigner(USER.into()), None).await.unwrap();

        let escrow_hash = {
            let inner = swap.inner.lock().await;
            inner.escrow.data.escrow_hash()
        };
        // Watchtower already claimed on chain; local claim will fail on the
        // missing bitcoin tx, then discover the PAID status.
        world.contract.set_status(
            &escrow_hash,
            EscrowStatus::Paid {
                claim_txid: Some("watchtower".into()),
            },
        );
        {
            let mut inner = swap.inner.lock().await;
            inner.btc_txid = Some("missing".into());
            inner.btc_vout = Some(0);
            let state = FromBtcState::BtcTxConfirmed;
            inner.state = state;
        }
        let txid = swap.claim(&MockSigner(USER.into()), None).await.unwrap();
        assert_eq!(txid, "watchtower");
        assert_eq!(swap.typed_state().await, FromBtcState::ClaimClaimed);
    }

    #[tokio::test]
    async fn test_soft_then_hard_expiry_removes_record() {
        let world = MockWorld::new();
        let wrapper = wrapper_for(&world).await;
        let swap = create_prepared(&world, &wrapper).await;

        // Commit so the record persists, then force past expiry.
        swap.commit(&MockSigner(USER.into()), None).await.unwrap();
        {
            let mut inner = swap.inner.lock().await;
            inner.core.expiry = now_millis() - 1_000;
            inner.state = FromBtcState::PrCreated;
            inner.core.initiated = true;
        }
        assert!(swap.tick_swap(true).await.unwrap());
        assert_eq!(swap.typed_state().await, FromBtcState::QuoteSoftExpired);
        assert_eq!(world.storage.len(), 1);

        // Hard expiry confirmed by the init-authorization check.
        let escrow_hash = {
            let inner = swap.inner.lock().await;
            inner.escrow.data.escrow_hash()
        };
        world
            .contract
            .init_auth_expired
            .lock()
            .unwrap()
            .insert(escrow_hash);
        assert!(swap.sync(true).await.unwrap());
        assert_eq!(swap.typed_state().await, FromBtcState::QuoteExpired);
        // Quote-expired records are removed rather than saved.
        assert_eq!(world.storage.len(), 0);
    }

    #[tokio::test]
    async fn test_terminal_states_are_sinks() {
        for terminal in [
            FromBtcState::Failed,
            FromBtcState::QuoteExpired,
            FromBtcState::ClaimClaimed,
        ] {
            assert!(
                !FromBtcState::transitions()
                    .iter()
                    .any(|(from, _)| *from == terminal),
                "terminal {:?} has outgoing transition",
                terminal
            );
        }
    }

    #[tokio::test]
    async fn test_serialize_roundtrip() {
        let world = MockWorld::new();
        let wrapper = wrapper_for(&world).await;
        let swap = create_prepared(&world, &wrapper).await;
        swap.commit(&MockSigner(USER.into()), None).await.unwrap();

        let record = swap.serialize().await.unwrap();
        assert_eq!(record["type"], "FROM_BTC");
        let restored = FromBtcSwap::from_record(
            world.context(),
            SwapEventEmitter::new(),
            record.clone(),
        )
        .unwrap();
        assert_eq!(restored.id(), swap.id());
        assert_eq!(restored.serialize().await.unwrap(), record);
        assert_eq!(restored.typed_state().await, FromBtcState::ClaimCommited);
    }

    #[tokio::test]
    async fn test_refund_event_fails_swap() {
        let world = MockWorld::new();
        let wrapper = wrapper_for(&world).await;
        let swap = create_prepared(&world, &wrapper).await;
        swap.commit(&MockSigner(USER.into()), None).await.unwrap();

        let escrow_hash = {
            let inner = swap.inner.lock().await;
            inner.escrow.data.escrow_hash()
        };
        swap.process_event(&ChainEvent::Refund {
            escrow_hash,
            claim_hash: String::new(),
            txid: Some("refundtx".into()),
        })
        .await
        .unwrap();
        assert_eq!(swap.typed_state().await, FromBtcState::Failed);
    }
}
