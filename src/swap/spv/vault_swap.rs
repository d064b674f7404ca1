//! The SPV-vault BTC → smart chain swap state machine.

use crate::api::{FromBtcQuoteRequest, SpvQuoteResponse};
use crate::chain::{ChainEvent, SpvWithdrawalState, wait_for_address_txo};
use crate::error::{Error, Result};
use crate::events::SwapEventEmitter;
use crate::swap::escrow::locking_script;
use crate::swap::spv::psbt::{
    SpvPsbtParams, StoredSwapWallet, SwapBitcoinWallet, build_spv_psbt, estimate_vsize,
    exact_funding_fee, expected_network_fee, fund_psbt_with_exact_utxos,
};
use crate::swap::wrapper::{LpDescriptor, SwapWrapper, VerifyFees, WrapperSwap};
use crate::swap::{
    SWAP_SCHEMA_VERSION, StateCompare, StoredSwapCore, Swap, SwapContext, SwapCore, SwapShared,
    SwapState,
};
use crate::types::{BtcUtxo, PriceInfo, SwapKind, dec_u64, dec_u64_opt, dec_u128};
use crate::utils::{CancelHandle, cancellable_sleep, now_millis, random_nonce, retry_with_backoff};
use async_trait::async_trait;
use bitcoin::ScriptBuf;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How often the settlement watchdog polls the contract.
const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Bitcoin state is re-synchronized this many ticks apart while the
/// transaction is in flight.
const BTC_RESYNC_TICKS: u32 = 120;

/// States of an SPV-vault swap. Declaration order matches the numeric state
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum SpvFromBtcState {
    /// The contract rejected the withdrawal.
    Closed = -5,
    /// A funded input was double-spent.
    Failed = -4,
    /// The LP declined to co-sign the PSBT.
    Declined = -3,
    QuoteExpired = -2,
    QuoteSoftExpired = -1,
    /// Quote accepted, transaction not yet signed.
    Created = 0,
    /// The withdrawal transaction is signed and verified locally.
    Signed = 1,
    /// The LP accepted the PSBT.
    Posted = 2,
    /// The transaction is visible on the bitcoin network.
    Broadcasted = 3,
    /// The transaction reached the vault's required confirmations.
    BtcTxConfirmed = 4,
    /// A watchtower fronted the destination settlement; swap settled.
    Fronted = 5,
    /// A watchtower claimed the withdrawal after confirmations; swap
    /// settled.
    Claimed = 6,
}

impl SwapState for SpvFromBtcState {
    fn to_i32(self) -> i32 {
        self as i32
    }

    fn from_i32(value: i32) -> Result<Self> {
        Ok(match value {
            -5 => Self::Closed,
            -4 => Self::Failed,
            -3 => Self::Declined,
            -2 => Self::QuoteExpired,
            -1 => Self::QuoteSoftExpired,
            0 => Self::Created,
            1 => Self::Signed,
            2 => Self::Posted,
            3 => Self::Broadcasted,
            4 => Self::BtcTxConfirmed,
            5 => Self::Fronted,
            6 => Self::Claimed,
            other => {
                return Err(Error::Parse(format!(
                    "Unknown SPV_VAULT_FROM_BTC state {}",
                    other
                )));
            }
        })
    }

    fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Closed
                | Self::Failed
                | Self::Declined
                | Self::QuoteExpired
                | Self::Fronted
                | Self::Claimed
        )
    }

    fn is_success(self) -> bool {
        matches!(self, Self::Fronted | Self::Claimed)
    }

    fn is_quote_expired(self) -> bool {
        self == Self::QuoteExpired
    }

    fn transitions() -> &'static [(Self, Self)] {
        use SpvFromBtcState::*;
        &[
            (Created, Signed),
            (Created, QuoteSoftExpired),
            (QuoteSoftExpired, QuoteExpired),
            (Signed, Posted),
            (Signed, Declined),
            (Signed, Failed),
            (Posted, Broadcasted),
            (Posted, BtcTxConfirmed),
            (Posted, Fronted),
            (Posted, Claimed),
            (Posted, Closed),
            (Posted, Failed),
            (Broadcasted, BtcTxConfirmed),
            (Broadcasted, Fronted),
            (Broadcasted, Claimed),
            (Broadcasted, Closed),
            (Broadcasted, Failed),
            (BtcTxConfirmed, Fronted),
            (BtcTxConfirmed, Claimed),
            (BtcTxConfirmed, Closed),
        ]
    }
}

/// How the withdrawal gets its funding inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SpvWalletMode {
    /// An external wallet adapter funds and signs.
    External,
    /// The SDK generates a one-shot deposit address and waits for the
    /// payment to arrive there.
    WaitPayment,
    /// The one-shot wallet's current UTXO snapshot is spent as-is.
    Prefunded,
}

/// The quote fields the swap keeps verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSpvQuote {
    quote_id: String,
    vault_owner: String,
    #[serde(with = "dec_u64")]
    vault_id: u64,
    vault_required_confirmations: u32,
    vault_token_multipliers: Vec<String>,
    vault_btc_address: String,
    vault_utxo: String,
    #[serde(with = "dec_u64")]
    vault_utxo_value: u64,
    btc_destination_address: String,
    #[serde(with = "dec_u64")]
    btc_amount: u64,
    #[serde(with = "dec_u64")]
    btc_amount_swap: u64,
    #[serde(with = "dec_u64")]
    btc_amount_gas: u64,
    #[serde(with = "dec_u64")]
    minimum_btc_fee_rate: u64,
    #[serde(with = "dec_u128")]
    output_total_swap: u128,
    output_swap_token: String,
    #[serde(with = "dec_u128")]
    output_total_gas: u128,
    output_gas_token: String,
    #[serde(with = "dec_u64")]
    caller_fee_share: u64,
    #[serde(with = "dec_u64")]
    fronting_fee_share: u64,
    #[serde(with = "dec_u64")]
    execution_fee_share: u64,
}

impl StoredSpvQuote {
    fn from_quote(quote: &SpvQuoteResponse) -> Self {
        Self {
            quote_id: quote.quote_id.clone(),
            vault_owner: quote.vault_owner.clone(),
            vault_id: quote.vault_id,
            vault_required_confirmations: quote.vault_required_confirmations,
            vault_token_multipliers: quote.vault_token_multipliers.clone(),
            vault_btc_address: quote.vault_btc_address.clone(),
            vault_utxo: quote.vault_utxo.clone(),
            vault_utxo_value: quote.vault_utxo_value,
            btc_destination_address: quote.btc_destination_address.clone(),
            btc_amount: quote.btc_amount,
            btc_amount_swap: quote.btc_amount_swap,
            btc_amount_gas: quote.btc_amount_gas,
            minimum_btc_fee_rate: quote.minimum_btc_fee_rate,
            output_total_swap: quote.output_total_swap,
            output_swap_token: quote.output_swap_token.clone(),
            output_total_gas: quote.output_total_gas,
            output_gas_token: quote.output_gas_token.clone(),
            caller_fee_share: quote.caller_fee_share,
            fronting_fee_share: quote.fronting_fee_share,
            execution_fee_share: quote.execution_fee_share,
        }
    }

    fn multiplier(&self, index: usize) -> Result<u128> {
        self.vault_token_multipliers
            .get(index)
            .and_then(|m| m.parse().ok())
            .ok_or_else(|| {
                Error::Intermediary(format!("Missing vault token multiplier {}", index))
            })
    }

    fn vault_utxo_parsed(&self) -> Result<BtcUtxo> {
        let (txid, vout) = self
            .vault_utxo
            .split_once(':')
            .ok_or_else(|| Error::Parse(format!("Bad vault utxo {}", self.vault_utxo)))?;
        Ok(BtcUtxo {
            txid: txid.to_string(),
            vout: vout
                .parse()
                .map_err(|_| Error::Parse(format!("Bad vault utxo {}", self.vault_utxo)))?,
            value: self.vault_utxo_value,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSpv {
    #[serde(flatten)]
    core: StoredSwapCore,
    #[serde(flatten)]
    quote: StoredSpvQuote,
    wallet_mode: SpvWalletMode,
    swap_wallet: Option<StoredSwapWallet>,
    user_inputs: Vec<BtcUtxo>,
    btc_txid: Option<String>,
    #[serde(with = "dec_u64_opt")]
    btc_confirmation_height: Option<u64>,
    front_txid: Option<String>,
    claim_txid: Option<String>,
}

struct SpvInner {
    core: SwapCore,
    state: SpvFromBtcState,
    quote: StoredSpvQuote,
    wallet_mode: SpvWalletMode,
    swap_wallet: Option<StoredSwapWallet>,
    user_inputs: Vec<BtcUtxo>,
    btc_txid: Option<String>,
    btc_confirmation_height: Option<u64>,
    front_txid: Option<String>,
    claim_txid: Option<String>,
    tick_counter: u32,
}

impl SpvInner {
    fn to_record(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(StoredSpv {
            core: self.core.to_stored(self.state.to_i32()),
            quote: self.quote.clone(),
            wallet_mode: self.wallet_mode,
            swap_wallet: self.swap_wallet.clone(),
            user_inputs: self.user_inputs.clone(),
            btc_txid: self.btc_txid.clone(),
            btc_confirmation_height: self.btc_confirmation_height,
            front_txid: self.front_txid.clone(),
            claim_txid: self.claim_txid.clone(),
        })?)
    }
}

/// An SPV-vault BTC → smart chain swap instance.
pub struct SpvFromBtcSwap {
    id: String,
    shared: SwapShared,
    inner: Mutex<SpvInner>,
}

impl SpvFromBtcSwap {
    fn new(ctx: Arc<SwapContext>, emitter: SwapEventEmitter, inner: SpvInner) -> Arc<Self> {
        Arc::new(Self {
            id: inner.core.id.clone(),
            shared: SwapShared::new(ctx, emitter, inner.state.to_i32()),
            inner: Mutex::new(inner),
        })
    }

    async fn save_and_emit(&self, inner: &mut SpvInner, state: SpvFromBtcState) -> Result<()> {
        if state != inner.state {
            if inner.state.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "Swap already settled as {:?}",
                    inner.state
                )));
            }
            if !SpvFromBtcState::can_transition(inner.state, state) {
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

    pub async fn typed_state(&self) -> SpvFromBtcState {
        self.inner.lock().await.state
    }

    pub async fn get_btc_txid(&self) -> Option<String> {
        self.inner.lock().await.btc_txid.clone()
    }

    /// Transaction id of the destination settlement: the fronting tx when
    /// fronted, otherwise the claim tx.
    pub async fn get_output_txid(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.front_txid.clone().or_else(|| inner.claim_txid.clone())
    }

    /// The one-shot deposit address and total the user must pay in
    /// wait-payment mode (amount + expected network fee).
    pub async fn get_bitcoin_payment(&self) -> Result<(String, u64)> {
        let inner = self.inner.lock().await;
        let wallet = inner
            .swap_wallet
            .as_ref()
            .ok_or_else(|| Error::InvalidState("Swap has no dedicated wallet".into()))?;
        let wallet =
            SwapBitcoinWallet::from_wif(&wallet.wif, self.shared.ctx.btc_network)?;
        let payload_len = self.op_return_payload(&inner)?.len();
        let fee_rate = inner.quote.minimum_btc_fee_rate;
        Ok((
            wallet.address().to_string(),
            inner.quote.btc_amount + expected_network_fee(fee_rate, payload_len),
        ))
    }

    fn psbt_params(&self, inner: &SpvInner) -> Result<SpvPsbtParams> {
        Ok(SpvPsbtParams {
            vault_utxo: inner.quote.vault_utxo_parsed()?,
            vault_script: ScriptBuf::from_bytes(locking_script(
                &inner.quote.vault_btc_address,
                self.shared.ctx.btc_network,
            )?),
            btc_destination_script: ScriptBuf::from_bytes(locking_script(
                &inner.quote.btc_destination_address,
                self.shared.ctx.btc_network,
            )?),
            btc_amount: inner.quote.btc_amount,
            caller_fee_share: inner.quote.caller_fee_share,
            fronting_fee_share: inner.quote.fronting_fee_share,
            execution_fee_share: inner.quote.execution_fee_share,
        })
    }

    fn op_return_payload(&self, inner: &SpvInner) -> Result<Vec<u8>> {
        let mut raw_amounts = vec![
            u128_to_u64(inner.quote.output_total_swap / inner.quote.multiplier(0)?)?,
        ];
        if inner.quote.output_total_gas > 0 {
            raw_amounts
                .push(u128_to_u64(inner.quote.output_total_gas / inner.quote.multiplier(1)?)?);
        }
        self.shared
            .ctx
            .spv_contract
            .encode_op_return_payload(&inner.core.initiator, &raw_amounts)
    }

    /// The unsigned withdrawal PSBT (vault input + outputs); the caller's
    /// wallet adds funding inputs and signs.
    pub async fn get_funding_psbt(&self) -> Result<bitcoin::Psbt> {
        let inner = self.inner.lock().await;
        if inner.state != SpvFromBtcState::Created {
            return Err(Error::InvalidState(format!(
                "Cannot build PSBT from {:?}",
                inner.state
            )));
        }
        if inner.core.is_quote_expired() {
            return Err(Error::Expired("Quote expired".into()));
        }
        let params = self.psbt_params(&inner)?;
        build_spv_psbt(&params, self.op_return_payload(&inner)?)
    }

    /// Verify a signed PSBT against the quote, persist it as signed and
    /// post it to the LP.
    ///
    /// A PSBT that fails verification or parsing surfaces an error and
    /// leaves the swap state untouched; an LP decline moves to DECLINED.
    pub async fn submit_psbt(&self, psbt: bitcoin::Psbt) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !matches!(
            inner.state,
            SpvFromBtcState::Created | SpvFromBtcState::Signed
        ) {
            return Err(Error::InvalidState(format!(
                "Cannot submit PSBT from {:?}",
                inner.state
            )));
        }

        let tx = psbt
            .clone()
            .extract_tx()
            .map_err(|e| Error::User(format!("PSBT not fully signed: {:?}", e)))?;
        let tx_hex = hex::encode(bitcoin::consensus::serialize(&tx));

        let withdrawal = self.shared.ctx.spv_contract.parse_withdrawal(&tx_hex).await?;

        // Every parsed field must equal the quoted one.
        if !withdrawal.is_recipient(&inner.core.initiator) {
            return Err(Error::Intermediary("Wrong withdrawal recipient".into()));
        }
        let raw_amounts = withdrawal.raw_amounts();
        let expected_swap = inner.quote.output_total_swap / inner.quote.multiplier(0)?;
        if raw_amounts.first().copied().unwrap_or(0) as u128 != expected_swap {
            return Err(Error::Intermediary("Swap amount mismatch".into()));
        }
        if inner.quote.output_total_gas > 0 {
            let expected_gas = inner.quote.output_total_gas / inner.quote.multiplier(1)?;
            if raw_amounts.get(1).copied().unwrap_or(0) as u128 != expected_gas {
                return Err(Error::Intermediary("Gas amount mismatch".into()));
            }
        }
        if withdrawal.caller_fee_rate() != inner.quote.caller_fee_share
            || withdrawal.fronting_fee_rate() != inner.quote.fronting_fee_share
            || withdrawal.execution_fee_rate() != inner.quote.execution_fee_share
        {
            return Err(Error::Intermediary("Fee share mismatch".into()));
        }
        if withdrawal.spent_vault_utxo() != inner.quote.vault_utxo {
            return Err(Error::Intermediary("Wrong vault UTXO spent".into()));
        }
        if withdrawal.new_vault_btc_amount() != inner.quote.vault_utxo_value {
            return Err(Error::Intermediary("Vault amount not replayed".into()));
        }
        let vault_script =
            locking_script(&inner.quote.vault_btc_address, self.shared.ctx.btc_network)?;
        if withdrawal.new_vault_script() != vault_script {
            return Err(Error::Intermediary("Vault script not replayed".into()));
        }
        if withdrawal.execution_data().is_some() {
            return Err(Error::Intermediary("Unexpected execution data".into()));
        }
        let btc_tx = withdrawal.btc_tx();
        let destination_script = hex::encode(locking_script(
            &inner.quote.btc_destination_address,
            self.shared.ctx.btc_network,
        )?);
        let out2 = btc_tx
            .outs
            .get(2)
            .ok_or_else(|| Error::Intermediary("Missing LP output".into()))?;
        if out2.value != inner.quote.btc_amount || out2.script_hex != destination_script {
            return Err(Error::Intermediary("LP output mismatch".into()));
        }

        let vault_utxo = inner.quote.vault_utxo_parsed()?;
        if self
            .shared
            .ctx
            .btc_rpc
            .is_spent(&vault_utxo.txid, vault_utxo.vout)
            .await?
        {
            return Err(Error::Expired("Vault UTXO already spent".into()));
        }

        let txid = withdrawal.tx_id();
        inner.user_inputs = btc_tx
            .ins
            .iter()
            .skip(1)
            .map(|i| BtcUtxo {
                txid: i.txid.clone(),
                vout: i.vout,
                value: 0,
            })
            .collect();
        inner.btc_txid = Some(txid.clone());
        inner.core.escrow_hash = txid;
        inner.core.initiated = true;
        if inner.state == SpvFromBtcState::Created {
            self.save_and_emit(&mut inner, SpvFromBtcState::Signed).await?;
        }

        let post = retry_with_backoff(
            || {
                self.shared.ctx.api.post_spv_psbt(
                    &inner.core.url,
                    &inner.quote.quote_id,
                    &tx_hex,
                )
            },
            |e| !e.is_retryable(),
        )
        .await;

        match post {
            Ok(()) => {
                self.save_and_emit(&mut inner, SpvFromBtcState::Posted).await?;
                Ok(())
            }
            Err(e @ Error::Intermediary(_)) => {
                self.save_and_emit(&mut inner, SpvFromBtcState::Declined)
                    .await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait-payment mode: watch the one-shot deposit address for the exact
    /// expected amount, fund the withdrawal with precisely that UTXO, sign
    /// and submit it.
    pub async fn wait_for_bitcoin_payment(&self, cancel: Option<&CancelHandle>) -> Result<()> {
        let (wallet, existing, address, expected_value, fee_rate, params, payload) = {
            let inner = self.inner.lock().await;
            if inner.state != SpvFromBtcState::Created {
                return Err(Error::InvalidState(format!(
                    "Cannot await payment from {:?}",
                    inner.state
                )));
            }
            if inner.wallet_mode != SpvWalletMode::WaitPayment {
                return Err(Error::InvalidState(
                    "Swap is not in wait-payment mode".into(),
                ));
            }
            let stored = inner
                .swap_wallet
                .clone()
                .ok_or_else(|| Error::InvalidState("Swap has no dedicated wallet".into()))?;
            let wallet =
                SwapBitcoinWallet::from_wif(&stored.wif, self.shared.ctx.btc_network)?;
            let address = wallet.address().to_string();
            let payload = self.op_return_payload(&inner)?;
            let fee_rate = inner.quote.minimum_btc_fee_rate;
            let expected_value =
                inner.quote.btc_amount + expected_network_fee(fee_rate, payload.len());
            let params = self.psbt_params(&inner)?;
            (
                wallet,
                stored.existing_utxos,
                address,
                expected_value,
                fee_rate,
                params,
                payload,
            )
        };

        let (utxo, _tx) = wait_for_address_txo(
            self.shared.ctx.btc_rpc.as_ref(),
            &address,
            1,
            |utxo| {
                utxo.value == expected_value
                    && !existing.iter().any(|e| e.outpoint() == utxo.outpoint())
            },
            cancel,
        )
        .await?;

        self.fund_sign_submit(&wallet, &params, payload, &[utxo], fee_rate)
            .await
    }

    /// Prefunded mode: spend the snapshotted wallet UTXOs exactly.
    pub async fn submit_prefunded(&self) -> Result<()> {
        let (wallet, existing, params, payload, fee_rate) = {
            let inner = self.inner.lock().await;
            if inner.state != SpvFromBtcState::Created {
                return Err(Error::InvalidState(format!(
                    "Cannot submit from {:?}",
                    inner.state
                )));
            }
            if inner.wallet_mode != SpvWalletMode::Prefunded {
                return Err(Error::InvalidState("Swap is not prefunded".into()));
            }
            let stored = inner
                .swap_wallet
                .clone()
                .ok_or_else(|| Error::InvalidState("Swap has no dedicated wallet".into()))?;
            (
                SwapBitcoinWallet::from_wif(&stored.wif, self.shared.ctx.btc_network)?,
                stored.existing_utxos,
                self.psbt_params(&inner)?,
                self.op_return_payload(&inner)?,
                inner.quote.minimum_btc_fee_rate,
            )
        };
        self.fund_sign_submit(&wallet, &params, payload, &existing, fee_rate)
            .await
    }

    async fn fund_sign_submit(
        &self,
        wallet: &SwapBitcoinWallet,
        params: &SpvPsbtParams,
        payload: Vec<u8>,
        utxos: &[BtcUtxo],
        minimum_fee_rate: u64,
    ) -> Result<()> {
        let payload_len = payload.len();
        let psbt = build_spv_psbt(params, payload)?;
        let psbt = fund_psbt_with_exact_utxos(psbt, params, utxos, &wallet.script_pubkey())?;

        let fee = exact_funding_fee(params, utxos);
        let vsize = estimate_vsize(utxos.len(), payload_len);
        if fee / vsize < minimum_fee_rate {
            return Err(Error::NotEnoughBalance(format!(
                "Effective fee rate {} below minimum {}",
                fee / vsize,
                minimum_fee_rate
            )));
        }

        let psbt = wallet.sign_psbt(psbt)?;
        self.submit_psbt(psbt).await
    }

    /// Poll the contract for the withdrawal settlement until it resolves.
    pub async fn watchdog_wait_till_result(
        &self,
        cancel: Option<&CancelHandle>,
    ) -> Result<SpvFromBtcState> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.state.is_terminal() {
                    return Ok(inner.state);
                }
                if let Some(txid) = inner.btc_txid.clone() {
                    let state = self
                        .shared
                        .ctx
                        .spv_contract
                        .get_withdrawal_state(&txid)
                        .await?;
                    if self.apply_withdrawal_state(&mut inner, state).await? {
                        return Ok(inner.state);
                    }
                }
            }
            cancellable_sleep(WATCHDOG_POLL_INTERVAL, cancel).await?;
        }
    }

    /// Drive the swap to settlement after the PSBT was posted.
    ///
    /// Races the contract watchdog against the state listeners; returns
    /// `true` when the destination settlement (front or claim) was
    /// observed, `false` only when the automatic-settlement window lapsed.
    pub async fn execute(&self, cancel: Option<&CancelHandle>) -> Result<bool> {
        {
            let inner = self.inner.lock().await;
            if inner.state < SpvFromBtcState::Posted && !inner.state.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "PSBT not yet posted ({:?})",
                    inner.state
                )));
            }
        }

        let race = CancelHandle::new();
        let watchdog_cancel = race.child();
        let waiter_cancel = race.child();

        let outcome = crate::utils::cancellable(
            async {
                let raced = tokio::time::timeout(
                    self.shared.ctx.options.max_wait_till_automatic_settlement,
                    async {
                        tokio::select! {
                            state = self.watchdog_wait_till_result(Some(&watchdog_cancel)) => state,
                            state = self.shared.wait_till_state(
                                SpvFromBtcState::Fronted.to_i32(),
                                StateCompare::Gte,
                                Some(&waiter_cancel),
                            ) => state.and_then(SpvFromBtcState::from_i32),
                        }
                    },
                )
                .await;
                match raced {
                    Err(_) => Ok(None),
                    Ok(state) => state.map(Some),
                }
            },
            cancel,
        )
        .await;
        race.cancel("settlement race resolved");

        match outcome {
            Ok(None) => Ok(false),
            Ok(Some(state)) if state.is_success() => Ok(true),
            Ok(Some(state)) => Err(Error::CatastrophicFailure(format!(
                "Withdrawal settled as {:?}",
                state
            ))),
            Err(e) => Err(e),
        }
    }

    async fn apply_withdrawal_state(
        &self,
        inner: &mut SpvInner,
        state: SpvWithdrawalState,
    ) -> Result<bool> {
        match state {
            SpvWithdrawalState::Fronted { fronter: _, txid } => {
                inner.front_txid = Some(txid);
                self.save_and_emit(inner, SpvFromBtcState::Fronted).await?;
                Ok(true)
            }
            SpvWithdrawalState::Claimed { txid } => {
                inner.claim_txid = Some(txid);
                self.save_and_emit(inner, SpvFromBtcState::Claimed).await?;
                Ok(true)
            }
            SpvWithdrawalState::Closed { .. } => {
                self.save_and_emit(inner, SpvFromBtcState::Closed).await?;
                Ok(true)
            }
            SpvWithdrawalState::NotFound => Ok(false),
        }
    }

    /// Polling-reduction heuristic: the withdrawal state is only worth
    /// checking when a fronter is on record, or the vault already advanced
    /// to (or past) the swap transaction.
    async fn should_check_withdrawal_state(&self, inner: &SpvInner) -> Result<bool> {
        if inner.front_txid.is_some() {
            return Ok(true);
        }
        let Some(txid) = inner.btc_txid.as_ref() else {
            return Ok(false);
        };
        let fronter = self
            .shared
            .ctx
            .spv_contract
            .get_fronter_address(&inner.quote.vault_owner, inner.quote.vault_id, txid)
            .await?;
        if fronter.is_some() {
            return Ok(true);
        }
        let vault_utxo = self
            .shared
            .ctx
            .spv_contract
            .get_vault_latest_utxo(&inner.quote.vault_owner, inner.quote.vault_id)
            .await?;
        match (vault_utxo, inner.btc_confirmation_height) {
            (Some((_, Some(vault_height))), Some(swap_height)) => {
                Ok(vault_height as u64 >= swap_height)
            }
            _ => Ok(true),
        }
    }

    /// Re-synchronize from bitcoin: broadcast visibility, confirmations,
    /// and double-spent inputs.
    async fn sync_bitcoin(&self, inner: &mut SpvInner) -> Result<()> {
        let Some(txid) = inner.btc_txid.clone() else {
            return Ok(());
        };
        match self.shared.ctx.btc_rpc.get_transaction(&txid).await? {
            Some(tx) => {
                if inner.state == SpvFromBtcState::Posted {
                    self.save_and_emit(inner, SpvFromBtcState::Broadcasted).await?;
                }
                if tx.confirmations >= inner.quote.vault_required_confirmations
                    && matches!(
                        inner.state,
                        SpvFromBtcState::Posted | SpvFromBtcState::Broadcasted
                    )
                {
                    inner.btc_confirmation_height = tx.block_height.map(|h| h as u64);
                    self.save_and_emit(inner, SpvFromBtcState::BtcTxConfirmed)
                        .await?;
                }
            }
            None => {
                // The transaction vanished; if any funded input is spent
                // elsewhere the swap is unrecoverable.
                let vault_utxo = inner.quote.vault_utxo_parsed()?;
                let mut candidates = vec![vault_utxo];
                candidates.extend(inner.user_inputs.iter().cloned());
                for utxo in candidates {
                    if self
                        .shared
                        .ctx
                        .btc_rpc
                        .is_spent(&utxo.txid, utxo.vout)
                        .await?
                    {
                        self.save_and_emit(inner, SpvFromBtcState::Failed).await?;
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    async fn sync_inner(&self, inner: &mut SpvInner) -> Result<bool> {
        let before = inner.state;
        match inner.state {
            SpvFromBtcState::Created => {
                if inner.core.is_quote_expired() {
                    self.save_and_emit(inner, SpvFromBtcState::QuoteSoftExpired)
                        .await?;
                }
            }
            SpvFromBtcState::QuoteSoftExpired => {
                let grace = self.shared.ctx.options.definitive_expiry_grace.as_millis() as u64;
                if now_millis() > inner.core.expiry + grace {
                    self.save_and_emit(inner, SpvFromBtcState::QuoteExpired).await?;
                }
            }
            SpvFromBtcState::Posted
            | SpvFromBtcState::Broadcasted
            | SpvFromBtcState::BtcTxConfirmed => {
                self.sync_bitcoin(inner).await?;
                if !inner.state.is_terminal() && self.should_check_withdrawal_state(inner).await? {
                    if let Some(txid) = inner.btc_txid.clone() {
                        let state = self
                            .shared
                            .ctx
                            .spv_contract
                            .get_withdrawal_state(&txid)
                            .await?;
                        self.apply_withdrawal_state(inner, state).await?;
                    }
                }
            }
            _ => {}
        }
        Ok(inner.state != before)
    }
}

fn u128_to_u64(value: u128) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Intermediary("Raw amount exceeds 64 bits".into()))
}

#[async_trait]
impl Swap for SpvFromBtcSwap {
    fn kind(&self) -> SwapKind {
        SwapKind::SpvVaultFromBtc
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
            || (inner.state == SpvFromBtcState::Created && inner.core.is_quote_expired())
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
                inner.quote.btc_amount_swap,
                crate::types::FeeData {
                    sats_base_fee: pricing.sats_base_fee,
                    fee_ppm: pricing.fee_ppm,
                },
                inner.quote.output_total_swap,
                &inner.quote.output_swap_token,
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
impl WrapperSwap for SpvFromBtcSwap {
    fn from_record(
        ctx: Arc<SwapContext>,
        emitter: SwapEventEmitter,
        record: serde_json::Value,
    ) -> Result<Arc<Self>> {
        let stored: StoredSpv = serde_json::from_value(record)?;
        let (core, state) = SwapCore::from_stored(stored.core);
        let inner = SpvInner {
            state: SpvFromBtcState::from_i32(state)?,
            core,
            quote: stored.quote,
            wallet_mode: stored.wallet_mode,
            swap_wallet: stored.swap_wallet,
            user_inputs: stored.user_inputs,
            btc_txid: stored.btc_txid,
            btc_confirmation_height: stored.btc_confirmation_height,
            front_txid: stored.front_txid,
            claim_txid: stored.claim_txid,
            tick_counter: 0,
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
            SpvFromBtcState::Created if inner.core.is_quote_expired() => {
                self.save_and_emit(&mut inner, SpvFromBtcState::QuoteSoftExpired)
                    .await?;
            }
            SpvFromBtcState::Posted | SpvFromBtcState::Broadcasted => {
                inner.tick_counter += 1;
                if inner.tick_counter % BTC_RESYNC_TICKS == 0 {
                    self.sync_bitcoin(&mut inner).await?;
                }
            }
            _ => {}
        }
        Ok(inner.state != before)
    }

    async fn process_event(self: &Arc<Self>, event: &ChainEvent) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return Ok(());
        }
        match event {
            ChainEvent::SpvFront { btc_txid, .. } => {
                if inner.btc_txid.as_deref() == Some(btc_txid.as_str()) {
                    inner.front_txid = Some(btc_txid.clone());
                    self.save_and_emit(&mut inner, SpvFromBtcState::Fronted).await?;
                }
            }
            ChainEvent::SpvClaim { btc_txid, .. } => {
                if inner.btc_txid.as_deref() == Some(btc_txid.as_str()) {
                    inner.claim_txid = Some(btc_txid.clone());
                    self.save_and_emit(&mut inner, SpvFromBtcState::Claimed).await?;
                }
            }
            ChainEvent::SpvClose { btc_txid, .. } => {
                if inner.btc_txid.as_deref() == Some(btc_txid.as_str()) {
                    self.save_and_emit(&mut inner, SpvFromBtcState::Closed).await?;
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

impl SwapWrapper<SpvFromBtcSwap> {
    /// Request an SPV-vault quote and build the verified swap.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        self: &Arc<Self>,
        recipient: &str,
        lp: &LpDescriptor,
        amount: u128,
        exact_in: bool,
        gas_amount: u128,
        wallet_mode: SpvWalletMode,
    ) -> Result<Arc<SpvFromBtcSwap>> {
        let request = FromBtcQuoteRequest {
            address: recipient.to_string(),
            amount,
            token: String::new(),
            exact_in,
            sequence: 0,
            deposit_token: String::new(),
            gas_amount,
        };

        let quote = retry_with_backoff(
            || self.ctx.api.get_spv_quote(&lp.url, &request),
            |e| !e.is_retryable(),
        )
        .await?;

        // Preconditions the PSBT encoding depends on.
        if quote.caller_fee_share > 0xFFFFF
            || quote.fronting_fee_share > 0xFFFFF
            || quote.execution_fee_share > 0xFFFFF
        {
            return Err(Error::Intermediary("Fee share exceeds 20 bits".into()));
        }
        if quote.btc_amount != quote.btc_amount_swap + quote.btc_amount_gas {
            return Err(Error::Intermediary("BTC amount split mismatch".into()));
        }
        quote.vault_token_multiplier(0)?;
        if quote.output_total_gas > 0 {
            quote.vault_token_multiplier(1)?;
        }
        locking_script(&quote.vault_btc_address, self.ctx.btc_network)?;
        locking_script(&quote.btc_destination_address, self.ctx.btc_network)?;

        let prefetched_usd = self.pre_fetch_usd_price().await;
        let pricing = self
            .verify_returned_price(
                false,
                quote.btc_amount_swap,
                quote.output_total_swap,
                &quote.output_swap_token,
                VerifyFees {
                    sats_base_fee: lp.sats_base_fee,
                    fee_ppm: lp.fee_ppm,
                    network_fee_token: 0,
                },
                None,
                prefetched_usd,
                None,
            )
            .await?;
        if quote.output_total_gas > 0 {
            self.verify_returned_price(
                false,
                quote.btc_amount_gas,
                quote.output_total_gas,
                &quote.output_gas_token,
                VerifyFees {
                    sats_base_fee: 0,
                    fee_ppm: lp.fee_ppm,
                    network_fee_token: 0,
                },
                None,
                prefetched_usd,
                None,
            )
            .await?;
        }

        let swap_wallet = match wallet_mode {
            SpvWalletMode::External => None,
            SpvWalletMode::WaitPayment | SpvWalletMode::Prefunded => {
                let wallet = SwapBitcoinWallet::generate(self.ctx.btc_network);
                let existing_utxos = self
                    .ctx
                    .btc_rpc
                    .get_address_utxos(&wallet.address().to_string())
                    .await?;
                Some(StoredSwapWallet {
                    wif: wallet.to_wif(),
                    existing_utxos,
                })
            }
        };

        let nonce = random_nonce();
        let core = SwapCore {
            kind: SwapKind::SpvVaultFromBtc,
            id: format!("{}{}", quote.quote_id, nonce),
            // Re-keyed to the bitcoin txid once the PSBT is signed.
            escrow_hash: quote.quote_id.clone(),
            initiator: recipient.to_string(),
            chain_identifier: self.ctx.chain.chain_identifier(),
            url: lp.url.clone(),
            version: SWAP_SCHEMA_VERSION,
            initiated: false,
            exact_in,
            created_at: now_millis(),
            random_nonce: nonce,
            expiry: quote.expiry,
            swap_fee: quote.swap_fee,
            swap_fee_btc: quote.swap_fee_btc,
            pricing_info: Some(pricing),
        };
        let swap = SpvFromBtcSwap::new(
            self.ctx.clone(),
            self.emitter.clone(),
            SpvInner {
                core,
                state: SpvFromBtcState::Created,
                quote: StoredSpvQuote::from_quote(&quote),
                wallet_mode,
                swap_wallet,
                user_inputs: Vec::new(),
                btc_txid: None,
                btc_confirmation_height: None,
                front_txid: None,
                claim_txid: None,
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

    const RECIPIENT: &str = "0xRECIPIENT";

    fn lp() -> LpDescriptor {
        LpDescriptor {
            url: "http://lp".into(),
            address: "0xLP".into(),
            sats_base_fee: 0,
            fee_ppm: 0,
        }
    }

    fn spv_quote() -> SpvQuoteResponse {
        SpvQuoteResponse {
            quote_id: "q1".into(),
            vault_owner: "0xVAULT".into(),
            vault_id: 7,
            vault_required_confirmations: 2,
            vault_token_multipliers: vec!["100".into(), "10".into()],
            vault_btc_address: test_btc_address(2),
            vault_utxo: format!("{}:0", "c".repeat(64)),
            vault_utxo_value: 30_000,
            btc_destination_address: test_btc_address(3),
            btc_amount: 100_500,
            btc_amount_swap: 100_000,
            btc_amount_gas: 500,
            minimum_btc_fee_rate: 1,
            // 100_000 sats at 10_000 usat/unit -> 10_000_000 units.
            output_total_swap: 10_000_000,
            output_swap_token: MOCK_TOKEN.into(),
            // 500 sats -> 50_000 units.
            output_total_gas: 50_000,
            output_gas_token: MOCK_GAS_TOKEN.into(),
            gas_swap_fee_btc: 1,
            gas_swap_fee: 10,
            caller_fee_share: 0x12345,
            fronting_fee_share: 0x3FFFF,
            execution_fee_share: 0xABCDE,
            expiry: now_millis() + 3_600_000,
            swap_fee: 100,
            swap_fee_btc: 1,
        }
    }

    async fn wrapper_for(world: &MockWorld) -> Arc<SwapWrapper<SpvFromBtcSwap>> {
        let router = Arc::new(UnifiedSwapEventListener::new(world.storage.clone()));
        SwapWrapper::new(SwapKind::SpvVaultFromBtc, world.context(), router)
    }

    async fn created_swap(world: &MockWorld, mode: SpvWalletMode) -> Arc<SpvFromBtcSwap> {
        let wrapper = wrapper_for(world).await;
        *world.api.spv_quote.lock().unwrap() = Some(spv_quote());
        wrapper
            .create(RECIPIENT, &lp(), 100_000, true, 500, mode)
            .await
            .unwrap()
    }

    /// Build, exactly-fund and sign a valid withdrawal for the swap.
    async fn signed_psbt(swap: &Arc<SpvFromBtcSwap>, fund_value: u64) -> bitcoin::Psbt {
        let wallet = SwapBitcoinWallet::generate(bitcoin::Network::Regtest);
        let (params, payload) = {
            let inner = swap.inner.lock().await;
            (
                swap.psbt_params(&inner).unwrap(),
                swap.op_return_payload(&inner).unwrap(),
            )
        };
        let psbt = build_spv_psbt(&params, payload).unwrap();
        let utxo = BtcUtxo {
            txid: "d".repeat(64),
            vout: 0,
            value: fund_value,
        };
        let psbt =
            fund_psbt_with_exact_utxos(psbt, &params, &[utxo], &wallet.script_pubkey()).unwrap();
        wallet.sign_psbt(psbt).unwrap()
    }

    #[tokio::test]
    async fn test_create_rejects_oversized_fee_share() {
        let world = MockWorld::new();
        let wrapper = wrapper_for(&world).await;
        let mut quote = spv_quote();
        quote.caller_fee_share = 0x100000;
        *world.api.spv_quote.lock().unwrap() = Some(quote);
        let res = wrapper
            .create(RECIPIENT, &lp(), 100_000, true, 500, SpvWalletMode::External)
            .await;
        assert!(matches!(res, Err(Error::Intermediary(_))));
    }

    #[tokio::test]
    async fn test_submit_psbt_roundtrip() {
        let world = MockWorld::new();
        let swap = created_swap(&world, SpvWalletMode::External).await;
        assert_eq!(swap.typed_state().await, SpvFromBtcState::Created);

        let psbt = signed_psbt(&swap, 102_000).await;
        swap.submit_psbt(psbt).await.unwrap();
        assert_eq!(swap.typed_state().await, SpvFromBtcState::Posted);
        assert!(swap.is_initiated().await);

        // The PSBT reached the LP and the record is keyed by the txid now.
        assert_eq!(world.api.psbt_posts.lock().unwrap().len(), 1);
        let record = swap.serialize().await.unwrap();
        assert_eq!(record["escrowHash"], swap.get_btc_txid().await.unwrap());
    }

    #[tokio::test]
    async fn test_submit_psbt_rejects_tampered_lp_output() {
        let world = MockWorld::new();
        let swap = created_swap(&world, SpvWalletMode::External).await;

        let mut psbt = signed_psbt(&swap, 102_000).await;
        // Output 2 pays less than quoted.
        psbt.unsigned_tx.output[2].value = bitcoin::Amount::from_sat(99_000);
        let res = swap.submit_psbt(psbt).await;
        assert!(matches!(res, Err(Error::Intermediary(_))));
        // Parse/verification failures leave the state untouched.
        assert_eq!(swap.typed_state().await, SpvFromBtcState::Created);
    }

    #[tokio::test]
    async fn test_submit_psbt_lp_decline() {
        let world = MockWorld::new();
        let swap = created_swap(&world, SpvWalletMode::External).await;
        *world.api.decline_psbt.lock().unwrap() = Some("vault busy".into());

        let psbt = signed_psbt(&swap, 102_000).await;
        let res = swap.submit_psbt(psbt).await;
        assert!(matches!(res, Err(Error::Intermediary(_))));
        assert_eq!(swap.typed_state().await, SpvFromBtcState::Declined);
    }

    #[tokio::test]
    async fn test_wait_payment_mode_funds_exact_utxo() {
        let world = MockWorld::new();
        world.btc_rpc.txs.lock().unwrap().clear();
        let swap = created_swap(&world, SpvWalletMode::WaitPayment).await;

        let (address, expected) = swap.get_bitcoin_payment().await.unwrap();
        // A stale UTXO from the snapshot is ignored; only the fresh exact
        // payment is used.
        world.btc_rpc.add_utxo(
            &address,
            BtcUtxo {
                txid: "e".repeat(64),
                vout: 0,
                value: expected,
            },
        );
        world.btc_rpc.add_tx(crate::chain::BtcTx {
            txid: "e".repeat(64),
            hex: String::new(),
            confirmations: 1,
            block_height: Some(50),
            blockhash: None,
            outs: vec![],
            ins: vec![],
        });

        swap.wait_for_bitcoin_payment(None).await.unwrap();
        assert_eq!(swap.typed_state().await, SpvFromBtcState::Posted);
    }

    #[tokio::test]
    async fn test_settlement_fronted_via_watchdog() {
        let world = MockWorld::new();
        let swap = created_swap(&world, SpvWalletMode::External).await;
        let psbt = signed_psbt(&swap, 102_000).await;
        swap.submit_psbt(psbt).await.unwrap();

        let txid = swap.get_btc_txid().await.unwrap();
        world.spv_contract.withdrawal_state.lock().unwrap().insert(
            txid.clone(),
            SpvWithdrawalState::Fronted {
                fronter: "0xTOWER".into(),
                txid: "fronttx".into(),
            },
        );
        assert!(swap.execute(None).await.unwrap());
        assert_eq!(swap.typed_state().await, SpvFromBtcState::Fronted);
        assert_eq!(swap.get_output_txid().await.as_deref(), Some("fronttx"));
    }

    #[tokio::test]
    async fn test_close_event_is_catastrophic() {
        let world = MockWorld::new();
        let swap = created_swap(&world, SpvWalletMode::External).await;
        let psbt = signed_psbt(&swap, 102_000).await;
        swap.submit_psbt(psbt).await.unwrap();

        let txid = swap.get_btc_txid().await.unwrap();
        swap.process_event(&ChainEvent::SpvClose {
            btc_txid: txid,
            owner: "0xVAULT".into(),
            vault_id: 7,
        })
        .await
        .unwrap();
        assert_eq!(swap.typed_state().await, SpvFromBtcState::Closed);
        let res = swap.execute(None).await;
        assert!(matches!(res, Err(Error::CatastrophicFailure(_))));
    }

    #[tokio::test]
    async fn test_double_spent_input_fails_swap() {
        let world = MockWorld::new();
        let swap = created_swap(&world, SpvWalletMode::External).await;
        let psbt = signed_psbt(&swap, 102_000).await;
        swap.submit_psbt(psbt).await.unwrap();

        // The tx never appears on the network and a funded input gets spent
        // elsewhere.
        let input = {
            let inner = swap.inner.lock().await;
            inner.user_inputs[0].clone()
        };
        world.btc_rpc.mark_spent(&input.outpoint());
        assert!(swap.sync(true).await.unwrap());
        assert_eq!(swap.typed_state().await, SpvFromBtcState::Failed);
    }

    #[tokio::test]
    async fn test_serialize_roundtrip() {
        let world = MockWorld::new();
        let swap = created_swap(&world, SpvWalletMode::WaitPayment).await;
        {
            let mut inner = swap.inner.lock().await;
            inner.core.initiated = true;
            inner.btc_txid = Some("sometx".into());
        }
        let record = swap.serialize().await.unwrap();
        assert_eq!(record["type"], "SPV_VAULT_FROM_BTC");
        let restored =
            SpvFromBtcSwap::from_record(world.context(), SwapEventEmitter::new(), record.clone())
                .unwrap();
        assert_eq!(restored.serialize().await.unwrap(), record);
    }
}
