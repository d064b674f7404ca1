//! Capability traits over the external chains and transports.
//!
//! The protocol engine never talks to a blockchain directly. Smart-chain
//! contracts, the Bitcoin RPC, the relay synchronizer, the messenger gossip
//! plane and wallet adapters are all collaborators behind the traits in this
//! module, so the engine stays generic over the actual chain bindings.

use crate::error::{Error, Result};
use crate::types::BtcUtxo;
use crate::utils::{CancelHandle, cancellable_sleep};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// An opaque, chain-specific transaction blob produced by a contract and
/// consumed by [`EscrowContract::send_and_confirm`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainTx(pub serde_json::Value);

/// Signature material authorizing an escrow init, produced by the LP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureData {
    pub prefix: String,
    pub timeout: String,
    pub signature: String,
}

/// The locking condition class of an escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowType {
    /// Claimable against a confirmed bitcoin transaction output.
    Chain,
    /// Claimable by revealing an HTLC pre-image.
    Htlc,
}

/// Observed state of an escrow on the smart chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowStatus {
    NotCommitted,
    Committed,
    /// The escrow was claimed; the claim transaction id when known.
    Paid { claim_txid: Option<String> },
    Expired,
    Refunded,
}

/// Status of a smart-chain transaction looked up by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    NotFound,
    Pending,
    Success,
    Reverted,
}

/// Settlement state of an SPV-vault withdrawal as seen by the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpvWithdrawalState {
    NotFound,
    /// A watchtower fronted the destination settlement.
    Fronted { fronter: String, txid: String },
    /// A watchtower claimed after bitcoin confirmations.
    Claimed { txid: String },
    /// The contract rejected the withdrawal.
    Closed { txid: String },
}

/// Chain-specific escrow data, treated by the core through this capability
/// set only.
pub trait SwapData: Send + Sync + std::fmt::Debug {
    fn claimer(&self) -> String;
    fn offerer(&self) -> String;
    fn amount(&self) -> u128;
    fn token(&self) -> String;
    fn deposit_token(&self) -> String;
    fn security_deposit(&self) -> u128;
    fn claimer_bounty(&self) -> u128;
    /// Hash committing to the claim condition (hex).
    fn claim_hash(&self) -> String;
    /// Hash identifying the escrow instance on chain (hex).
    fn escrow_hash(&self) -> String;
    fn expiry(&self) -> u64;
    fn escrow_type(&self) -> EscrowType;
    fn sequence(&self) -> u64;
    fn is_pay_in(&self) -> bool;
    fn is_pay_out(&self) -> bool;
    fn has_success_action(&self) -> bool;
    fn serialize(&self) -> serde_json::Value;
}

/// A withdrawal parsed from a bitcoin transaction by the SPV-vault contract
/// helper.
pub trait SpvWithdrawalData: Send + Sync + std::fmt::Debug {
    fn is_recipient(&self, address: &str) -> bool;
    fn recipient(&self) -> String;
    /// Raw (pre-multiplier) amounts carried in the OP_RETURN.
    fn raw_amounts(&self) -> Vec<u64>;
    fn caller_fee_rate(&self) -> u64;
    fn fronting_fee_rate(&self) -> u64;
    fn execution_fee_rate(&self) -> u64;
    fn spent_vault_utxo(&self) -> String;
    fn new_vault_btc_amount(&self) -> u64;
    fn new_vault_script(&self) -> Vec<u8>;
    fn execution_data(&self) -> Option<Vec<u8>>;
    fn tx_id(&self) -> String;
    fn btc_tx(&self) -> BtcTx;
    fn serialize(&self) -> serde_json::Value;
}

/// A bitcoin transaction as returned by the RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcTx {
    pub txid: String,
    pub hex: String,
    pub confirmations: u32,
    pub block_height: Option<u32>,
    pub blockhash: Option<String>,
    pub outs: Vec<BtcTxOut>,
    pub ins: Vec<BtcTxIn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcTxOut {
    pub value: u64,
    pub script_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcTxIn {
    pub txid: String,
    pub vout: u32,
    pub sequence: u32,
}

/// Proof material handed to the contract when claiming against a confirmed
/// bitcoin transaction.
#[derive(Debug, Clone)]
pub struct BtcTxProof {
    pub blockhash: String,
    pub confirmations: u32,
    pub txid: String,
    pub hex: String,
    pub height: u32,
}

/// A signer on the smart chain.
pub trait SignerCapability: Send + Sync {
    fn address(&self) -> String;
}

/// Generic smart-chain operations outside of any particular contract.
#[async_trait]
pub trait ChainInterface: Send + Sync {
    /// Opaque identifier of the chain, stored with every swap.
    fn chain_identifier(&self) -> String;
    async fn get_tx_status(&self, txid: &str) -> Result<TxStatus>;
}

/// The escrow (PrTLC/HTLC) contract on the smart chain.
#[async_trait]
pub trait EscrowContract: Send + Sync {
    /// Rehydrate chain-specific escrow data from its serialized form.
    fn deserialize_swap_data(&self, value: serde_json::Value) -> Result<Arc<dyn SwapData>>;

    async fn get_commit_status(&self, initiator: &str, data: &dyn SwapData)
    -> Result<EscrowStatus>;

    /// Escrow data committed on chain under the given claim hash, when the
    /// counterparty (not this SDK) performed the init.
    async fn get_committed_data(&self, claim_hash: &str) -> Result<Option<Arc<dyn SwapData>>>;

    /// Whether the LP's init authorization has definitively expired.
    async fn is_init_authorization_expired(
        &self,
        data: &dyn SwapData,
        signature: &SignatureData,
    ) -> Result<bool>;

    /// Whether the escrow itself is past its on-chain expiry.
    async fn is_expired(&self, initiator: &str, data: &dyn SwapData) -> Result<bool>;

    /// Claim hash committing to a bitcoin output: `H(script ∥ amount ∥ confirmations)`.
    fn get_hash_for_onchain(&self, script: &[u8], amount: u64, confirmations: u32) -> Vec<u8>;

    /// Claim hash for an HTLC secret pre-image.
    fn get_hash_for_htlc(&self, secret: &[u8]) -> Vec<u8>;

    /// The extra data the contract expects for an on-chain claim tuple.
    fn get_extra_data(&self, script: &[u8], amount: u64, sequence: u64) -> Vec<u8>;

    /// Transactions performing the escrow init under the LP's authorization.
    async fn txs_init(
        &self,
        data: &dyn SwapData,
        signature: &SignatureData,
    ) -> Result<Vec<ChainTx>>;

    /// Claim transactions proving a confirmed bitcoin transaction, possibly
    /// prefixed with light-client sync transactions.
    async fn txs_claim_with_tx_data(
        &self,
        signer: &str,
        data: &dyn SwapData,
        tx: &BtcTxProof,
        required_confirmations: u32,
        vout: u32,
        synchronizer: Option<&dyn RelaySynchronizer>,
    ) -> Result<Vec<ChainTx>>;

    /// Claim transactions revealing an HTLC secret.
    async fn txs_claim_with_secret(
        &self,
        signer: &str,
        data: &dyn SwapData,
        secret: &[u8],
    ) -> Result<Vec<ChainTx>>;

    /// Refund transactions for an expired escrow the signer committed.
    async fn txs_refund(&self, signer: &str, data: &dyn SwapData) -> Result<Vec<ChainTx>>;

    /// Sign, send and confirm a transaction batch; returns the last txid.
    async fn send_and_confirm(
        &self,
        signer: &dyn SignerCapability,
        txs: Vec<ChainTx>,
        cancel: Option<&CancelHandle>,
    ) -> Result<String>;
}

/// The SPV-vault contract on the smart chain.
#[async_trait]
pub trait SpvContract: Send + Sync {
    /// Parse an SPV withdrawal from a raw bitcoin transaction.
    ///
    /// Fails with [`Error::Parse`] when the transaction does not encode a
    /// well-formed withdrawal.
    async fn parse_withdrawal(&self, tx_hex: &str) -> Result<Arc<dyn SpvWithdrawalData>>;

    /// Rehydrate withdrawal data from its serialized form.
    fn deserialize_withdrawal(&self, value: serde_json::Value)
    -> Result<Arc<dyn SpvWithdrawalData>>;

    async fn get_withdrawal_state(&self, btc_txid: &str) -> Result<SpvWithdrawalState>;

    /// The vault's latest UTXO and its confirmation height, when known.
    async fn get_vault_latest_utxo(
        &self,
        owner: &str,
        vault_id: u64,
    ) -> Result<Option<(BtcUtxo, Option<u32>)>>;

    /// Address of the watchtower that fronted this withdrawal, if any.
    async fn get_fronter_address(
        &self,
        owner: &str,
        vault_id: u64,
        btc_txid: &str,
    ) -> Result<Option<String>>;

    /// Chain-specific OP_RETURN payload for a withdrawal.
    fn encode_op_return_payload(&self, recipient: &str, raw_amounts: &[u64]) -> Result<Vec<u8>>;
}

/// Bitcoin JSON-RPC surface the engine consumes.
#[async_trait]
pub trait BitcoinRpc: Send + Sync {
    async fn get_transaction(&self, txid: &str) -> Result<Option<BtcTx>>;
    async fn get_address_utxos(&self, address: &str) -> Result<Vec<BtcUtxo>>;
    async fn is_spent(&self, txid: &str, vout: u32) -> Result<bool>;
    /// Current fee rate estimate in sat/vB.
    async fn get_fee_rate(&self) -> Result<u64>;
    async fn get_block_height(&self) -> Result<u32>;
    async fn broadcast(&self, tx_hex: &str) -> Result<String>;
}

/// Light-client relay synchronizer; supplies the sync transactions a claim
/// may need to carry when the on-chain relay lags behind bitcoin.
#[async_trait]
pub trait RelaySynchronizer: Send + Sync {
    async fn txs_sync_to(&self, height: u32) -> Result<Vec<ChainTx>>;
}

/// Payload published over the messenger gossip plane so watchtowers can
/// settle on the user's behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapClaimWitnessMessage {
    /// Serialized escrow [`SwapData`].
    pub data: serde_json::Value,
    /// Hex-encoded secret pre-image.
    pub secret: String,
}

/// The messenger gossip transport (e.g. Nostr); broadcast is opaque.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn broadcast(&self, message: SwapClaimWitnessMessage) -> Result<()>;
}

/// LNURL-withdraw counterparty: posts a generated invoice to the withdraw
/// callback so the counterparty pays it.
#[async_trait]
pub trait LnUrlWithdrawClient: Send + Sync {
    async fn submit_invoice(&self, callback_url: &str, k1: &str, invoice: &str) -> Result<()>;
}

/// External bitcoin wallet adapter used to fund and sign PSBTs when the SDK
/// is not operating a dedicated swap wallet.
#[async_trait]
pub trait BitcoinWallet: Send + Sync {
    /// Add funding inputs (and change) for everything the PSBT spends beyond
    /// its existing inputs. Fails with [`Error::NotEnoughBalance`] when the
    /// wallet cannot cover it.
    async fn fund_psbt(&self, psbt: bitcoin::Psbt, fee_rate: u64) -> Result<bitcoin::Psbt>;
    async fn sign_psbt(&self, psbt: bitcoin::Psbt) -> Result<bitcoin::Psbt>;
}

/// An on-chain event relevant to some swap, routed by
/// [`crate::events::UnifiedSwapEventListener`].
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// An escrow was initialized on the smart chain.
    Initialize {
        escrow_hash: String,
        claim_hash: String,
        txid: Option<String>,
    },
    /// An escrow was claimed, revealing the secret when HTLC-typed.
    Claim {
        escrow_hash: String,
        claim_hash: String,
        secret: Option<String>,
        txid: Option<String>,
    },
    /// An escrow was refunded to the offerer.
    Refund {
        escrow_hash: String,
        claim_hash: String,
        txid: Option<String>,
    },
    /// A watchtower fronted an SPV-vault withdrawal.
    SpvFront {
        btc_txid: String,
        owner: String,
        vault_id: u64,
        recipient: String,
    },
    /// A watchtower claimed an SPV-vault withdrawal after confirmations.
    SpvClaim {
        btc_txid: String,
        owner: String,
        vault_id: u64,
        recipient: String,
    },
    /// The contract rejected an SPV-vault withdrawal.
    SpvClose {
        btc_txid: String,
        owner: String,
        vault_id: u64,
    },
}

impl ChainEvent {
    /// The identifier binding this event to a persisted swap record: the
    /// escrow hash for escrow events, the bitcoin txid for vault events.
    pub fn swap_identifier(&self) -> &str {
        match self {
            ChainEvent::Initialize { escrow_hash, .. }
            | ChainEvent::Claim { escrow_hash, .. }
            | ChainEvent::Refund { escrow_hash, .. } => escrow_hash,
            ChainEvent::SpvFront { btc_txid, .. }
            | ChainEvent::SpvClaim { btc_txid, .. }
            | ChainEvent::SpvClose { btc_txid, .. } => btc_txid,
        }
    }

    /// Secondary identifier for escrow events: swaps whose escrow was
    /// initiated by the counterparty are on record under their claim hash
    /// until the escrow hash is learned.
    pub fn fallback_identifier(&self) -> Option<&str> {
        match self {
            ChainEvent::Initialize { claim_hash, .. }
            | ChainEvent::Claim { claim_hash, .. }
            | ChainEvent::Refund { claim_hash, .. } => Some(claim_hash),
            _ => None,
        }
    }
}

/// How often the address/tx watch loops poll the bitcoin RPC.
const BTC_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Wait until `txid` reaches `confirmations`, polling the RPC.
pub async fn wait_for_transaction(
    rpc: &dyn BitcoinRpc,
    txid: &str,
    confirmations: u32,
    cancel: Option<&CancelHandle>,
) -> Result<BtcTx> {
    loop {
        if let Some(tx) = rpc.get_transaction(txid).await? {
            if tx.confirmations >= confirmations {
                return Ok(tx);
            }
        }
        cancellable_sleep(BTC_POLL_INTERVAL, cancel).await?;
    }
}

/// Wait for a transaction paying `address` that satisfies `accept`, then for
/// its confirmations. `accept` sees the candidate UTXO and returns whether it
/// is the payment this swap expects.
pub async fn wait_for_address_txo(
    rpc: &dyn BitcoinRpc,
    address: &str,
    confirmations: u32,
    accept: impl Fn(&BtcUtxo) -> bool,
    cancel: Option<&CancelHandle>,
) -> Result<(BtcUtxo, BtcTx)> {
    let utxo = loop {
        let utxos = rpc.get_address_utxos(address).await?;
        if let Some(utxo) = utxos.into_iter().find(|u| accept(u)) {
            break utxo;
        }
        cancellable_sleep(BTC_POLL_INTERVAL, cancel).await?;
    };
    let tx = wait_for_transaction(rpc, &utxo.txid, confirmations, cancel).await?;
    Ok((utxo, tx))
}

impl BtcTx {
    /// Decode the raw transaction hex through the bitcoin crate.
    pub fn to_transaction(&self) -> Result<bitcoin::Transaction> {
        let bytes = hex::decode(&self.hex)
            .map_err(|e| Error::Parse(format!("Invalid transaction hex: {}", e)))?;
        bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| Error::Parse(format!("Invalid transaction: {}", e)))
    }
}
