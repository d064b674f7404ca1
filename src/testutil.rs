//! Mock collaborators for unit tests: a programmable smart chain, SPV
//! contract, bitcoin RPC and LP, wired into a [`SwapContext`].

use crate::api::*;
use crate::chain::*;
use crate::error::{Error, Result};
use crate::price::providers::{CoinBinding, PriceProvider, Ticker};
use crate::price::{RedundantSwapPrice, RedundantSwapPriceConfig};
use crate::storage::memory::MemoryStorage;
use crate::swap::{SwapContext, SwapperOptions};
use crate::types::BtcUtxo;
use crate::utils::CancelHandle;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

pub const MOCK_CHAIN_ID: &str = "MOCKCHAIN";
pub const MOCK_TOKEN: &str = "0xTOKEN";
pub const MOCK_GAS_TOKEN: &str = "0xGAS";

/// Escrow data used across the escrow-family tests.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MockSwapData {
    pub claimer: String,
    pub offerer: String,
    pub amount: u128,
    pub token: String,
    pub deposit_token: String,
    pub security_deposit: u128,
    pub claimer_bounty: u128,
    pub claim_hash: String,
    pub escrow_hash: String,
    pub expiry: u64,
    pub escrow_type: EscrowType,
    pub sequence: u64,
    pub pay_in: bool,
    pub pay_out: bool,
    pub success_action: bool,
}

impl Default for MockSwapData {
    fn default() -> Self {
        Self {
            claimer: "0xUSER".into(),
            offerer: "0xLP".into(),
            amount: 1_000_000,
            token: MOCK_TOKEN.into(),
            deposit_token: MOCK_GAS_TOKEN.into(),
            security_deposit: 0,
            claimer_bounty: 0,
            claim_hash: "00".repeat(32),
            escrow_hash: "11".repeat(32),
            expiry: u64::MAX,
            escrow_type: EscrowType::Chain,
            sequence: 7,
            pay_in: false,
            pay_out: true,
            success_action: false,
        }
    }
}

impl SwapData for MockSwapData {
    fn claimer(&self) -> String {
        self.claimer.clone()
    }
    fn offerer(&self) -> String {
        self.offerer.clone()
    }
    fn amount(&self) -> u128 {
        self.amount
    }
    fn token(&self) -> String {
        self.token.clone()
    }
    fn deposit_token(&self) -> String {
        self.deposit_token.clone()
    }
    fn security_deposit(&self) -> u128 {
        self.security_deposit
    }
    fn claimer_bounty(&self) -> u128 {
        self.claimer_bounty
    }
    fn claim_hash(&self) -> String {
        self.claim_hash.clone()
    }
    fn escrow_hash(&self) -> String {
        self.escrow_hash.clone()
    }
    fn expiry(&self) -> u64 {
        self.expiry
    }
    fn escrow_type(&self) -> EscrowType {
        self.escrow_type
    }
    fn sequence(&self) -> u64 {
        self.sequence
    }
    fn is_pay_in(&self) -> bool {
        self.pay_in
    }
    fn is_pay_out(&self) -> bool {
        self.pay_out
    }
    fn has_success_action(&self) -> bool {
        self.success_action
    }
    fn serialize(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("mock swap data serializes")
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Deterministic valid regtest P2WPKH address derived from a seed byte.
pub fn test_btc_address(seed: u8) -> String {
    let secp = bitcoin::secp256k1::Secp256k1::new();
    let sk = bitcoin::secp256k1::SecretKey::from_slice(&[seed; 32]).expect("non-zero seed");
    let pk = bitcoin::PrivateKey::new(sk, bitcoin::Network::Regtest);
    let cpk = bitcoin::CompressedPublicKey::from_private_key(&secp, &pk).expect("compressed");
    bitcoin::Address::p2wpkh(&cpk, bitcoin::Network::Regtest).to_string()
}

#[derive(Default)]
pub struct MockEscrowContract {
    pub commit_status: Mutex<HashMap<String, EscrowStatus>>,
    pub committed_data: Mutex<HashMap<String, Arc<dyn SwapData>>>,
    pub init_auth_expired: Mutex<HashSet<String>>,
    pub escrow_expired: Mutex<HashSet<String>>,
    /// `(operation, escrow_hash)` per send_and_confirm call.
    pub sent: Mutex<Vec<(String, String)>>,
}

impl MockEscrowContract {
    pub fn set_status(&self, escrow_hash: &str, status: EscrowStatus) {
        self.commit_status
            .lock()
            .unwrap()
            .insert(escrow_hash.to_string(), status);
    }

    /// The claim hash this mock computes for an on-chain tuple.
    pub fn onchain_hash(script: &[u8], amount: u64, confirmations: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(script);
        hasher.update(amount.to_be_bytes());
        hasher.update(confirmations.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl EscrowContract for MockEscrowContract {
    fn deserialize_swap_data(&self, value: serde_json::Value) -> Result<Arc<dyn SwapData>> {
        let data: MockSwapData = serde_json::from_value(value)?;
        Ok(Arc::new(data))
    }

    async fn get_commit_status(
        &self,
        _initiator: &str,
        data: &dyn SwapData,
    ) -> Result<EscrowStatus> {
        Ok(self
            .commit_status
            .lock()
            .unwrap()
            .get(&data.escrow_hash())
            .cloned()
            .unwrap_or(EscrowStatus::NotCommitted))
    }

    async fn get_committed_data(&self, claim_hash: &str) -> Result<Option<Arc<dyn SwapData>>> {
        Ok(self.committed_data.lock().unwrap().get(claim_hash).cloned())
    }

    async fn is_init_authorization_expired(
        &self,
        data: &dyn SwapData,
        _signature: &SignatureData,
    ) -> Result<bool> {
        Ok(self
            .init_auth_expired
            .lock()
            .unwrap()
            .contains(&data.escrow_hash()))
    }

    async fn is_expired(&self, _initiator: &str, data: &dyn SwapData) -> Result<bool> {
        Ok(self
            .escrow_expired
            .lock()
            .unwrap()
            .contains(&data.escrow_hash()))
    }

    fn get_hash_for_onchain(&self, script: &[u8], amount: u64, confirmations: u32) -> Vec<u8> {
        hex::decode(Self::onchain_hash(script, amount, confirmations)).unwrap()
    }

    fn get_hash_for_htlc(&self, secret: &[u8]) -> Vec<u8> {
        Sha256::digest(secret).to_vec()
    }

    fn get_extra_data(&self, script: &[u8], amount: u64, sequence: u64) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"extra");
        hasher.update(script);
        hasher.update(amount.to_be_bytes());
        hasher.update(sequence.to_be_bytes());
        hasher.finalize().to_vec()
    }

    async fn txs_init(
        &self,
        data: &dyn SwapData,
        _signature: &SignatureData,
    ) -> Result<Vec<ChainTx>> {
        Ok(vec![ChainTx(
            serde_json::json!({"op": "init", "escrowHash": data.escrow_hash()}),
        )])
    }

    async fn txs_claim_with_tx_data(
        &self,
        _signer: &str,
        data: &dyn SwapData,
        _tx: &BtcTxProof,
        _required_confirmations: u32,
        _vout: u32,
        _synchronizer: Option<&dyn RelaySynchronizer>,
    ) -> Result<Vec<ChainTx>> {
        Ok(vec![ChainTx(
            serde_json::json!({"op": "claimTxData", "escrowHash": data.escrow_hash()}),
        )])
    }

    async fn txs_claim_with_secret(
        &self,
        _signer: &str,
        data: &dyn SwapData,
        _secret: &[u8],
    ) -> Result<Vec<ChainTx>> {
        Ok(vec![ChainTx(
            serde_json::json!({"op": "claimSecret", "escrowHash": data.escrow_hash()}),
        )])
    }

    async fn txs_refund(&self, _signer: &str, data: &dyn SwapData) -> Result<Vec<ChainTx>> {
        Ok(vec![ChainTx(
            serde_json::json!({"op": "refund", "escrowHash": data.escrow_hash()}),
        )])
    }

    async fn send_and_confirm(
        &self,
        _signer: &dyn SignerCapability,
        txs: Vec<ChainTx>,
        _cancel: Option<&CancelHandle>,
    ) -> Result<String> {
        let mut sent = self.sent.lock().unwrap();
        for tx in &txs {
            sent.push((
                tx.0["op"].as_str().unwrap_or("").to_string(),
                tx.0["escrowHash"].as_str().unwrap_or("").to_string(),
            ));
        }
        Ok(format!("mocktx{}", sent.len()))
    }
}

/// Withdrawal data the mock SPV contract parses out of a real transaction
/// built by the PSBT assembler.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MockWithdrawalData {
    pub recipient: String,
    pub raw_amounts: Vec<u64>,
    pub caller_fee_rate: u64,
    pub fronting_fee_rate: u64,
    pub execution_fee_rate: u64,
    pub spent_vault_utxo: String,
    pub new_vault_btc_amount: u64,
    pub new_vault_script: Vec<u8>,
    pub tx_id: String,
    pub btc_tx: BtcTx,
}

impl SpvWithdrawalData for MockWithdrawalData {
    fn is_recipient(&self, address: &str) -> bool {
        self.recipient == address
    }
    fn recipient(&self) -> String {
        self.recipient.clone()
    }
    fn raw_amounts(&self) -> Vec<u64> {
        self.raw_amounts.clone()
    }
    fn caller_fee_rate(&self) -> u64 {
        self.caller_fee_rate
    }
    fn fronting_fee_rate(&self) -> u64 {
        self.fronting_fee_rate
    }
    fn execution_fee_rate(&self) -> u64 {
        self.execution_fee_rate
    }
    fn spent_vault_utxo(&self) -> String {
        self.spent_vault_utxo.clone()
    }
    fn new_vault_btc_amount(&self) -> u64 {
        self.new_vault_btc_amount
    }
    fn new_vault_script(&self) -> Vec<u8> {
        self.new_vault_script.clone()
    }
    fn execution_data(&self) -> Option<Vec<u8>> {
        None
    }
    fn tx_id(&self) -> String {
        self.tx_id.clone()
    }
    fn btc_tx(&self) -> BtcTx {
        self.btc_tx.clone()
    }
    fn serialize(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("mock withdrawal serializes")
    }
}

#[derive(Default)]
pub struct MockSpvContract {
    pub withdrawal_state: Mutex<HashMap<String, SpvWithdrawalState>>,
    pub vault_latest_utxo: Mutex<HashMap<(String, u64), (BtcUtxo, Option<u32>)>>,
    pub fronter: Mutex<HashMap<String, String>>,
}

impl MockSpvContract {
    /// The OP_RETURN payload layout this mock both encodes and decodes:
    /// `len(recipient) ∥ recipient ∥ be64(amount)…`.
    fn decode_payload(payload: &[u8]) -> Result<(String, Vec<u64>)> {
        let len = *payload
            .first()
            .ok_or_else(|| Error::Parse("Empty withdrawal payload".into()))?
            as usize;
        if payload.len() < 1 + len {
            return Err(Error::Parse("Truncated withdrawal payload".into()));
        }
        let recipient = String::from_utf8(payload[1..1 + len].to_vec())
            .map_err(|_| Error::Parse("Bad recipient encoding".into()))?;
        let mut amounts = Vec::new();
        let mut rest = &payload[1 + len..];
        while rest.len() >= 8 {
            amounts.push(u64::from_be_bytes(rest[..8].try_into().unwrap()));
            rest = &rest[8..];
        }
        Ok((recipient, amounts))
    }
}

#[async_trait]
impl SpvContract for MockSpvContract {
    async fn parse_withdrawal(&self, tx_hex: &str) -> Result<Arc<dyn SpvWithdrawalData>> {
        let bytes =
            hex::decode(tx_hex).map_err(|e| Error::Parse(format!("Bad tx hex: {}", e)))?;
        let tx: bitcoin::Transaction = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| Error::Parse(format!("Bad transaction: {}", e)))?;

        if tx.input.len() < 2 || tx.output.len() < 3 {
            return Err(Error::Parse("Not a withdrawal transaction".into()));
        }

        let op_return = tx.output[1].script_pubkey.as_bytes();
        if op_return.first() != Some(&0x6a) {
            return Err(Error::Parse("Output 1 is not OP_RETURN".into()));
        }
        // Skip OP_RETURN + push opcode (direct push or OP_PUSHDATA1).
        let payload = match op_return.get(1) {
            Some(0x4c) => &op_return[3..],
            Some(_) => &op_return[2..],
            None => return Err(Error::Parse("Empty OP_RETURN".into())),
        };
        let (recipient, raw_amounts) = Self::decode_payload(payload)?;

        let seq0 = tx.input[0].sequence.0 as u64;
        let seq1 = tx.input[1].sequence.0 as u64;
        let caller_fee_rate = seq0 & 0xFFFFF;
        let execution_fee_rate = seq1 & 0xFFFFF;
        let fronting_fee_rate = ((seq0 >> 10) & 0xFFC00) | ((seq1 >> 20) & 0x3FF);

        let txid = tx.compute_txid().to_string();
        let btc_tx = BtcTx {
            txid: txid.clone(),
            hex: tx_hex.to_string(),
            confirmations: 0,
            block_height: None,
            blockhash: None,
            outs: tx
                .output
                .iter()
                .map(|o| BtcTxOut {
                    value: o.value.to_sat(),
                    script_hex: hex::encode(o.script_pubkey.as_bytes()),
                })
                .collect(),
            ins: tx
                .input
                .iter()
                .map(|i| BtcTxIn {
                    txid: i.previous_output.txid.to_string(),
                    vout: i.previous_output.vout,
                    sequence: i.sequence.0,
                })
                .collect(),
        };

        Ok(Arc::new(MockWithdrawalData {
            recipient,
            raw_amounts,
            caller_fee_rate,
            fronting_fee_rate,
            execution_fee_rate,
            spent_vault_utxo: format!(
                "{}:{}",
                tx.input[0].previous_output.txid, tx.input[0].previous_output.vout
            ),
            new_vault_btc_amount: tx.output[0].value.to_sat(),
            new_vault_script: tx.output[0].script_pubkey.as_bytes().to_vec(),
            tx_id: txid,
            btc_tx,
        }))
    }

    fn deserialize_withdrawal(
        &self,
        value: serde_json::Value,
    ) -> Result<Arc<dyn SpvWithdrawalData>> {
        let data: MockWithdrawalData = serde_json::from_value(value)?;
        Ok(Arc::new(data))
    }

    async fn get_withdrawal_state(&self, btc_txid: &str) -> Result<SpvWithdrawalState> {
        Ok(self
            .withdrawal_state
            .lock()
            .unwrap()
            .get(btc_txid)
            .cloned()
            .unwrap_or(SpvWithdrawalState::NotFound))
    }

    async fn get_vault_latest_utxo(
        &self,
        owner: &str,
        vault_id: u64,
    ) -> Result<Option<(BtcUtxo, Option<u32>)>> {
        Ok(self
            .vault_latest_utxo
            .lock()
            .unwrap()
            .get(&(owner.to_string(), vault_id))
            .cloned())
    }

    async fn get_fronter_address(
        &self,
        _owner: &str,
        _vault_id: u64,
        btc_txid: &str,
    ) -> Result<Option<String>> {
        Ok(self.fronter.lock().unwrap().get(btc_txid).cloned())
    }

    fn encode_op_return_payload(&self, recipient: &str, raw_amounts: &[u64]) -> Result<Vec<u8>> {
        if recipient.len() > u8::MAX as usize {
            return Err(Error::Parse("Recipient too long".into()));
        }
        let mut payload = vec![recipient.len() as u8];
        payload.extend_from_slice(recipient.as_bytes());
        for amount in raw_amounts {
            payload.extend_from_slice(&amount.to_be_bytes());
        }
        Ok(payload)
    }
}

#[derive(Default)]
pub struct MockBitcoinRpc {
    pub txs: Mutex<HashMap<String, BtcTx>>,
    pub address_utxos: Mutex<HashMap<String, Vec<BtcUtxo>>>,
    pub spent: Mutex<HashSet<String>>,
    pub fee_rate: Mutex<u64>,
    pub height: Mutex<u32>,
}

impl MockBitcoinRpc {
    pub fn add_tx(&self, tx: BtcTx) {
        self.txs.lock().unwrap().insert(tx.txid.clone(), tx);
    }

    pub fn add_utxo(&self, address: &str, utxo: BtcUtxo) {
        self.address_utxos
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push(utxo);
    }

    pub fn mark_spent(&self, outpoint: &str) {
        self.spent.lock().unwrap().insert(outpoint.to_string());
    }
}

#[async_trait]
impl BitcoinRpc for MockBitcoinRpc {
    async fn get_transaction(&self, txid: &str) -> Result<Option<BtcTx>> {
        Ok(self.txs.lock().unwrap().get(txid).cloned())
    }

    async fn get_address_utxos(&self, address: &str) -> Result<Vec<BtcUtxo>> {
        Ok(self
            .address_utxos
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_spent(&self, txid: &str, vout: u32) -> Result<bool> {
        Ok(self
            .spent
            .lock()
            .unwrap()
            .contains(&format!("{}:{}", txid, vout)))
    }

    async fn get_fee_rate(&self) -> Result<u64> {
        Ok(*self.fee_rate.lock().unwrap())
    }

    async fn get_block_height(&self) -> Result<u32> {
        Ok(*self.height.lock().unwrap())
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String> {
        let bytes =
            hex::decode(tx_hex).map_err(|e| Error::Parse(format!("Bad tx hex: {}", e)))?;
        let tx: bitcoin::Transaction = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| Error::Parse(format!("Bad transaction: {}", e)))?;
        Ok(tx.compute_txid().to_string())
    }
}

pub struct MockChain {
    pub tx_status: Mutex<HashMap<String, TxStatus>>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self {
            tx_status: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ChainInterface for MockChain {
    fn chain_identifier(&self) -> String {
        MOCK_CHAIN_ID.to_string()
    }

    async fn get_tx_status(&self, txid: &str) -> Result<TxStatus> {
        Ok(self
            .tx_status
            .lock()
            .unwrap()
            .get(txid)
            .copied()
            .unwrap_or(TxStatus::NotFound))
    }
}

#[derive(Default)]
pub struct MockMessenger {
    pub broadcasts: Mutex<Vec<SwapClaimWitnessMessage>>,
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn broadcast(&self, message: SwapClaimWitnessMessage) -> Result<()> {
        self.broadcasts.lock().unwrap().push(message);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockLnUrlClient {
    pub submitted: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl LnUrlWithdrawClient for MockLnUrlClient {
    async fn submit_invoice(&self, callback_url: &str, k1: &str, invoice: &str) -> Result<()> {
        self.submitted.lock().unwrap().push((
            callback_url.to_string(),
            k1.to_string(),
            invoice.to_string(),
        ));
        Ok(())
    }
}

/// Programmable LP: fixed quote responses, a scripted invoice-status
/// sequence, and call counters.
#[derive(Default)]
pub struct MockApi {
    pub from_btc_quote: Mutex<Option<FromBtcQuoteResponse>>,
    pub from_ln_quote: Mutex<Option<FromLnQuoteResponse>>,
    pub spv_quote: Mutex<Option<SpvQuoteResponse>>,
    pub ln_gas_quote: Mutex<Option<LnForGasQuoteResponse>>,
    pub onchain_gas_quote: Mutex<Option<OnchainForGasQuoteResponse>>,
    pub to_btc_quote: Mutex<Option<ToBtcQuoteResponse>>,
    pub invoice_statuses: Mutex<VecDeque<InvoiceStatusResponse>>,
    pub payment_statuses: Mutex<VecDeque<PaymentStatusResponse>>,
    pub psbt_posts: Mutex<Vec<(String, String)>>,
    /// When set, `post_spv_psbt` fails with this intermediary message.
    pub decline_psbt: Mutex<Option<String>>,
}

impl MockApi {
    fn take_or_err<T: Clone>(slot: &Mutex<Option<T>>, what: &str) -> Result<T> {
        slot.lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Request(format!("mock {} not configured", what)))
    }
}

#[async_trait]
impl IntermediaryApi for MockApi {
    async fn get_from_btc_quote(
        &self,
        _lp_url: &str,
        request: &FromBtcQuoteRequest,
    ) -> Result<FromBtcQuoteResponse> {
        let mut quote: FromBtcQuoteResponse =
            Self::take_or_err(&self.from_btc_quote, "frombtc quote")?;
        // Echo the request's random sequence the way a real LP would: the
        // escrow data carries it and the extra data commits to it.
        if let Ok(mut data) = serde_json::from_value::<MockSwapData>(quote.data.clone()) {
            data.sequence = request.sequence;
            data.claimer = request.address.clone();
            quote.data = data.serialize();
        }
        if quote.extra_data.is_empty() {
            let script = quote
                .btc_address
                .parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()
                .ok()
                .map(|a| a.assume_checked().script_pubkey().to_bytes())
                .unwrap_or_default();
            let contract = MockEscrowContract::default();
            quote.extra_data =
                hex::encode(contract.get_extra_data(&script, quote.amount, request.sequence));
        }
        Ok(quote)
    }

    async fn get_from_ln_quote(
        &self,
        _lp_url: &str,
        _request: &FromLnQuoteRequest,
    ) -> Result<FromLnQuoteResponse> {
        Self::take_or_err(&self.from_ln_quote, "frombtcln quote")
    }

    async fn get_spv_quote(
        &self,
        _lp_url: &str,
        _request: &FromBtcQuoteRequest,
    ) -> Result<SpvQuoteResponse> {
        Self::take_or_err(&self.spv_quote, "spv quote")
    }

    async fn post_spv_psbt(&self, _lp_url: &str, quote_id: &str, psbt_hex: &str) -> Result<()> {
        if let Some(msg) = self.decline_psbt.lock().unwrap().clone() {
            return Err(Error::Intermediary(msg));
        }
        self.psbt_posts
            .lock()
            .unwrap()
            .push((quote_id.to_string(), psbt_hex.to_string()));
        Ok(())
    }

    async fn get_invoice_status(
        &self,
        _lp_url: &str,
        _payment_hash: &str,
    ) -> Result<InvoiceStatusResponse> {
        let mut statuses = self.invoice_statuses.lock().unwrap();
        if statuses.len() > 1 {
            Ok(statuses.pop_front().unwrap())
        } else {
            statuses
                .front()
                .cloned()
                .ok_or_else(|| Error::Request("mock invoice status not configured".into()))
        }
    }

    async fn get_ln_for_gas_quote(
        &self,
        _lp_url: &str,
        _request: &TrustedGasQuoteRequest,
    ) -> Result<LnForGasQuoteResponse> {
        Self::take_or_err(&self.ln_gas_quote, "lnforgas quote")
    }

    async fn get_onchain_for_gas_quote(
        &self,
        _lp_url: &str,
        _request: &TrustedGasQuoteRequest,
    ) -> Result<OnchainForGasQuoteResponse> {
        Self::take_or_err(&self.onchain_gas_quote, "onchainforgas quote")
    }

    async fn get_to_btc_quote(
        &self,
        _lp_url: &str,
        request: &ToBtcQuoteRequest,
    ) -> Result<ToBtcQuoteResponse> {
        let mut quote: ToBtcQuoteResponse =
            Self::take_or_err(&self.to_btc_quote, "tobtc quote")?;
        if let Ok(mut data) = serde_json::from_value::<MockSwapData>(quote.data.clone()) {
            data.sequence = request.sequence;
            quote.data = data.serialize();
        }
        Ok(quote)
    }

    async fn get_to_ln_quote(
        &self,
        _lp_url: &str,
        request: &ToBtcQuoteRequest,
    ) -> Result<ToBtcQuoteResponse> {
        self.get_to_btc_quote(_lp_url, request).await
    }

    async fn get_payment_status(
        &self,
        _lp_url: &str,
        _payment_hash: &str,
    ) -> Result<PaymentStatusResponse> {
        let mut statuses = self.payment_statuses.lock().unwrap();
        if statuses.len() > 1 {
            Ok(statuses.pop_front().unwrap())
        } else {
            statuses
                .front()
                .cloned()
                .ok_or_else(|| Error::Request("mock payment status not configured".into()))
        }
    }
}

/// Price provider pinned to a constant BTC-per-token price.
pub struct FixedPriceProvider {
    pub price_btc: Decimal,
}

#[async_trait]
impl PriceProvider for FixedPriceProvider {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn fetch_price(&self, _ticker: &Ticker) -> Result<Decimal> {
        Ok(self.price_btc)
    }

    async fn fetch_usd_price(&self) -> Result<Decimal> {
        Ok(Decimal::from(100_000))
    }
}

pub struct MockSigner(pub String);

impl SignerCapability for MockSigner {
    fn address(&self) -> String {
        self.0.clone()
    }
}

/// Every mock collaborator, pre-wired; tweak the parts, then build the
/// context.
pub struct MockWorld {
    pub chain: Arc<MockChain>,
    pub contract: Arc<MockEscrowContract>,
    pub spv_contract: Arc<MockSpvContract>,
    pub btc_rpc: Arc<MockBitcoinRpc>,
    pub messenger: Arc<MockMessenger>,
    pub lnurl: Arc<MockLnUrlClient>,
    pub api: Arc<MockApi>,
    pub storage: Arc<MemoryStorage>,
    pub options: SwapperOptions,
}

impl MockWorld {
    pub fn new() -> Self {
        Self {
            chain: Arc::new(MockChain::default()),
            contract: Arc::new(MockEscrowContract::default()),
            spv_contract: Arc::new(MockSpvContract::default()),
            btc_rpc: Arc::new(MockBitcoinRpc::default()),
            messenger: Arc::new(MockMessenger::default()),
            lnurl: Arc::new(MockLnUrlClient::default()),
            api: Arc::new(MockApi::default()),
            storage: Arc::new(MemoryStorage::new()),
            options: SwapperOptions {
                min_send_window: std::time::Duration::from_secs(0),
                ..SwapperOptions::default()
            },
        }
    }

    /// 10_000 usat per base unit for both mock tokens (0.01 BTC per whole
    /// token at 8 decimals).
    pub fn oracle() -> Arc<RedundantSwapPrice> {
        let tickers: HashMap<String, Ticker> =
            [("fixed".to_string(), Ticker::new("TOKBTC"))].into();
        Arc::new(RedundantSwapPrice::new(
            vec![Arc::new(FixedPriceProvider {
                price_btc: Decimal::new(1, 2),
            })],
            vec![
                CoinBinding {
                    chain_id: MOCK_CHAIN_ID.into(),
                    token: MOCK_TOKEN.into(),
                    decimals: 8,
                    tickers: tickers.clone(),
                },
                CoinBinding {
                    chain_id: MOCK_CHAIN_ID.into(),
                    token: MOCK_GAS_TOKEN.into(),
                    decimals: 8,
                    tickers,
                },
            ],
            RedundantSwapPriceConfig::default(),
        ))
    }

    pub fn context(&self) -> Arc<SwapContext> {
        Arc::new(SwapContext {
            btc_network: bitcoin::Network::Regtest,
            chain: self.chain.clone(),
            contract: self.contract.clone(),
            spv_contract: self.spv_contract.clone(),
            btc_rpc: self.btc_rpc.clone(),
            synchronizer: None,
            messenger: Some(self.messenger.clone()),
            lnurl: Some(self.lnurl.clone()),
            api: self.api.clone(),
            prices: Self::oracle(),
            storage: self.storage.clone(),
            options: self.options.clone(),
        })
    }
}

pub fn mock_context() -> Arc<SwapContext> {
    MockWorld::new().context()
}
