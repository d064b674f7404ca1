//! PSBT assembly for SPV-vault withdrawals, and the one-shot P2WPKH swap
//! wallet.
//!
//! The withdrawal transaction has a fixed shape: input 0 spends the current
//! vault UTXO, inputs 1+ are user-funded, output 0 replays the vault, output
//! 1 is an OP_RETURN carrying the recipient and raw amounts, output 2 pays
//! the LP. The three fee-share rates are bit-packed into the sequence
//! numbers of inputs 0 and 1.

use crate::error::{Error, Result};
use crate::types::BtcUtxo;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::SighashCache;
use bitcoin::{
    Address, Amount, CompressedPublicKey, EcdsaSighashType, Network, OutPoint, Psbt, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness, absolute,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Fee-share fields must fit 20 bits.
const FEE_SHARE_MAX: u64 = 0xFFFFF;

/// Sequence of input 0: high bit, caller fee share in bits 0–19, the upper
/// 10 bits of the fronting fee share in bits 20–29.
pub fn sequence_0(caller_fee_share: u64, fronting_fee_share: u64) -> Result<Sequence> {
    check_fee_share("caller", caller_fee_share)?;
    check_fee_share("fronting", fronting_fee_share)?;
    Ok(Sequence(
        0x8000_0000 | (caller_fee_share as u32 & 0xFFFFF) | ((fronting_fee_share as u32 & 0xFFC00) << 10),
    ))
}

/// Sequence of input 1: high bit, execution fee share in bits 0–19, the
/// lower 10 bits of the fronting fee share in bits 20–29.
pub fn sequence_1(execution_fee_share: u64, fronting_fee_share: u64) -> Result<Sequence> {
    check_fee_share("execution", execution_fee_share)?;
    check_fee_share("fronting", fronting_fee_share)?;
    Ok(Sequence(
        0x8000_0000 | (execution_fee_share as u32 & 0xFFFFF) | ((fronting_fee_share as u32 & 0x3FF) << 20),
    ))
}

fn check_fee_share(name: &str, share: u64) -> Result<()> {
    if share > FEE_SHARE_MAX {
        return Err(Error::Intermediary(format!(
            "{} fee share {} exceeds 20 bits",
            name, share
        )));
    }
    Ok(())
}

/// Sequence applied to user inputs beyond input 1.
pub fn sequence_rest() -> Sequence {
    Sequence(0x8000_0000)
}

/// Everything fixed by the quote that the PSBT must encode.
#[derive(Debug, Clone)]
pub struct SpvPsbtParams {
    pub vault_utxo: BtcUtxo,
    pub vault_script: ScriptBuf,
    pub btc_destination_script: ScriptBuf,
    pub btc_amount: u64,
    pub caller_fee_share: u64,
    pub fronting_fee_share: u64,
    pub execution_fee_share: u64,
}

impl SpvPsbtParams {
    fn vault_outpoint(&self) -> Result<OutPoint> {
        Ok(OutPoint {
            txid: Txid::from_str(&self.vault_utxo.txid)
                .map_err(|e| Error::Parse(format!("Bad vault txid: {}", e)))?,
            vout: self.vault_utxo.vout,
        })
    }
}

/// A random locktime salt in `[500_000_000, 1_499_999_999]` guaranteeing
/// txid uniqueness without constraining mining.
fn locktime_salt() -> absolute::LockTime {
    let salt = 500_000_000 + rand::random::<u32>() % 1_000_000_000;
    absolute::LockTime::from_consensus(salt)
}

/// Assemble the unsigned withdrawal PSBT: vault input 0 with its packed
/// sequence, the vault replay, the OP_RETURN payload, and the LP output.
/// User inputs are added afterwards by a funder.
pub fn build_spv_psbt(params: &SpvPsbtParams, op_return_payload: Vec<u8>) -> Result<Psbt> {
    let payload = bitcoin::script::PushBytesBuf::try_from(op_return_payload)
        .map_err(|e| Error::Parse(format!("OP_RETURN payload too long: {}", e)))?;

    let tx = Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: locktime_salt(),
        input: vec![TxIn {
            previous_output: params.vault_outpoint()?,
            script_sig: ScriptBuf::new(),
            sequence: sequence_0(params.caller_fee_share, params.fronting_fee_share)?,
            witness: Witness::new(),
        }],
        output: vec![
            TxOut {
                value: Amount::from_sat(params.vault_utxo.value),
                script_pubkey: params.vault_script.clone(),
            },
            TxOut {
                value: Amount::ZERO,
                script_pubkey: ScriptBuf::new_op_return(payload),
            },
            TxOut {
                value: Amount::from_sat(params.btc_amount),
                script_pubkey: params.btc_destination_script.clone(),
            },
        ],
    };

    let mut psbt = Psbt::from_unsigned_tx(tx)
        .map_err(|e| Error::Bitcoin(format!("Failed to build PSBT: {}", e)))?;
    psbt.inputs[0].witness_utxo = Some(TxOut {
        value: Amount::from_sat(params.vault_utxo.value),
        script_pubkey: params.vault_script.clone(),
    });
    Ok(psbt)
}

/// Add the given UTXOs as inputs 1+, spending them exactly: whatever they
/// carry beyond the outputs becomes the mining fee.
pub fn fund_psbt_with_exact_utxos(
    mut psbt: Psbt,
    params: &SpvPsbtParams,
    utxos: &[BtcUtxo],
    owning_script: &ScriptBuf,
) -> Result<Psbt> {
    if utxos.is_empty() {
        return Err(Error::NotEnoughBalance("No UTXOs to fund with".into()));
    }
    for (i, utxo) in utxos.iter().enumerate() {
        let sequence = if i == 0 {
            sequence_1(params.execution_fee_share, params.fronting_fee_share)?
        } else {
            sequence_rest()
        };
        psbt.unsigned_tx.input.push(TxIn {
            previous_output: OutPoint {
                txid: Txid::from_str(&utxo.txid)
                    .map_err(|e| Error::Parse(format!("Bad funding txid: {}", e)))?,
                vout: utxo.vout,
            },
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        });
        psbt.inputs.push(bitcoin::psbt::Input {
            witness_utxo: Some(TxOut {
                value: Amount::from_sat(utxo.value),
                script_pubkey: owning_script.clone(),
            }),
            ..Default::default()
        });
    }

    let total_in: u64 = utxos.iter().map(|u| u.value).sum();
    let total_out: u64 = params.btc_amount;
    if total_in < total_out {
        return Err(Error::NotEnoughBalance(format!(
            "Funding inputs carry {} sats, {} needed",
            total_in, total_out
        )));
    }
    Ok(psbt)
}

/// The absolute fee an exactly-funded withdrawal pays: user input total
/// minus the LP output (the vault replays at par, the OP_RETURN is zero).
pub fn exact_funding_fee(params: &SpvPsbtParams, utxos: &[BtcUtxo]) -> u64 {
    let total_in: u64 = utxos.iter().map(|u| u.value).sum();
    total_in.saturating_sub(params.btc_amount)
}

// Deterministic vsize model for the fixed withdrawal shape.
const VSIZE_OVERHEAD: u64 = 11;
const VSIZE_VAULT_INPUT: u64 = 91;
const VSIZE_P2WPKH_INPUT: u64 = 68;
const VSIZE_OUTPUT: u64 = 43;

/// Estimated virtual size of a withdrawal with `user_inputs` P2WPKH funding
/// inputs and an OP_RETURN payload of `payload_len` bytes.
pub fn estimate_vsize(user_inputs: usize, payload_len: usize) -> u64 {
    VSIZE_OVERHEAD
        + VSIZE_VAULT_INPUT
        + VSIZE_P2WPKH_INPUT * user_inputs as u64
        + VSIZE_OUTPUT * 2
        + (payload_len as u64 + 11)
}

/// The network fee a single-input exactly-funded payment is expected to
/// carry at the given fee rate.
pub fn expected_network_fee(fee_rate: u64, payload_len: usize) -> u64 {
    fee_rate * estimate_vsize(1, payload_len)
}

/// Persisted form of the one-shot swap wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSwapWallet {
    pub wif: String,
    pub existing_utxos: Vec<BtcUtxo>,
}

/// A dedicated single-key P2WPKH wallet acting as a one-shot deposit
/// address for a vault swap.
#[derive(Clone)]
pub struct SwapBitcoinWallet {
    private_key: bitcoin::PrivateKey,
    public_key: CompressedPublicKey,
    address: Address,
}

impl SwapBitcoinWallet {
    pub fn generate(network: Network) -> Self {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        let private_key = bitcoin::PrivateKey::new(secret_key, network);
        let public_key = CompressedPublicKey::from_private_key(&secp, &private_key)
            .expect("compressed key from fresh private key");
        let address = Address::p2wpkh(&public_key, network);
        Self {
            private_key,
            public_key,
            address,
        }
    }

    pub fn from_wif(wif: &str, network: Network) -> Result<Self> {
        let secp = Secp256k1::new();
        let private_key = bitcoin::PrivateKey::from_wif(wif)
            .map_err(|e| Error::Parse(format!("Bad swap wallet WIF: {}", e)))?;
        let public_key = CompressedPublicKey::from_private_key(&secp, &private_key)
            .map_err(|e| Error::Bitcoin(format!("Bad swap wallet key: {}", e)))?;
        let address = Address::p2wpkh(&public_key, network);
        Ok(Self {
            private_key,
            public_key,
            address,
        })
    }

    pub fn to_wif(&self) -> String {
        self.private_key.to_wif()
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    /// Finalize every input this wallet owns with a P2WPKH ECDSA signature.
    pub fn sign_psbt(&self, mut psbt: Psbt) -> Result<Psbt> {
        let secp = Secp256k1::new();
        let script_pubkey = self.script_pubkey();
        let tx = psbt.unsigned_tx.clone();
        let mut cache = SighashCache::new(&tx);

        for (index, input) in psbt.inputs.iter_mut().enumerate() {
            let Some(witness_utxo) = input.witness_utxo.as_ref() else {
                continue;
            };
            if witness_utxo.script_pubkey != script_pubkey {
                continue;
            }
            let sighash = cache
                .p2wpkh_signature_hash(
                    index,
                    &witness_utxo.script_pubkey,
                    witness_utxo.value,
                    EcdsaSighashType::All,
                )
                .map_err(|e| Error::Bitcoin(format!("Sighash failed: {}", e)))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = bitcoin::ecdsa::Signature {
                signature: secp.sign_ecdsa(&message, &self.private_key.inner),
                sighash_type: EcdsaSighashType::All,
            };
            input.final_script_witness =
                Some(Witness::p2wpkh(&signature, &self.public_key.0));
        }
        Ok(psbt)
    }
}
