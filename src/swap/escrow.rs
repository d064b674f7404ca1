//! The escrow (PrTLC/HTLC) swap family.

pub mod from_btc;
pub mod from_ln;
pub mod to_btc;

use crate::chain::{EscrowContract, SignatureData, SwapData};
use crate::error::{Error, Result};
use crate::swap::SwapperOptions;
use crate::types::dec_u64_opt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Highest confirmation count the claim-hash replay will consider when the
/// LP did not state the requirement explicitly.
pub const MAX_INFERRED_CONFIRMATIONS: u32 = 20;

/// Escrow material common to every kind in the family, in persisted form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEscrow {
    /// Serialized chain-specific escrow data.
    pub data: serde_json::Value,
    pub signature: Option<SignatureData>,
    pub commit_txid: Option<String>,
    pub claim_txid: Option<String>,
    pub refund_txid: Option<String>,
}

/// Escrow material common to every kind in the family.
#[derive(Clone)]
pub struct EscrowDetails {
    pub data: Arc<dyn SwapData>,
    pub signature: Option<SignatureData>,
    pub commit_txid: Option<String>,
    pub claim_txid: Option<String>,
    pub refund_txid: Option<String>,
}

impl EscrowDetails {
    pub fn new(data: Arc<dyn SwapData>, signature: Option<SignatureData>) -> Self {
        Self {
            data,
            signature,
            commit_txid: None,
            claim_txid: None,
            refund_txid: None,
        }
    }

    pub fn to_stored(&self) -> StoredEscrow {
        StoredEscrow {
            data: self.data.serialize(),
            signature: self.signature.clone(),
            commit_txid: self.commit_txid.clone(),
            claim_txid: self.claim_txid.clone(),
            refund_txid: self.refund_txid.clone(),
        }
    }

    pub fn from_stored(contract: &dyn EscrowContract, stored: StoredEscrow) -> Result<Self> {
        Ok(Self {
            data: contract.deserialize_swap_data(stored.data)?,
            signature: stored.signature,
            commit_txid: stored.commit_txid,
            claim_txid: stored.claim_txid,
            refund_txid: stored.refund_txid,
        })
    }
}

/// The claimer bounty an LP must grant, derived from the configured
/// watchtower economics with the safety factor applied to the block span.
pub fn expected_claimer_bounty(options: &SwapperOptions) -> u128 {
    options.claimer_bounty_add_fee
        + options.claimer_bounty_fee_per_block
            * (options.claimer_bounty_block_delta as u128)
            * (options.claimer_bounty_safety_factor as u128)
}

/// Recover the confirmation requirement committed into an on-chain claim
/// hash by replaying `H(script ∥ amount ∥ confs)` for confs ∈ [1, 20].
pub fn infer_required_confirmations(
    contract: &dyn EscrowContract,
    script: &[u8],
    amount: u64,
    claim_hash: &str,
) -> Option<u32> {
    (1..=MAX_INFERRED_CONFIRMATIONS).find(|confs| {
        hex::encode(contract.get_hash_for_onchain(script, amount, *confs)) == claim_hash
    })
}

/// Parse a bitcoin address into its locking script, against the configured
/// network.
pub fn locking_script(address: &str, network: bitcoin::Network) -> Result<Vec<u8>> {
    let address = address
        .parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()
        .map_err(|e| Error::Intermediary(format!("Invalid bitcoin address: {}", e)))?
        .require_network(network)
        .map_err(|e| Error::Intermediary(format!("Bitcoin address network mismatch: {}", e)))?;
    Ok(address.script_pubkey().to_bytes())
}

/// Bitcoin-side payment amounts of a Lightning escrow swap, persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LnAmounts {
    #[serde(with = "dec_u64_opt")]
    pub btc_amount_swap: Option<u64>,
    #[serde(with = "dec_u64_opt")]
    pub btc_amount_gas: Option<u64>,
}

impl LnAmounts {
    /// Satoshis the invoice carries net of the LP's fee take.
    ///
    /// A zero swap amount is treated as unknown rather than as a free swap.
    pub fn input_amount_without_fee(&self, swap_fee_btc: u64) -> Option<u64> {
        let swap = self.btc_amount_swap.filter(|amount| *amount != 0)?;
        Some(swap + self.btc_amount_gas.unwrap_or(0) - swap_fee_btc.min(swap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockEscrowContract;

    #[test]
    fn test_infer_required_confirmations() {
        let contract = MockEscrowContract::default();
        let script = b"\x00\x14somescripthash000000".to_vec();
        let claim_hash = MockEscrowContract::onchain_hash(&script, 1000, 3);
        assert_eq!(
            infer_required_confirmations(&contract, &script, 1000, &claim_hash),
            Some(3)
        );
        assert_eq!(
            infer_required_confirmations(&contract, &script, 999, &claim_hash),
            None
        );
    }

    #[test]
    fn test_input_amount_without_fee_zero_is_unknown() {
        let amounts = LnAmounts {
            btc_amount_swap: Some(0),
            btc_amount_gas: Some(500),
        };
        assert_eq!(amounts.input_amount_without_fee(1), None);

        let amounts = LnAmounts {
            btc_amount_swap: Some(10_000),
            btc_amount_gas: None,
        };
        assert_eq!(amounts.input_amount_without_fee(100), Some(9_900));

        let amounts = LnAmounts {
            btc_amount_swap: Some(10_000),
            btc_amount_gas: Some(500),
        };
        assert_eq!(amounts.input_amount_without_fee(100), Some(10_400));
    }

    #[test]
    fn test_expected_claimer_bounty() {
        let options = SwapperOptions {
            claimer_bounty_fee_per_block: 10,
            claimer_bounty_block_delta: 100,
            claimer_bounty_add_fee: 5,
            claimer_bounty_safety_factor: 2,
            ..SwapperOptions::default()
        };
        assert_eq!(expected_claimer_bounty(&options), 5 + 10 * 100 * 2);
    }
}
