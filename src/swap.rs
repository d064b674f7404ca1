//! The per-swap protocol engine: shared swap state, the swap capability
//! trait, and the per-kind state machines.

pub mod escrow;
pub mod spv;
pub mod trusted;
pub mod wrapper;

use crate::api::IntermediaryApi;
use crate::chain::{
    BitcoinRpc, ChainInterface, EscrowContract, LnUrlWithdrawClient, Messenger, RelaySynchronizer,
    SpvContract,
};
use crate::error::{Error, Result};
use crate::events::{SwapEventEmitter, SwapStateEvent};
use crate::price::RedundantSwapPrice;
use crate::storage::UnifiedStorage;
use crate::types::{PriceInfo, PricingInfo, SwapDirection, SwapKind, dec_u64, dec_u128};
use crate::utils::{CancelHandle, cancellable, now_millis};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Current version of the persisted swap schema.
pub const SWAP_SCHEMA_VERSION: u32 = 1;

/// Tuning knobs shared by every wrapper.
#[derive(Debug, Clone)]
pub struct SwapperOptions {
    /// How long `execute` waits for a watchtower before telling the user to
    /// claim manually.
    pub max_wait_till_automatic_settlement: Duration,
    /// Minimum remaining quote validity the LP must grant.
    pub min_send_window: Duration,
    /// Expected claimer bounty: `fee_per_block * block_delta * safety + add_fee`.
    pub claimer_bounty_fee_per_block: u128,
    pub claimer_bounty_block_delta: u64,
    pub claimer_bounty_add_fee: u128,
    pub claimer_bounty_safety_factor: u64,
    /// Grace period after soft expiry before a quote is definitively expired
    /// for kinds without an on-chain authorization to check.
    pub definitive_expiry_grace: Duration,
}

impl Default for SwapperOptions {
    fn default() -> Self {
        Self {
            max_wait_till_automatic_settlement: Duration::from_secs(60),
            min_send_window: Duration::from_secs(30 * 60),
            claimer_bounty_fee_per_block: 0,
            claimer_bounty_block_delta: 0,
            claimer_bounty_add_fee: 0,
            claimer_bounty_safety_factor: 2,
            definitive_expiry_grace: Duration::from_secs(1000),
        }
    }
}

/// Shared collaborators every swap needs; swaps hold this as a non-owning
/// handle to their wrapper's world.
pub struct SwapContext {
    /// Bitcoin network addresses are parsed against.
    pub btc_network: bitcoin::Network,
    pub chain: Arc<dyn ChainInterface>,
    pub contract: Arc<dyn EscrowContract>,
    pub spv_contract: Arc<dyn SpvContract>,
    pub btc_rpc: Arc<dyn BitcoinRpc>,
    pub synchronizer: Option<Arc<dyn RelaySynchronizer>>,
    pub messenger: Option<Arc<dyn Messenger>>,
    pub lnurl: Option<Arc<dyn LnUrlWithdrawClient>>,
    pub api: Arc<dyn IntermediaryApi>,
    pub prices: Arc<RedundantSwapPrice>,
    pub storage: Arc<dyn UnifiedStorage>,
    pub options: SwapperOptions,
}

/// How [`wait_till_state`](SwapCommon::wait_till_state) compares states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCompare {
    Eq,
    Gte,
    Neq,
}

impl StateCompare {
    pub fn matches(self, state: i32, target: i32) -> bool {
        match self {
            StateCompare::Eq => state == target,
            StateCompare::Gte => state >= target,
            StateCompare::Neq => state != target,
        }
    }
}

/// A typed per-kind state enum, persisted as its numeric value.
pub trait SwapState: Copy + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    fn to_i32(self) -> i32;
    fn from_i32(value: i32) -> Result<Self>
    where
        Self: Sized;
    fn is_terminal(self) -> bool;
    fn is_success(self) -> bool;
    /// The terminal state meaning the quote lapsed unused.
    fn is_quote_expired(self) -> bool;
    /// The allowed transition graph, as data, so conformance tests can
    /// enumerate it.
    fn transitions() -> &'static [(Self, Self)]
    where
        Self: Sized;

    fn can_transition(from: Self, to: Self) -> bool
    where
        Self: Sized,
    {
        Self::transitions()
            .iter()
            .any(|(f, t)| *f == from && *t == to)
    }
}

/// Pricing fields as they appear in a persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPricing {
    #[serde(rename = "_isValid")]
    pub is_valid: bool,
    #[serde(rename = "_differencePPM")]
    pub difference_ppm: i64,
    #[serde(rename = "_satsBaseFee", with = "dec_u64")]
    pub sats_base_fee: u64,
    #[serde(rename = "_feePPM")]
    pub fee_ppm: u32,
    #[serde(rename = "_realPriceUSatPerToken", with = "dec_u128")]
    pub real_price_usat_per_token: u128,
    #[serde(rename = "_realPriceUsdPerBitcoin")]
    pub real_price_usd_per_bitcoin: Option<Decimal>,
    #[serde(rename = "_swapPriceUSatPerToken", with = "dec_u128")]
    pub swap_price_usat_per_token: u128,
}

impl From<PricingInfo> for StoredPricing {
    fn from(p: PricingInfo) -> Self {
        Self {
            is_valid: p.is_valid,
            difference_ppm: p.difference_ppm,
            sats_base_fee: p.sats_base_fee,
            fee_ppm: p.fee_ppm,
            real_price_usat_per_token: p.real_price_usat_per_token,
            real_price_usd_per_bitcoin: p.real_price_usd_per_bitcoin,
            swap_price_usat_per_token: p.swap_price_usat_per_token,
        }
    }
}

impl From<StoredPricing> for PricingInfo {
    fn from(p: StoredPricing) -> Self {
        Self {
            is_valid: p.is_valid,
            difference_ppm: p.difference_ppm,
            sats_base_fee: p.sats_base_fee,
            fee_ppm: p.fee_ppm,
            real_price_usat_per_token: p.real_price_usat_per_token,
            real_price_usd_per_bitcoin: p.real_price_usd_per_bitcoin,
            swap_price_usat_per_token: p.swap_price_usat_per_token,
        }
    }
}

/// The common persisted core every swap kind shares; kind-specific fields
/// are flattened next to it in the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSwapCore {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SwapKind,
    /// Identifier binding chain events to this swap: the escrow hash for
    /// escrow kinds, the bitcoin txid for vault kinds, the payment hash for
    /// trusted kinds.
    pub escrow_hash: String,
    /// Smart-chain address of the user driving the swap.
    pub initiator: String,
    pub chain_identifier: String,
    pub state: i32,
    pub url: String,
    pub version: u32,
    pub initiated: bool,
    pub exact_in: bool,
    pub created_at: u64,
    pub random_nonce: String,
    /// Quote expiry, UNIX milliseconds.
    pub expiry: u64,
    #[serde(with = "dec_u128")]
    pub swap_fee: u128,
    #[serde(with = "dec_u64")]
    pub swap_fee_btc: u64,
    #[serde(flatten)]
    pub pricing: Option<StoredPricing>,
}

/// In-memory mutable core of a swap.
#[derive(Debug, Clone)]
pub struct SwapCore {
    pub kind: SwapKind,
    pub id: String,
    pub escrow_hash: String,
    pub initiator: String,
    pub chain_identifier: String,
    pub url: String,
    pub version: u32,
    pub initiated: bool,
    pub exact_in: bool,
    pub created_at: u64,
    pub random_nonce: String,
    pub expiry: u64,
    pub swap_fee: u128,
    pub swap_fee_btc: u64,
    pub pricing_info: Option<PricingInfo>,
}

impl SwapCore {
    pub fn direction(&self) -> SwapDirection {
        self.kind.direction()
    }

    /// Whether the quote's validity window has lapsed.
    pub fn is_quote_expired(&self) -> bool {
        self.expiry < now_millis()
    }

    pub fn to_stored(&self, state: i32) -> StoredSwapCore {
        StoredSwapCore {
            id: self.id.clone(),
            kind: self.kind,
            escrow_hash: self.escrow_hash.clone(),
            initiator: self.initiator.clone(),
            chain_identifier: self.chain_identifier.clone(),
            state,
            url: self.url.clone(),
            version: self.version,
            initiated: self.initiated,
            exact_in: self.exact_in,
            created_at: self.created_at,
            random_nonce: self.random_nonce.clone(),
            expiry: self.expiry,
            swap_fee: self.swap_fee,
            swap_fee_btc: self.swap_fee_btc,
            pricing: self.pricing_info.clone().map(Into::into),
        }
    }

    pub fn from_stored(stored: StoredSwapCore) -> (Self, i32) {
        let state = stored.state;
        (
            Self {
                kind: stored.kind,
                id: stored.id,
                escrow_hash: stored.escrow_hash,
                initiator: stored.initiator,
                chain_identifier: stored.chain_identifier,
                url: stored.url,
                version: stored.version,
                initiated: stored.initiated,
                exact_in: stored.exact_in,
                created_at: stored.created_at,
                random_nonce: stored.random_nonce,
                expiry: stored.expiry,
                swap_fee: stored.swap_fee,
                swap_fee_btc: stored.swap_fee_btc,
                pricing_info: stored.pricing.map(Into::into),
            },
            state,
        )
    }

    /// The user-facing price comparison, per-direction so the two numbers
    /// are always in the same unit space.
    pub fn get_price_info(&self) -> Result<PriceInfo> {
        use rust_decimal::prelude::FromPrimitive;
        let pricing = self
            .pricing_info
            .as_ref()
            .ok_or_else(|| Error::InvalidState("Swap has no pricing info".into()))?;
        let dec = |value: u128| Decimal::from_u128(value).unwrap_or(Decimal::MAX);
        let scale = Decimal::from(100_000_000_000_000u64);
        let (market_price, swap_price) = match self.direction() {
            SwapDirection::ToBtc => (
                scale / dec(pricing.real_price_usat_per_token),
                scale / dec(pricing.swap_price_usat_per_token),
            ),
            SwapDirection::FromBtc => (
                dec(pricing.real_price_usat_per_token) / scale,
                dec(pricing.swap_price_usat_per_token) / scale,
            ),
        };
        let difference = if market_price.is_zero() {
            Decimal::ZERO
        } else {
            (swap_price - market_price) / market_price
        };
        Ok(PriceInfo {
            market_price,
            swap_price,
            difference,
        })
    }

    pub fn has_valid_price(&self) -> bool {
        self.pricing_info.as_ref().map(|p| p.is_valid).unwrap_or(false)
    }
}

/// Plumbing shared by every swap: context handle, the wrapper-global
/// emitter, and the swap-local state channel.
pub struct SwapShared {
    pub ctx: Arc<SwapContext>,
    pub emitter: SwapEventEmitter,
    state_watch: watch::Sender<i32>,
}

impl SwapShared {
    pub fn new(ctx: Arc<SwapContext>, emitter: SwapEventEmitter, initial_state: i32) -> Self {
        let (state_watch, _) = watch::channel(initial_state);
        Self {
            ctx,
            emitter,
            state_watch,
        }
    }

    /// Persist the record iff the swap is initiated; a quote-expired swap is
    /// removed instead of saved.
    pub async fn save_record(
        &self,
        id: &str,
        initiated: bool,
        quote_expired: bool,
        record: serde_json::Value,
    ) -> Result<()> {
        if !initiated {
            return Ok(());
        }
        if quote_expired {
            self.ctx.storage.remove(id).await
        } else {
            self.ctx.storage.save(record).await
        }
    }

    /// Emit a state change on both the swap-local and wrapper-global
    /// channels. Persistence must already have happened.
    pub fn emit_state(&self, kind: SwapKind, id: &str, state: i32) {
        self.state_watch.send_replace(state);
        self.emitter.emit(SwapStateEvent {
            kind,
            id: id.to_string(),
            state,
        });
    }

    /// Resolve once the swap state satisfies `mode` relative to `target`.
    ///
    /// Checks the current state first, so an already-satisfied wait returns
    /// immediately. Cancellation rejects with exactly the provided reason
    /// and deregisters the listener.
    pub async fn wait_till_state(
        &self,
        target: i32,
        mode: StateCompare,
        cancel: Option<&CancelHandle>,
    ) -> Result<i32> {
        let mut rx = self.state_watch.subscribe();
        cancellable(
            async move {
                let state = rx
                    .wait_for(|s| mode.matches(*s, target))
                    .await
                    .map_err(|_| Error::InvalidState("Swap dropped while waiting".into()))?;
                Ok(*state)
            },
            cancel,
        )
        .await
    }

    pub fn current_state(&self) -> i32 {
        *self.state_watch.borrow()
    }
}

/// The public capability contract every swap kind satisfies.
#[async_trait]
pub trait Swap: Send + Sync {
    fn kind(&self) -> SwapKind;

    fn direction(&self) -> SwapDirection {
        self.kind().direction()
    }

    /// Stable identifier, unchanged across restarts.
    fn id(&self) -> &str;

    /// Numeric state as persisted.
    fn state_id(&self) -> i32;

    async fn is_initiated(&self) -> bool;

    async fn is_finished(&self) -> bool;

    async fn is_successful(&self) -> bool;

    async fn is_quote_expired(&self) -> bool;

    async fn get_price_info(&self) -> Result<PriceInfo>;

    async fn has_valid_price(&self) -> bool;

    /// Re-query the oracle with the stored fees and refresh the pricing
    /// info, preserving the recorded USD price.
    async fn refresh_price_data(&self) -> Result<()>;

    async fn wait_till_state(
        &self,
        target: i32,
        mode: StateCompare,
        cancel: Option<&CancelHandle>,
    ) -> Result<i32>;

    /// Serialize to the persisted record format.
    async fn serialize(&self) -> Result<serde_json::Value>;
}

/// Forward-only schema upgrade applied when a record with an older `version`
/// is loaded. `version` is bumped to [`SWAP_SCHEMA_VERSION`] afterwards.
pub fn upgrade_version(record: &mut serde_json::Value) {
    let version = record
        .get("version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    if version >= SWAP_SCHEMA_VERSION {
        return;
    }
    // Version 0 records predate the explicit chain identifier.
    if let Some(map) = record.as_object_mut() {
        map.entry("chainIdentifier")
            .or_insert_with(|| serde_json::Value::String(String::new()));
        map.insert(
            "version".to_string(),
            serde_json::Value::from(SWAP_SCHEMA_VERSION),
        );
    }
}
