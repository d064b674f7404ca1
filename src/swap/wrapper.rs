//! Generic per-kind swap wrapper: initialization with past-swap
//! reconciliation, the periodic tick, chain-event subscription, and LP
//! price verification.

use crate::chain::ChainEvent;
use crate::error::{Error, Result};
use crate::events::{SwapEventEmitter, UnifiedSwapEventListener};
use crate::storage::{CompositeIndexDef, IndexDef, QueryParam};
use crate::swap::{Swap, SwapContext, upgrade_version};
use crate::types::{FeeData, PricingInfo, SwapKind};
use crate::utils::CancelHandle;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A liquidity provider the user picked (discovery is a collaborator).
#[derive(Debug, Clone)]
pub struct LpDescriptor {
    /// LP endpoint base URL.
    pub url: String,
    /// LP's smart-chain address.
    pub address: String,
    /// The LP's advertised flat fee in satoshis.
    pub sats_base_fee: u64,
    /// The LP's advertised proportional fee in parts per million.
    pub fee_ppm: u32,
}

/// Fee material a quote carries, as handed to price verification. The
/// network fee only applies in the send (to-BTC) direction, where it is
/// deducted from the token amount before the price check.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyFees {
    pub sats_base_fee: u64,
    pub fee_ppm: u32,
    pub network_fee_token: u128,
}

/// What a swap kind must provide for its wrapper to drive it.
#[async_trait]
pub trait WrapperSwap: Swap + Sized + Send + Sync + 'static {
    /// Rehydrate a swap from its persisted record.
    fn from_record(
        ctx: Arc<SwapContext>,
        emitter: SwapEventEmitter,
        record: serde_json::Value,
    ) -> Result<Arc<Self>>;

    /// Reconcile local state with on-chain reality. Returns whether state
    /// changed.
    async fn sync(self: &Arc<Self>, save: bool) -> Result<bool>;

    /// Periodic 1 Hz housekeeping (expiry checks, polling, re-broadcast).
    /// Returns whether state changed.
    async fn tick_swap(self: &Arc<Self>, save: bool) -> Result<bool>;

    async fn process_event(self: &Arc<Self>, event: &ChainEvent) -> Result<()>;

    /// Whether this kind has states the tick timer needs to drive.
    fn has_tick_states() -> bool {
        true
    }

    /// Non-terminal, in need of reconciliation on startup.
    async fn is_pending(&self) -> bool;

    /// In the terminal quote-expired state, i.e. eligible for removal.
    async fn is_quote_expired_final(&self) -> bool;
}

/// Owns all swaps of one kind.
pub struct SwapWrapper<S: WrapperSwap> {
    pub kind: SwapKind,
    pub ctx: Arc<SwapContext>,
    pub emitter: SwapEventEmitter,
    router: Arc<UnifiedSwapEventListener>,
    pending: Mutex<HashMap<String, Weak<S>>>,
    initialized: AtomicBool,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: WrapperSwap> SwapWrapper<S> {
    pub fn new(
        kind: SwapKind,
        ctx: Arc<SwapContext>,
        router: Arc<UnifiedSwapEventListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            ctx,
            emitter: SwapEventEmitter::new(),
            router,
            pending: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            tick_task: Mutex::new(None),
        })
    }

    /// Index declarations every wrapper needs from the shared storage.
    pub fn storage_indexes() -> (Vec<IndexDef>, Vec<CompositeIndexDef>) {
        (
            vec![
                IndexDef {
                    key: "id",
                    unique: true,
                    nullable: false,
                },
                IndexDef {
                    key: "escrowHash",
                    unique: true,
                    nullable: true,
                },
                IndexDef {
                    key: "type",
                    unique: false,
                    nullable: false,
                },
            ],
            vec![CompositeIndexDef {
                keys: &["type", "state"],
                unique: false,
            }],
        )
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Track a swap in the weakly-referenced pending index.
    pub fn track(&self, swap: &Arc<S>) {
        self.pending
            .lock()
            .unwrap()
            .insert(swap.id().to_string(), Arc::downgrade(swap));
    }

    fn live_swaps(&self) -> Vec<Arc<S>> {
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|_, weak| weak.strong_count() > 0);
        pending.values().filter_map(Weak::upgrade).collect()
    }

    /// Resolve the live instance for a persisted record, keeping instance
    /// identity stable for anyone already holding the swap.
    fn resolve(&self, mut record: serde_json::Value) -> Result<Arc<S>> {
        upgrade_version(&mut record);
        let id = record
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Storage("record without id".into()))?
            .to_string();
        if let Some(swap) = self.pending.lock().unwrap().get(&id).and_then(Weak::upgrade) {
            return Ok(swap);
        }
        let swap = S::from_record(self.ctx.clone(), self.emitter.clone(), record)?;
        self.track(&swap);
        Ok(swap)
    }

    async fn load_records(&self) -> Result<Vec<serde_json::Value>> {
        self.ctx
            .storage
            .query(vec![vec![QueryParam::eq(
                "type",
                serde_json::to_value(self.kind)?,
            )]])
            .await
    }

    /// Reconcile one persisted swap against the chain; removes swaps whose
    /// quote lapsed, saves changed ones.
    async fn reconcile(&self, record: serde_json::Value) -> Result<()> {
        let swap = self.resolve(record)?;
        let changed = swap.sync(false).await?;
        if swap.is_quote_expired_final().await {
            self.ctx.storage.remove(swap.id()).await?;
            return Ok(());
        }
        if changed {
            self.ctx.storage.save(swap.serialize().await?).await?;
        }
        Ok(())
    }

    async fn handle_event(&self, event: ChainEvent, record: serde_json::Value) -> Result<()> {
        let swap = self.resolve(record)?;
        swap.process_event(&event).await
    }

    /// Initialize the wrapper. Idempotent.
    ///
    /// Unless `skip_past_check`, events that arrive while the persisted
    /// swaps are being reconciled are queued and drained afterwards, in
    /// arrival order.
    pub async fn init(
        self: &Arc<Self>,
        skip_timers: bool,
        skip_past_check: bool,
    ) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (indexes, composite) = Self::storage_indexes();
        self.ctx.storage.init(&indexes, &composite).await?;

        if !skip_past_check {
            // Queue events while the past-swap check runs.
            let queue: Arc<Mutex<Vec<(ChainEvent, serde_json::Value)>>> =
                Arc::new(Mutex::new(Vec::new()));
            let queue_ref = queue.clone();
            self.router
                .register(
                    self.kind,
                    Box::new(move |event, record| {
                        let queue = queue_ref.clone();
                        Box::pin(async move {
                            queue.lock().unwrap().push((event, record));
                            Ok(())
                        })
                    }),
                )
                .await;

            for record in self.load_records().await? {
                if let Err(e) = self.reconcile(record).await {
                    // One broken swap must not keep the others from
                    // reconciling.
                    log::error!("{}: failed to reconcile swap: {}", self.kind, e);
                }
            }

            let queued = std::mem::take(&mut *queue.lock().unwrap());
            for (event, record) in queued {
                if let Err(e) = self.handle_event(event, record).await {
                    log::error!("{}: failed to process queued event: {}", self.kind, e);
                }
            }
        }

        let wrapper = Arc::downgrade(self);
        self.router
            .register(
                self.kind,
                Box::new(move |event, record| {
                    let wrapper = wrapper.clone();
                    Box::pin(async move {
                        match wrapper.upgrade() {
                            Some(wrapper) => wrapper.handle_event(event, record).await,
                            None => Ok(()),
                        }
                    })
                }),
            )
            .await;

        if S::has_tick_states() && !skip_timers {
            let wrapper = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let Some(wrapper) = wrapper.upgrade() else {
                        return;
                    };
                    wrapper.tick().await;
                }
            });
            *self.tick_task.lock().unwrap() = Some(task);
        }

        Ok(())
    }

    /// Stop the wrapper; safe to call when not initialized.
    pub async fn stop(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        self.router.unregister(self.kind).await;
        if let Some(task) = self.tick_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// One tick over every live pending or uninitiated swap.
    pub async fn tick(&self) {
        for swap in self.live_swaps() {
            if let Err(e) = swap.tick_swap(true).await {
                log::warn!("{}: tick failed for swap {}: {}", self.kind, swap.id(), e);
            }
        }
    }

    /// All persisted swaps of this kind that are not yet settled.
    pub async fn get_pending_swaps(&self) -> Result<Vec<Arc<S>>> {
        let mut out = Vec::new();
        for record in self.load_records().await? {
            let swap = self.resolve(record)?;
            if swap.is_pending().await {
                out.push(swap);
            }
        }
        Ok(out)
    }

    /// Validate the price an LP quoted against the oracle.
    ///
    /// `send` is the to-BTC direction: the LP's network fee is deducted from
    /// the token amount before the check. Fails with
    /// `Intermediary("Fee too high")` when the oracle flags the quote.
    #[allow(clippy::too_many_arguments)]
    pub async fn verify_returned_price(
        &self,
        send: bool,
        sats: u64,
        token_amount: u128,
        token: &str,
        fees: VerifyFees,
        prefetched_price: Option<u128>,
        prefetched_usd: Option<Decimal>,
        _cancel: Option<&CancelHandle>,
    ) -> Result<PricingInfo> {
        let fee_data = FeeData {
            sats_base_fee: fees.sats_base_fee,
            fee_ppm: fees.fee_ppm,
        };
        let chain_id = self.ctx.chain.chain_identifier();
        let pricing = if send {
            let amount = token_amount.saturating_sub(fees.network_fee_token);
            self.ctx
                .prices
                .is_valid_amount_receive(
                    &chain_id,
                    sats,
                    fee_data,
                    amount,
                    token,
                    prefetched_price,
                    prefetched_usd,
                )
                .await?
        } else {
            self.ctx
                .prices
                .is_valid_amount_send(
                    &chain_id,
                    sats,
                    fee_data,
                    token_amount,
                    token,
                    prefetched_price,
                    prefetched_usd,
                )
                .await?
        };
        if !pricing.is_valid {
            return Err(Error::Intermediary("Fee too high".into()));
        }
        Ok(pricing)
    }

    /// Pre-fetch the token price; failures are logged and swallowed.
    pub async fn pre_fetch_price(&self, token: &str) -> Option<u128> {
        let chain_id = self.ctx.chain.chain_identifier();
        match self.ctx.prices.get_price(&chain_id, token).await {
            Ok(price) => Some(price),
            Err(e) => {
                log::warn!("{}: price pre-fetch failed: {}", self.kind, e);
                None
            }
        }
    }

    /// Pre-fetch the USD price; failures are logged and swallowed.
    pub async fn pre_fetch_usd_price(&self) -> Option<Decimal> {
        match self.ctx.prices.get_usd_price().await {
            Ok(price) => Some(price),
            Err(e) => {
                log::warn!("{}: usd price pre-fetch failed: {}", self.kind, e);
                None
            }
        }
    }
}

impl<S: WrapperSwap> Drop for SwapWrapper<S> {
    fn drop(&mut self) {
        if let Some(task) = self.tick_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
