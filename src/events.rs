//! Event plane: swap state emission and cross-swap chain-event dispatch.

use crate::chain::ChainEvent;
use crate::error::Result;
use crate::storage::{QueryParam, UnifiedStorage};
use crate::types::SwapKind;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};

/// A swap state change, fanned out on the wrapper-global channel.
#[derive(Debug, Clone)]
pub struct SwapStateEvent {
    pub kind: SwapKind,
    pub id: String,
    pub state: i32,
}

/// Capacity of the wrapper-global broadcast channel. Slow subscribers that
/// lag further than this lose the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Multi-subscriber fan-out channel for swap state changes.
///
/// Emission is synchronous from the emitter's point of view: by the time
/// `emit` returns, the event is enqueued for every live subscriber.
#[derive(Debug, Clone)]
pub struct SwapEventEmitter {
    sender: broadcast::Sender<SwapStateEvent>,
}

impl SwapEventEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwapStateEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SwapStateEvent) {
        // No subscribers is fine; send only errors when nobody listens.
        let _ = self.sender.send(event);
    }
}

impl Default for SwapEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Async callback invoked with an event and the persisted record of the swap
/// it belongs to.
pub type EventListenerFn = Box<
    dyn Fn(ChainEvent, serde_json::Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Routes on-chain events to the wrapper owning the affected swap.
///
/// Listeners are indexed by [`SwapKind`]; an incoming event is resolved to a
/// persisted record through the shared storage (records are looked up by
/// their `escrowHash` binding), and delivered to exactly the one listener
/// registered for the record's kind. Dispatch is serialized, which preserves
/// per-swap ordering.
pub struct UnifiedSwapEventListener {
    storage: Arc<dyn UnifiedStorage>,
    listeners: Mutex<HashMap<SwapKind, EventListenerFn>>,
}

impl UnifiedSwapEventListener {
    pub fn new(storage: Arc<dyn UnifiedStorage>) -> Self {
        Self {
            storage,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, kind: SwapKind, listener: EventListenerFn) {
        self.listeners.lock().await.insert(kind, listener);
    }

    pub async fn unregister(&self, kind: SwapKind) {
        self.listeners.lock().await.remove(&kind);
    }

    /// Dispatch one event. Returns `true` when some listener consumed it.
    ///
    /// Unknown identifiers and kinds without a registered listener are
    /// ignored; a listener error is logged and swallowed so one swap cannot
    /// stall the event stream.
    pub async fn process_event(&self, event: ChainEvent) -> Result<bool> {
        let identifier = event.swap_identifier().to_string();
        let mut params = vec![vec![QueryParam::eq("escrowHash", identifier.clone())]];
        if let Some(fallback) = event.fallback_identifier() {
            params.push(vec![QueryParam::eq("escrowHash", fallback)]);
        }
        let records = self.storage.query(params).await?;

        let Some(record) = records.into_iter().next() else {
            log::debug!("no swap record for chain event {}", identifier);
            return Ok(false);
        };

        let Some(kind) = record
            .get("type")
            .and_then(|v| serde_json::from_value::<SwapKind>(v.clone()).ok())
        else {
            log::warn!("persisted record {} has no readable kind", identifier);
            return Ok(false);
        };

        let listeners = self.listeners.lock().await;
        let Some(listener) = listeners.get(&kind) else {
            return Ok(false);
        };

        if let Err(e) = listener(event, record).await {
            log::error!("listener for {} failed on event {}: {}", kind, identifier, e);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn claim_event(escrow_hash: &str) -> ChainEvent {
        ChainEvent::Claim {
            escrow_hash: escrow_hash.to_string(),
            claim_hash: "ch".to_string(),
            secret: None,
            txid: Some("tx".to_string()),
        }
    }

    #[tokio::test]
    async fn test_dispatch_to_single_kind() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .save(serde_json::json!({
                "id": "s1",
                "escrowHash": "deadbeef",
                "type": "FROM_BTC",
            }))
            .await
            .unwrap();

        let router = UnifiedSwapEventListener::new(storage);
        let from_btc_hits = Arc::new(AtomicU32::new(0));
        let to_btc_hits = Arc::new(AtomicU32::new(0));

        let hits = from_btc_hits.clone();
        router
            .register(
                SwapKind::FromBtc,
                Box::new(move |_event, record| {
                    let hits = hits.clone();
                    Box::pin(async move {
                        assert_eq!(record["id"], "s1");
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            )
            .await;
        let hits = to_btc_hits.clone();
        router
            .register(
                SwapKind::ToBtc,
                Box::new(move |_event, _record| {
                    let hits = hits.clone();
                    Box::pin(async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            )
            .await;

        assert!(router.process_event(claim_event("deadbeef")).await.unwrap());
        assert_eq!(from_btc_hits.load(Ordering::SeqCst), 1);
        assert_eq!(to_btc_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_identifier_ignored() {
        let storage = Arc::new(MemoryStorage::new());
        let router = UnifiedSwapEventListener::new(storage);
        assert!(!router.process_event(claim_event("unknown")).await.unwrap());
    }

    #[tokio::test]
    async fn test_emitter_fan_out() {
        let emitter = SwapEventEmitter::new();
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();
        emitter.emit(SwapStateEvent {
            kind: SwapKind::FromBtc,
            id: "s".to_string(),
            state: 1,
        });
        assert_eq!(rx1.recv().await.unwrap().state, 1);
        assert_eq!(rx2.recv().await.unwrap().state, 1);
    }
}
