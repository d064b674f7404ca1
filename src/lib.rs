//! Bridgeswap Client SDK - Core Library
//!
//! Client-side engine for cross-chain atomic swaps between Bitcoin
//! (on-chain and Lightning) and programmable smart chains.
//!
//! For each swap the engine negotiates a quote with a liquidity provider,
//! drives a protocol-specific state machine to completion, survives process
//! restarts by persisting swap state, and reconciles local state with
//! on-chain reality. The blockchains themselves, wallets, storage back-ends
//! and the messenger transport are collaborators behind traits in
//! [`chain`] and [`storage`].
//!
//! # Example
//!
//! ```rust,ignore
//! use bridgeswap_core::{SwapWrapper, SwapKind, UnifiedSwapEventListener};
//!
//! // Wire a wrapper per swap kind against your chain bindings.
//! let router = Arc::new(UnifiedSwapEventListener::new(storage.clone()));
//! let from_btc = SwapWrapper::new(SwapKind::FromBtc, ctx.clone(), router.clone());
//! from_btc.init(false, false).await?;
//!
//! // Create, commit, and let the engine drive the rest.
//! let swap = from_btc.create(&signer, &lp, amount, token, true, 0, deposit).await?;
//! swap.commit(&signer, None).await?;
//! swap.execute(None).await?;
//! ```

pub mod api;
pub mod chain;
pub mod error;
pub mod events;
pub mod price;
pub mod storage;
pub mod swap;
pub mod types;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;

pub use api::{HttpIntermediaryApi, IntermediaryApi};
pub use error::{Error, Result};
pub use events::{SwapEventEmitter, SwapStateEvent, UnifiedSwapEventListener};
pub use price::{RedundantSwapPrice, RedundantSwapPriceConfig};
pub use storage::{CompositeIndexDef, IndexDef, QueryParam, StorageFuture, UnifiedStorage};
pub use swap::escrow::from_btc::{FromBtcState, FromBtcSwap};
pub use swap::escrow::from_ln::{FromLnState, FromLnSwap};
pub use swap::escrow::to_btc::{ToBtcState, ToBtcSwap};
pub use swap::spv::{SpvFromBtcState, SpvFromBtcSwap, SpvWalletMode, SwapBitcoinWallet};
pub use swap::trusted::{TrustedGasState, TrustedGasSwap};
pub use swap::wrapper::{LpDescriptor, SwapWrapper, VerifyFees, WrapperSwap};
pub use swap::{StateCompare, Swap, SwapContext, SwapState, SwapperOptions};
pub use types::{PriceInfo, PricingInfo, SwapDirection, SwapKind};
pub use utils::CancelHandle;
