//! Redundant multi-source price oracle.

pub mod providers;
pub mod redundant;

pub use providers::{
    BinancePriceProvider, CoinBinding, CoinGeckoPriceProvider, CoinPaprikaPriceProvider,
    CustomPriceProvider, KrakenPriceProvider, OkxPriceProvider, PriceProvider,
};
pub use redundant::{RedundantSwapPrice, RedundantSwapPriceConfig};
