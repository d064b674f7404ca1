//! UTXO-vault BTC → smart chain swap without on-chain pre-initiation.

pub mod psbt;
pub mod vault_swap;

pub use psbt::{SpvPsbtParams, SwapBitcoinWallet, build_spv_psbt, expected_network_fee};
pub use vault_swap::{SpvFromBtcSwap, SpvFromBtcState, SpvWalletMode};
