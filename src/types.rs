//! Shared types for the Bridgeswap Client SDK.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Serde module for serializing `u64` amounts as decimal strings.
///
/// Persisted records keep every big integer as a decimal string so the
/// on-disk format is identical across platforms.
pub mod dec_u64 {
    use super::*;

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde module for serializing `u128` amounts as decimal strings.
pub mod dec_u128 {
    use super::*;

    pub fn serialize<S>(value: &u128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde module for `Option<u64>` decimal strings.
pub mod dec_u64_opt {
    use super::*;

    pub fn serialize<S>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Serde module for `Option<u128>` decimal strings.
pub mod dec_u128_opt {
    use super::*;

    pub fn serialize<S>(value: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u128>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// The kind of a swap, covering every protocol the SDK can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapKind {
    /// On-chain BTC into a smart chain via an escrow (HTLC/PrTLC).
    FromBtc,
    /// Lightning into a smart chain via an escrow, manually claimed.
    FromLn,
    /// Lightning into a smart chain via an escrow, watchtower-settled.
    FromLnAuto,
    /// Smart chain into on-chain BTC via an escrow.
    ToBtc,
    /// Smart chain into Lightning via an escrow.
    ToLn,
    /// On-chain BTC into a smart chain through a UTXO vault.
    SpvVaultFromBtc,
    /// Trusted on-chain BTC gas-drop swap.
    TrustedFromBtc,
    /// Trusted Lightning gas-drop swap.
    TrustedFromLn,
}

impl SwapKind {
    /// The direction of value flow for this kind.
    pub fn direction(self) -> SwapDirection {
        match self {
            SwapKind::ToBtc | SwapKind::ToLn => SwapDirection::ToBtc,
            SwapKind::FromBtc
            | SwapKind::FromLn
            | SwapKind::FromLnAuto
            | SwapKind::SpvVaultFromBtc
            | SwapKind::TrustedFromBtc
            | SwapKind::TrustedFromLn => SwapDirection::FromBtc,
        }
    }
}

impl std::fmt::Display for SwapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SwapKind::FromBtc => "FROM_BTC",
            SwapKind::FromLn => "FROM_LN",
            SwapKind::FromLnAuto => "FROM_LN_AUTO",
            SwapKind::ToBtc => "TO_BTC",
            SwapKind::ToLn => "TO_LN",
            SwapKind::SpvVaultFromBtc => "SPV_VAULT_FROM_BTC",
            SwapKind::TrustedFromBtc => "TRUSTED_FROM_BTC",
            SwapKind::TrustedFromLn => "TRUSTED_FROM_LN",
        };
        write!(f, "{}", s)
    }
}

/// Direction of a swap relative to Bitcoin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapDirection {
    /// Smart-chain tokens are sold for BTC.
    ToBtc,
    /// BTC is sold for smart-chain tokens.
    FromBtc,
}

/// A token on a smart chain, identified opaquely.
pub type TokenAddress = String;

/// Pricing information attached to every quoted swap.
///
/// `swap_price_usat_per_token` is the price the LP quoted;
/// `real_price_usat_per_token` is what the oracle saw at validation time.
/// Both are micro-satoshis per token base unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingInfo {
    pub is_valid: bool,
    pub difference_ppm: i64,
    #[serde(with = "dec_u64")]
    pub sats_base_fee: u64,
    pub fee_ppm: u32,
    #[serde(with = "dec_u128")]
    pub real_price_usat_per_token: u128,
    pub real_price_usd_per_bitcoin: Option<rust_decimal::Decimal>,
    #[serde(with = "dec_u128")]
    pub swap_price_usat_per_token: u128,
}

/// Price comparison exposed to the user, normalized so that a higher
/// `swap_price` is always better for the user regardless of direction.
#[derive(Debug, Clone)]
pub struct PriceInfo {
    pub market_price: rust_decimal::Decimal,
    pub swap_price: rust_decimal::Decimal,
    pub difference: rust_decimal::Decimal,
}

/// Fee schedule an LP attaches to a quote.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeData {
    /// Flat base fee in satoshis.
    #[serde(with = "dec_u64")]
    pub sats_base_fee: u64,
    /// Proportional fee in parts per million.
    pub fee_ppm: u32,
}

/// An unspent bitcoin transaction output, `txid:vout` keyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcUtxo {
    pub txid: String,
    pub vout: u32,
    #[serde(with = "dec_u64")]
    pub value: u64,
}

impl BtcUtxo {
    pub fn outpoint(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }
}

impl std::fmt::Display for BtcUtxo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_direction() {
        assert_eq!(SwapKind::ToBtc.direction(), SwapDirection::ToBtc);
        assert_eq!(SwapKind::ToLn.direction(), SwapDirection::ToBtc);
        assert_eq!(SwapKind::FromBtc.direction(), SwapDirection::FromBtc);
        assert_eq!(SwapKind::SpvVaultFromBtc.direction(), SwapDirection::FromBtc);
        assert_eq!(SwapKind::TrustedFromLn.direction(), SwapDirection::FromBtc);
    }

    #[test]
    fn test_kind_serde_wire_names() {
        let json = serde_json::to_string(&SwapKind::SpvVaultFromBtc).unwrap();
        assert_eq!(json, "\"SPV_VAULT_FROM_BTC\"");
        let back: SwapKind = serde_json::from_str("\"FROM_LN_AUTO\"").unwrap();
        assert_eq!(back, SwapKind::FromLnAuto);
    }

    #[test]
    fn test_decimal_string_roundtrip() {
        #[derive(Serialize, Deserialize)]
        struct T {
            #[serde(with = "dec_u128")]
            v: u128,
        }
        let t = T {
            v: 340282366920938463463374607431768211455,
        };
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"340282366920938463463374607431768211455\""));
        let back: T = serde_json::from_str(&json).unwrap();
        assert_eq!(back.v, t.v);
    }
}
