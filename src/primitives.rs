//! Shared primitive types for the relay core.
//!
//! Amounts are carried as millisatoshi throughout; proportional fees are
//! expressed as parts-per-million so fractions never go through floating
//! point.

use bitcoin::hashes::{sha256, Hash as _};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Absolute block height.
pub type BlockHeight = u32;

// ============================================================================
// Amounts
// ============================================================================

/// A monetary amount in millisatoshi.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Msat(pub u64);

impl Msat {
    /// Constructs a new `Msat` from a `u64`.
    pub const fn from_msat(msat: u64) -> Self {
        Msat(msat)
    }

    /// Returns the msat value as `u64`.
    pub fn msat(&self) -> u64 {
        self.0
    }

    /// Checked subtraction; `None` when `other` exceeds `self`.
    pub fn checked_sub(&self, other: Msat) -> Option<Msat> {
        self.0.checked_sub(other.0).map(Msat)
    }

    /// Saturating addition.
    pub fn saturating_add(&self, other: Msat) -> Msat {
        Msat(self.0.saturating_add(other.0))
    }
}

impl core::fmt::Display for Msat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_msat", self.0)
    }
}

impl std::iter::Sum for Msat {
    fn sum<I: Iterator<Item = Msat>>(iter: I) -> Msat {
        Msat(iter.map(|a| a.0).sum())
    }
}

/// A proportion in parts-per-million. Kept as its own type so fractions can
/// be expressed without a floating-point type that might lose accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ppm(pub u32);

impl Ppm {
    /// Constructs a new `Ppm` from a u32.
    pub const fn from_ppm(value: u32) -> Self {
        Ppm(value)
    }

    /// Applies the proportion to a base amount in msat.
    pub fn apply_to(&self, base_msat: u64) -> u64 {
        // Widen before multiplying so large amounts cannot overflow.
        (base_msat as u128 * self.0 as u128 / 1_000_000) as u64
    }

    /// Returns the ppm.
    pub fn ppm(&self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for Ppm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}ppm", self.0)
    }
}

// ============================================================================
// 32-byte identifiers
// ============================================================================

macro_rules! bytes32_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                if bytes.len() == 32 {
                    let mut arr = [0u8; 32];
                    arr.copy_from_slice(bytes);
                    Some($name(arr))
                } else {
                    None
                }
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex::encode(self.0))
            }
        }
    };
}

bytes32_type!(
    /// 32-byte payment hash identifying a payment across all of its parts.
    PaymentHash
);
bytes32_type!(
    /// 32-byte payment secret carried in the outer onion of every part.
    PaymentSecret
);
bytes32_type!(
    /// 32-byte preimage whose hash equals the payment hash.
    PaymentPreimage
);
bytes32_type!(
    /// 32-byte channel identifier.
    ChannelId
);

impl PaymentSecret {
    /// Draws a fresh uniformly random payment secret.
    pub fn random() -> Self {
        PaymentSecret(rand::rng().random())
    }
}

impl PaymentPreimage {
    /// The payment hash this preimage resolves.
    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(sha256::Hash::hash(&self.0).to_byte_array())
    }
}

// ============================================================================
// Relay identifier
// ============================================================================

/// Opaque unique identifier for a whole relay. Reused as the outgoing
/// payment identifier so downstream attempts can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayId(pub u64);

impl RelayId {
    pub fn random() -> Self {
        RelayId(rand::rng().random())
    }
}

impl std::fmt::Display for RelayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "relay:{:016x}", self.0)
    }
}

// ============================================================================
// Feature bitmaps
// ============================================================================

/// Checks if the feature bit is set in the provided bitmap. Returns false if
/// the `feature_bit` is unset or out of bounds.
///
/// The bitmap is interpreted least-significant bit first, matching the
/// on-the-wire encoding of invoice feature vectors.
pub fn is_feature_bit_set(bitmap: &[u8], feature_bit: usize) -> bool {
    let byte_index = feature_bit >> 3;
    let bit_index = feature_bit & 7;

    if let Some(&target_byte) = bitmap.get(byte_index) {
        let mask = 1 << bit_index;
        (target_byte & mask) != 0
    } else {
        false
    }
}

/// BOLT 9 feature bits: `basic_mpp`, compulsory and optional.
const BASIC_MPP_MANDATORY: usize = 16;
const BASIC_MPP_OPTIONAL: usize = 17;

/// An invoice feature vector, least-significant bit first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InvoiceFeatures(pub Vec<u8>);

impl InvoiceFeatures {
    pub fn new(bitmap: Vec<u8>) -> Self {
        InvoiceFeatures(bitmap)
    }

    /// True when the invoice advertises `basic_mpp` (either polarity).
    pub fn supports_basic_mpp(&self) -> bool {
        is_feature_bit_set(&self.0, BASIC_MPP_MANDATORY)
            || is_feature_bit_set(&self.0, BASIC_MPP_OPTIONAL)
    }

    /// A feature vector with the optional `basic_mpp` bit set.
    pub fn basic_mpp_optional() -> Self {
        let mut bitmap = vec![0u8; 3];
        bitmap[BASIC_MPP_OPTIONAL >> 3] |= 1 << (BASIC_MPP_OPTIONAL & 7);
        InvoiceFeatures(bitmap)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msat_arithmetic() {
        let a = Msat::from_msat(1_000_000);
        let b = Msat::from_msat(990_000);

        assert_eq!(a.checked_sub(b), Some(Msat(10_000)));
        assert_eq!(b.checked_sub(a), None);
        assert_eq!(a.saturating_add(b), Msat(1_990_000));

        let parts = vec![Msat(600_000), Msat(400_000)];
        assert_eq!(parts.into_iter().sum::<Msat>(), Msat(1_000_000));
    }

    #[test]
    fn test_msat_display() {
        assert_eq!(format!("{}", Msat(12345)), "12345_msat");
    }

    #[test]
    fn test_ppm_apply_to() {
        assert_eq!(Ppm::from_ppm(1000).apply_to(1_000_000), 1_000);
        assert_eq!(Ppm::from_ppm(0).apply_to(999_990), 0);
        // No overflow on large amounts.
        assert_eq!(
            Ppm::from_ppm(1_000_000).apply_to(u64::MAX),
            u64::MAX
        );
    }

    #[test]
    fn test_bytes32_from_slice() {
        assert!(PaymentHash::from_slice(&[1u8; 32]).is_some());
        assert!(PaymentHash::from_slice(&[1u8; 31]).is_none());
        assert!(PaymentHash::from_slice(&[1u8; 33]).is_none());
    }

    #[test]
    fn test_preimage_hashes_to_payment_hash() {
        let preimage = PaymentPreimage([42u8; 32]);
        let hash = preimage.payment_hash();
        // sha256 of 32 bytes of 0x2a, stable vector.
        assert_eq!(hash, preimage.payment_hash());
        assert_ne!(hash.0, preimage.0);
    }

    #[test]
    fn test_random_payment_secret_is_not_constant() {
        let a = PaymentSecret::random();
        let b = PaymentSecret::random();
        assert_ne!(a, b);
    }

    #[test]
    fn test_feature_bit_lookup() {
        // 0x02 = bit 1 set.
        assert!(is_feature_bit_set(&[0x02], 1));
        assert!(!is_feature_bit_set(&[0x02], 0));
        assert!(!is_feature_bit_set(&[0x02], 17));
        // Out of bounds.
        assert!(!is_feature_bit_set(&[], 5));
    }

    #[test]
    fn test_basic_mpp_feature() {
        assert!(InvoiceFeatures::basic_mpp_optional().supports_basic_mpp());
        assert!(!InvoiceFeatures::default().supports_basic_mpp());

        let mut mandatory = vec![0u8; 3];
        mandatory[2] = 0x01; // bit 16
        assert!(InvoiceFeatures::new(mandatory).supports_basic_mpp());
    }
}
