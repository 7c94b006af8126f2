//! Device identity hashing.
//!
//! OS device handles change every time a device is re-enumerated, so devices
//! are recognised by a 64-bit FNV-1a digest of `"{vendor_id}:{product_id}:{name}"`
//! instead. Two physical devices with identical vendor id, product id and name
//! hash to the same value and cannot be told apart.

use std::fmt;
use std::str::FromStr;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable fingerprint of a device, see [`compute_identity_hash`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub struct IdentityHash(pub u64);

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Error parsing an [`IdentityHash`] from text.
#[derive(Debug, Error)]
#[error("invalid identity hash {input:?}: expected decimal or 0x-prefixed hex")]
pub struct ParseIdentityError {
    input: String,
}

impl FromStr for IdentityHash {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => trimmed.parse::<u64>(),
        };
        parsed.map(Self).map_err(|_| ParseIdentityError {
            input: s.to_string(),
        })
    }
}

/// The fields a device identity is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u32,
    pub product_id: u32,
    pub name: String,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u32, product_id: u32, name: impl Into<String>) -> Self {
        Self {
            vendor_id,
            product_id,
            name: name.into(),
        }
    }

    /// Hash of this identity.
    pub fn hash(&self) -> IdentityHash {
        compute_identity_hash(self.vendor_id, self.product_id, &self.name)
    }
}

/// Compute the identity hash of a device.
///
/// Pure and deterministic: the same triple always yields the same hash, in
/// this process and in any other.
pub fn compute_identity_hash(vendor_id: u32, product_id: u32, name: &str) -> IdentityHash {
    let mut hash = FNV_OFFSET_BASIS;
    let mut feed = |bytes: &[u8]| {
        for byte in bytes {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    feed(vendor_id.to_string().as_bytes());
    feed(b":");
    feed(product_id.to_string().as_bytes());
    feed(b":");
    feed(name.as_bytes());
    IdentityHash(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_fields_hash_identically() {
        let a = compute_identity_hash(0x05ac, 0x0342, "Apple Internal Keyboard");
        let b = compute_identity_hash(0x05ac, 0x0342, "Apple Internal Keyboard");
        assert_eq!(a, b);
    }

    #[test]
    fn any_field_change_changes_hash() {
        let base = compute_identity_hash(1, 2, "Keyboard");
        assert_ne!(base, compute_identity_hash(3, 2, "Keyboard"));
        assert_ne!(base, compute_identity_hash(1, 3, "Keyboard"));
        assert_ne!(base, compute_identity_hash(1, 2, "Keyboard "));
    }

    #[test]
    fn separator_prevents_field_shifting() {
        // "1:23:x" vs "12:3:x"
        assert_ne!(
            compute_identity_hash(1, 23, "x"),
            compute_identity_hash(12, 3, "x")
        );
    }

    #[test]
    fn matches_reference_fnv1a() {
        // FNV-1a 64 of the empty input is the offset basis.
        let mut hash = FNV_OFFSET_BASIS;
        for byte in b"0:0:" {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        assert_eq!(compute_identity_hash(0, 0, ""), IdentityHash(hash));
    }

    #[test]
    fn identity_struct_agrees_with_function() {
        let identity = DeviceIdentity::new(0x046d, 0xc31c, "USB Keyboard");
        assert_eq!(
            identity.hash(),
            compute_identity_hash(0x046d, 0xc31c, "USB Keyboard")
        );
    }

    #[test]
    fn parse_hex_and_decimal() {
        let hash = compute_identity_hash(1, 2, "Keyboard");
        let hex: IdentityHash = hash.to_string().parse().unwrap();
        assert_eq!(hex, hash);
        let dec: IdentityHash = hash.0.to_string().parse().unwrap();
        assert_eq!(dec, hash);
        assert!("not-a-hash".parse::<IdentityHash>().is_err());
    }
}
