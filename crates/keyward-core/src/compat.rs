//! Compatibility shim for legacy key material.
//!
//! Older records were produced by a wrapper that treated key bytes as a
//! big-endian integer and dropped leading zero bytes. Such material is
//! restored to its canonical width by left-padding with zeros instead of
//! being rejected. Material longer than the canonical width is never
//! truncated.

use crate::error::{Result, SecurityError};

/// Restore `bytes` to exactly `N` bytes, left-padding with zeros.
pub fn to_canonical_width<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    if bytes.len() > N {
        return Err(SecurityError::InvalidKeyMaterial(format!(
            "expected at most {} bytes, got {}",
            N,
            bytes.len()
        )));
    }

    let mut out = [0u8; N];
    out[N - bytes.len()..].copy_from_slice(bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_width_unchanged() {
        let bytes = [7u8; 32];
        assert_eq!(to_canonical_width::<32>(&bytes).unwrap(), bytes);
    }

    #[test]
    fn test_short_material_left_padded() {
        let mut expected = [0u8; 32];
        expected[2..].copy_from_slice(&[9u8; 30]);
        assert_eq!(to_canonical_width::<32>(&[9u8; 30]).unwrap(), expected);
    }

    #[test]
    fn test_long_material_rejected() {
        assert!(to_canonical_width::<16>(&[1u8; 17]).is_err());
    }

    #[test]
    fn test_empty_material_is_all_zero() {
        assert_eq!(to_canonical_width::<4>(&[]).unwrap(), [0u8; 4]);
    }
}
