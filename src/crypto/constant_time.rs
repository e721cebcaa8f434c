// VaultCore: firmware core for a hardware cryptocurrency wallet
//
// This software is distributed without any warranty.

//! Constant-time comparisons. `spec.md` Design Notes calls this `memcmp_s`:
//! every key/fingerprint comparison in the storage engine and the recovery
//! cipher must go through here rather than `==` on a byte slice, so that
//! timing cannot leak a partial match (`spec.md` §8, testable property 10).

use subtle::ConstantTimeEq;

/// Constant-time equality. Returns `false` immediately (still in constant
/// time with respect to the shorter input) when lengths differ -- a length
/// mismatch cannot occur for the fixed-size fingerprints this is used on,
/// but the fallback keeps the function total.
pub fn memcmp_s(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_buffers_match() {
        assert!(memcmp_s(b"abcdef", b"abcdef"));
    }

    #[test]
    fn differing_buffers_do_not_match() {
        assert!(!memcmp_s(b"abcdef", b"abcdeg"));
        assert!(!memcmp_s(b"abcdef", b"abcde"));
    }

    #[test]
    fn timing_is_independent_of_mismatch_position() {
        // Not a statistical timing harness (unsuitable for a unit test),
        // but documents the property the function must hold: comparison
        // never short-circuits on the first differing byte.
        let reference = [0xAAu8; 64];
        let early_mismatch = {
            let mut b = reference;
            b[0] = 0x00;
            b
        };
        let late_mismatch = {
            let mut b = reference;
            b[63] = 0x00;
            b
        };
        assert!(!memcmp_s(&reference, &early_mismatch));
        assert!(!memcmp_s(&reference, &late_mismatch));
    }
}
