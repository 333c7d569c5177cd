/// Seed of the multiplicative rolling hash.
const SEED: i32 = 5381;

/// First multiplier of the avalanche finalizer.
const MIX_1: i32 = 0x85eb_ca6b_u32 as i32;

/// Second multiplier of the avalanche finalizer.
const MIX_2: i32 = 0xc2b2_ae35_u32 as i32;

/// Computes the hash code the table uses for `key`.
///
/// The hash is a `h * 33 + byte` rolling hash seeded with 5381, folded with
/// the key length and passed through a 32-bit avalanche finalizer. The shifts
/// of the finalizer are arithmetic: intermediate state is a signed 32-bit
/// integer.
///
/// The result is always in `1..=i32::MAX`: the sign bit is cleared and a zero
/// result is replaced with 1.
///
/// The function is unseeded, so identical bytes hash identically across runs
/// and processes. It is **not** resistant to hash flooding; callers that
/// accept keys from untrusted sources should keep that in mind.
///
/// # Examples
///
/// ```rust
/// use chain_hash::hashcode;
///
/// let h = hashcode(b"hello\0");
/// assert_eq!(h, hashcode(b"hello\0"));
/// assert!(h >= 1 && h <= i32::MAX as u32);
/// ```
pub fn hashcode(key: &[u8]) -> u32 {
    let mut h = SEED;
    for &byte in key {
        h = h.wrapping_mul(33).wrapping_add(byte as i32);
    }

    h ^= key.len() as i32;
    h ^= h >> 16;
    h = h.wrapping_mul(MIX_1);
    h ^= h >> 13;
    h = h.wrapping_mul(MIX_2);
    h ^= h >> 16;

    match (h & 0x7FFF_FFFF) as u32 {
        0 => 1,
        h => h,
    }
}
