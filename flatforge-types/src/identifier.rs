//! File identifiers and type hashes.
//!
//! A buffer identifier is either a literal four-character code from a schema
//! (`"MONS"`) or the FNV-1a hash of the fully qualified type name. Both are
//! carried as a [`TypeHash`] whose little-endian bytes are the wire form.
//! A hash of zero means "no identifier" throughout the builder.

use crate::{TypeHash, IDENTIFIER_SIZE};

const FNV1A_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV1A_PRIME: u32 = 16_777_619;

/// FNV-1a over the fully qualified type name, e.g.
/// `"MyGame.Example.Monster"`.
///
/// A zero result is remapped to the offset basis so zero keeps meaning
/// "absent".
pub fn type_hash_from_name(name: &str) -> TypeHash {
    let mut hash = FNV1A_OFFSET_BASIS;
    for byte in name.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    if hash == 0 {
        hash = FNV1A_OFFSET_BASIS;
    }
    hash
}

/// Native encoding of a literal identifier such as `"MONS"`. Codes shorter
/// than four characters zero-fill the high bytes; the empty string maps to
/// "no identifier".
pub fn type_hash_from_string(identifier: &str) -> TypeHash {
    let mut hash = 0u32;
    for (i, byte) in identifier.bytes().take(IDENTIFIER_SIZE).enumerate() {
        hash |= (byte as u32) << (8 * i);
    }
    hash
}

/// The four wire bytes of an identifier (little-endian of the hash).
pub fn identifier_from_type_hash(type_hash: TypeHash) -> [u8; IDENTIFIER_SIZE] {
    type_hash.to_le_bytes()
}

/// Native hash from four wire bytes.
pub fn type_hash_from_identifier(identifier: &[u8; IDENTIFIER_SIZE]) -> TypeHash {
    TypeHash::from_le_bytes(*identifier)
}

/// A collision-free permutation of the type hash with better bit dispersion,
/// for use as a hash-table key. Never transmitted.
pub fn disperse_type_hash(type_hash: TypeHash) -> u32 {
    let mut x = type_hash;
    x = ((x >> 16) ^ x).wrapping_mul(0x045d_9f3b);
    x = ((x >> 16) ^ x).wrapping_mul(0x045d_9f3b);
    (x >> 16) ^ x
}
