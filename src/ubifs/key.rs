//! UBIFS key decoding.
//!
//! In the simple key format every indexed object is named by 64 bits: a
//! 32-bit inode number, then a 32-bit word packing a 3-bit key type above
//! 29 bits of payload. The payload is a name hash for directory and xattr
//! entries, and the block index for data nodes. Node bodies reserve 16
//! bytes of key space; the upper 8 are unused by this format.

use modular_bitfield::prelude::*;

/// Key type, the top 3 bits of the second key word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct KeyType(pub u8);

impl KeyType {
    pub const INO: Self = Self(0);
    pub const DATA: Self = Self(1);
    pub const DENT: Self = Self(2);
    pub const XENT: Self = Self(3);
}

/// Second word of an on-disk key.
#[bitfield]
struct KeyWord {
    hash: B29,
    ktype: B3,
}

/// A decoded UBIFS key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Key {
    /// Owning inode (data, inode keys) or parent inode (dent, xent keys).
    pub inum: u64,

    pub ktype: KeyType,

    /// Name hash for dent/xent keys, block index for data keys, zero for
    /// inode keys.
    pub hash: u32,
}

impl Key {
    /// Decodes a key from at least 8 bytes of on-disk key space.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let inum = u64::from(u32::from_le_bytes(raw[0..4].try_into().unwrap()));
        let word = KeyWord::from_bytes(raw[4..8].try_into().unwrap());

        Self {
            inum,
            ktype: KeyType(word.ktype()),
            hash: word.hash(),
        }
    }
}
