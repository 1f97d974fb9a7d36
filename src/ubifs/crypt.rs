//! fscrypt v1 support: per-file key derivation, filename decryption and
//! content decryption.
//!
//! An encrypted inode carries its encryption context in a `c` xattr:
//! policy modes, the descriptor of the master key that protects it, and a
//! per-inode nonce. The per-file key is the 64-byte master key encrypted
//! with AES-128-ECB under the nonce. Filenames and symlink targets use
//! AES-256-CBC with ciphertext stealing (key half one), file contents use
//! AES-256-XTS (both halves) with the block index as tweak.
//!
//! Only the v1 context format and the default v1 modes (XTS for contents,
//! CTS for names) are handled; everything else fails with a typed error
//! so the traversal can degrade to ciphertext names.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha512};

use crate::err::CryptoError;

/// Name of the xattr holding an inode's encryption context.
pub const FSCRYPT_XATTR_NAME: &str = "c";

/// v1 policy mode numbers this decoder understands.
pub const FSCRYPT_MODE_AES_256_XTS: u8 = 1;
pub const FSCRYPT_MODE_AES_256_CTS: u8 = 4;

const FSCRYPT_CONTEXT_V1_SIZE: usize = 28;
const FSCRYPT_KEY_SIZE: usize = 64;

/// 64 bytes of fscrypt v1 master key material.
#[derive(Clone)]
pub struct MasterKey([u8; FSCRYPT_KEY_SIZE]);

impl MasterKey {
    /// Wraps raw key material; must be exactly 64 bytes.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; FSCRYPT_KEY_SIZE] = raw.try_into().map_err(|_| CryptoError::DecryptError {
            reason: "master key material must be exactly 64 bytes",
        })?;
        Ok(Self(key))
    }

    /// Key identity as stored in encryption contexts: the first 8 bytes
    /// of the double SHA-512 of the key.
    pub fn descriptor(&self) -> [u8; 8] {
        let first = Sha512::digest(self.0);
        let second = Sha512::digest(first);
        second[..8].try_into().unwrap()
    }
}

impl core::fmt::Debug for MasterKey {
    /// Key material never reaches logs; only the public descriptor does.
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!(
            "MasterKey(descriptor={})",
            hex::encode(self.descriptor())
        ))
    }
}

/// Parsed v1 encryption context from an inode's `c` xattr.
#[derive(Clone, Copy, Debug)]
pub struct EncryptionContext {
    pub contents_mode: u8,
    pub filenames_mode: u8,
    pub flags: u8,
    pub master_key_descriptor: [u8; 8],
    pub nonce: [u8; 16],
}

impl EncryptionContext {
    pub fn parse(raw: &[u8]) -> Result<Self, CryptoError> {
        if raw.len() < FSCRYPT_CONTEXT_V1_SIZE {
            return Err(CryptoError::BadContext { len: raw.len() });
        }
        if raw[0] != 1 {
            return Err(CryptoError::UnsupportedFscryptVersion(raw[0]));
        }

        Ok(Self {
            contents_mode: raw[1],
            filenames_mode: raw[2],
            flags: raw[3],
            master_key_descriptor: raw[4..12].try_into().unwrap(),
            nonce: raw[12..28].try_into().unwrap(),
        })
    }
}

/// The per-file key derived from a master key and an inode's context.
pub struct FileKey {
    raw: [u8; FSCRYPT_KEY_SIZE],
}

impl FileKey {
    /// Derives the per-file key, verifying the master key is the one the
    /// context names and that the policy modes are the v1 defaults.
    pub fn derive(master: &MasterKey, ctx: &EncryptionContext) -> Result<Self, CryptoError> {
        let descriptor = master.descriptor();
        if descriptor != ctx.master_key_descriptor {
            return Err(CryptoError::KeyMismatch {
                expected: hex::encode(ctx.master_key_descriptor),
                actual: hex::encode(descriptor),
            });
        }

        if ctx.contents_mode != FSCRYPT_MODE_AES_256_XTS
            || ctx.filenames_mode != FSCRYPT_MODE_AES_256_CTS
        {
            return Err(CryptoError::DecryptError {
                reason: "unsupported v1 encryption modes",
            });
        }

        // The v1 KDF: each 16-byte chunk of the master key is encrypted
        // with AES-128-ECB keyed by the per-inode nonce.
        let cipher = Aes128::new(GenericArray::from_slice(&ctx.nonce));
        let mut raw = master.0;
        for chunk in raw.chunks_exact_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        }

        Ok(Self { raw })
    }

    /// Decrypts a filename or symlink target (AES-256-CBC-CTS, zero IV)
    /// and trims the NUL padding.
    pub fn decrypt_name(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut name = cts_cbc_decrypt(&self.raw[..32], ciphertext)?;
        while name.last() == Some(&0) {
            name.pop();
        }
        Ok(name)
    }

    /// Decrypts one content block (AES-256-XTS, block index as tweak).
    pub fn decrypt_block(&self, block_index: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(CryptoError::DecryptError {
                reason: "ciphertext is not a whole number of cipher blocks",
            });
        }

        let crypt = Aes256::new(GenericArray::from_slice(&self.raw[..32]));
        let tweaker = Aes256::new(GenericArray::from_slice(&self.raw[32..]));

        let mut tweak = [0u8; 16];
        tweak[..8].copy_from_slice(&block_index.to_le_bytes());
        tweaker.encrypt_block(GenericArray::from_mut_slice(&mut tweak));

        let mut out = ciphertext.to_vec();
        for chunk in out.chunks_exact_mut(16) {
            xor_in_place(chunk, &tweak);
            crypt.decrypt_block(GenericArray::from_mut_slice(chunk));
            xor_in_place(chunk, &tweak);
            gf128_mul_alpha(&mut tweak);
        }

        Ok(out)
    }
}

/// Rendering for names that cannot be decrypted: URL-safe base64 of the
/// ciphertext, so the traversal stays total and paths stay separator-free.
pub fn undecryptable_name(ciphertext: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(ciphertext)
}

fn xor_in_place(buf: &mut [u8], mask: &[u8; 16]) {
    for (b, m) in buf.iter_mut().zip(mask) {
        *b ^= m;
    }
}

/// Multiplication by the primitive element in GF(2^128), little-endian
/// bit order, as XTS steps its tweak between cipher blocks.
fn gf128_mul_alpha(t: &mut [u8; 16]) {
    let mut carry = 0u8;
    for b in t.iter_mut() {
        let next_carry = *b >> 7;
        *b = (*b << 1) | carry;
        carry = next_carry;
    }
    if carry != 0 {
        t[0] ^= 0x87;
    }
}

/// AES-256-CBC decryption with ciphertext stealing (CS3: the final two
/// blocks arrive swapped, the last possibly partial) and a zero IV.
fn cts_cbc_decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let n = ciphertext.len();

    if n < 16 {
        return Err(CryptoError::DecryptError {
            reason: "ciphertext shorter than one cipher block",
        });
    }

    if n == 16 {
        let mut block: [u8; 16] = ciphertext.try_into().unwrap();
        cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
        return Ok(block.to_vec());
    }

    let tail_len = n - ((n - 1) / 16) * 16; // 1..=16 bytes in the last unit
    let head_len = n - tail_len - 16; // whole blocks before the stolen pair
    let (head, rest) = ciphertext.split_at(head_len);
    let (z, tail) = rest.split_at(16);

    // Recover the stolen CBC block: Dec(Z) is C_{m-1} xor padded P_m.
    let mut d: [u8; 16] = z.try_into().unwrap();
    cipher.decrypt_block(GenericArray::from_mut_slice(&mut d));

    let mut c_prev = [0u8; 16];
    c_prev[..tail_len].copy_from_slice(tail);
    c_prev[tail_len..].copy_from_slice(&d[tail_len..]);

    let mut out = Vec::with_capacity(n);

    // Plain CBC over the untouched head.
    let mut iv = [0u8; 16];
    for block in head.chunks_exact(16) {
        let mut p: [u8; 16] = block.try_into().unwrap();
        cipher.decrypt_block(GenericArray::from_mut_slice(&mut p));
        xor_in_place(&mut p, &iv);
        out.extend_from_slice(&p);
        iv.copy_from_slice(block);
    }

    // P_{m-1} chains from the last head block; P_m comes out of D.
    let mut p_prev = c_prev;
    cipher.decrypt_block(GenericArray::from_mut_slice(&mut p_prev));
    xor_in_place(&mut p_prev, &iv);
    out.extend_from_slice(&p_prev);

    for i in 0..tail_len {
        out.push(d[i] ^ tail[i]);
    }

    Ok(out)
}
