//! fscrypt v1 end-to-end scenarios: decryption with the right key, and
//! graceful degradation without it.

mod common;

use std::collections::BTreeMap;
use std::io::Cursor;

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use sha2::{Digest, Sha512};

use common::*;
use ubiread::io::UbiFile;
use ubiread::ubi::Ubi;
use ubiread::ubifs::crypt::MasterKey;
use ubiread::ubifs::emit::{Event, EventCollector, WarningKind};
use ubiread::ubifs::Ubifs;
use ubiread::DecodeOptions;

const CRYPT_FL: u32 = 0x80;
const XATTR_FL: u32 = 0x20;

const MASTER: [u8; 64] = [7u8; 64];

fn descriptor(master: &[u8; 64]) -> [u8; 8] {
    let second = Sha512::digest(Sha512::digest(master));
    second[..8].try_into().unwrap()
}

fn context_bytes(master: &[u8; 64], nonce: &[u8; 16]) -> Vec<u8> {
    let mut ctx = vec![1u8, 1, 4, 0];
    ctx.extend_from_slice(&descriptor(master));
    ctx.extend_from_slice(nonce);
    ctx
}

fn derive_key(master: &[u8; 64], nonce: &[u8; 16]) -> [u8; 64] {
    let cipher = Aes128::new(GenericArray::from_slice(nonce));
    let mut out = *master;
    for chunk in out.chunks_exact_mut(16) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    out
}

fn xor(buf: &mut [u8], mask: &[u8; 16]) {
    for (b, m) in buf.iter_mut().zip(mask) {
        *b ^= m;
    }
}

/// CBC-CS3 encryption with a zero IV, as the kernel's fname crypto does.
fn cts_encrypt(key: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let n = plaintext.len();
    assert!(n >= 16);

    if n == 16 {
        let mut block: [u8; 16] = plaintext.try_into().unwrap();
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
        return block.to_vec();
    }

    let tail_len = n - ((n - 1) / 16) * 16;
    let full = (n - tail_len) / 16;

    let mut iv = [0u8; 16];
    let mut blocks = Vec::new();
    for i in 0..full {
        let mut b: [u8; 16] = plaintext[i * 16..(i + 1) * 16].try_into().unwrap();
        xor(&mut b, &iv);
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut b));
        iv = b;
        blocks.push(b);
    }

    let mut last = [0u8; 16];
    last[..tail_len].copy_from_slice(&plaintext[full * 16..]);
    xor(&mut last, &iv);
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut last));

    let mut out = Vec::new();
    for b in &blocks[..full - 1] {
        out.extend_from_slice(b);
    }
    out.extend_from_slice(&last);
    out.extend_from_slice(&blocks[full - 1][..tail_len]);
    out
}

fn gf_mul(t: &mut [u8; 16]) {
    let mut carry = 0u8;
    for b in t.iter_mut() {
        let next = *b >> 7;
        *b = (*b << 1) | carry;
        carry = next;
    }
    if carry != 0 {
        t[0] ^= 0x87;
    }
}

fn xts_encrypt(key: &[u8; 64], block_index: u64, plaintext: &[u8]) -> Vec<u8> {
    assert_eq!(plaintext.len() % 16, 0);
    let crypt = Aes256::new(GenericArray::from_slice(&key[..32]));
    let tweaker = Aes256::new(GenericArray::from_slice(&key[32..]));

    let mut tweak = [0u8; 16];
    tweak[..8].copy_from_slice(&block_index.to_le_bytes());
    tweaker.encrypt_block(GenericArray::from_mut_slice(&mut tweak));

    let mut out = plaintext.to_vec();
    for chunk in out.chunks_exact_mut(16) {
        xor(chunk, &tweak);
        crypt.encrypt_block(GenericArray::from_mut_slice(chunk));
        xor(chunk, &tweak);
        gf_mul(&mut tweak);
    }
    out
}

fn pad16(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    out.resize(out.len().div_ceil(16) * 16, 0);
    out
}

/// Builds the S5 image: an encrypted directory `/vault` holding one
/// file and one symlink.
fn encrypted_image() -> BTreeMap<u32, Vec<u8>> {
    let dir_nonce = [0xA1u8; 16];
    let file_nonce = [0xB2u8; 16];
    let link_nonce = [0xC3u8; 16];

    let dir_key = derive_key(&MASTER, &dir_nonce);
    let file_key = derive_key(&MASTER, &file_nonce);
    let link_key = derive_key(&MASTER, &link_nonce);

    let mut fs = UbifsBuilder::new();
    fs.add_ino(1, 0o040755, 0, 1, 0, 0, &[]);
    fs.add_dent(1, 1, b"vault", 5, 1);

    // The encrypted directory and its context xattr.
    fs.add_ino(5, 0o040700, 0, 1, CRYPT_FL, 0, &[]);
    fs.add_xent(5, 1, b"c", 6);
    fs.add_ino(6, 0o100400, 28, 1, XATTR_FL, 0, &context_bytes(&MASTER, &dir_nonce));

    // A file: name encrypted with the directory key, content with its
    // own key.
    let body = b"attack at dawn\n";
    let enc_name = cts_encrypt(&dir_key[..32], &pad16(b"secret.txt"));
    fs.add_dent(5, 2, &enc_name, 7, 0);
    fs.add_ino(7, 0o100600, body.len() as u64, 1, CRYPT_FL, 0, &[]);
    fs.add_xent(7, 1, b"c", 8);
    fs.add_ino(8, 0o100400, 28, 1, XATTR_FL, 0, &context_bytes(&MASTER, &file_nonce));
    let enc_body = xts_encrypt(&file_key, 0, &pad16(body));
    fs.add_data(7, 0, 0, body.len() as u32, body.len() as u16, &enc_body);

    // A symlink: target ciphertext carried behind a length prefix.
    let enc_link_name = cts_encrypt(&dir_key[..32], &pad16(b"escape"));
    let target_ct = cts_encrypt(&link_key[..32], &pad16(b"../outside/world"));
    let mut link_data = (target_ct.len() as u16).to_le_bytes().to_vec();
    link_data.extend_from_slice(&target_ct);
    fs.add_dent(5, 3, &enc_link_name, 9, 2);
    fs.add_ino(9, 0o120777, link_data.len() as u64, 1, CRYPT_FL, 0, &link_data);
    fs.add_xent(9, 1, b"c", 10);
    fs.add_ino(10, 0o100400, 28, 1, XATTR_FL, 0, &context_bytes(&MASTER, &link_nonce));

    fs.finish()
}

fn decode(lebs: &BTreeMap<u32, Vec<u8>>, master_key: Option<MasterKey>) -> EventCollector {
    let options = DecodeOptions {
        master_key,
        ..DecodeOptions::default()
    };

    let image = wrap_ubi_image(lebs, 0, 1);
    let file = UbiFile::new(Cursor::new(image), TEST_PEB_SIZE, 0, None).unwrap();
    let mut ubi = Ubi::new(file, &options).unwrap();

    let leb_file = ubi.volume_leb_file(0, 0);
    let mut fs = Ubifs::new(leb_file, options).unwrap();

    let mut collector = EventCollector::new();
    fs.decode(&mut collector).unwrap();
    collector
}

/// S5, keyed half: names and bodies decrypt.
#[test]
fn decrypts_names_and_contents_with_the_master_key() {
    let lebs = encrypted_image();
    let events = decode(&lebs, Some(MasterKey::from_bytes(&MASTER).unwrap()));

    assert!(events.events.iter().any(|e| matches!(
        e,
        Event::Dir { path, .. } if path == "/vault"
    )));
    assert!(events.events.iter().any(|e| matches!(
        e,
        Event::File { path, body, .. }
            if path == "/vault/secret.txt" && body == b"attack at dawn\n"
    )));
    assert!(events.events.iter().any(|e| matches!(
        e,
        Event::Symlink { path, target, .. }
            if path == "/vault/escape" && target == "../outside/world"
    )));
    assert_eq!(events.warnings().count(), 0);
}

/// S5, keyless half: ciphertext names, raw bodies, a decrypt warning.
#[test]
fn degrades_to_ciphertext_names_without_the_key() {
    let lebs = encrypted_image();
    let events = decode(&lebs, None);

    // The unencrypted root entry still lists normally.
    assert!(events.events.iter().any(|e| matches!(
        e,
        Event::Dir { path, .. } if path == "/vault"
    )));

    // No plaintext name or body leaks out of thin air.
    assert!(!events.events.iter().any(|e| matches!(
        e,
        Event::File { path, .. } if path.contains("secret.txt")
    )));

    let file = events
        .events
        .iter()
        .find_map(|e| match e {
            Event::File { path, body, .. } => Some((path, body)),
            _ => None,
        })
        .expect("the encrypted file still emits under its ciphertext name");

    // Base64 of the encrypted name: no separators, nothing path-unsafe.
    let name = file.0.rsplit('/').next().unwrap();
    assert!(!name.is_empty() && !name.contains('.'));
    assert_eq!(file.1.len(), 15);
    assert_ne!(&file.1[..], b"attack at dawn\n");

    assert!(events.warnings().any(|w| w.kind == WarningKind::DecryptError));
}

#[test]
fn a_wrong_master_key_is_reported_as_mismatch() {
    let lebs = encrypted_image();
    let wrong = MasterKey::from_bytes(&[9u8; 64]).unwrap();
    let events = decode(&lebs, Some(wrong));

    assert!(events.warnings().any(|w| w.kind == WarningKind::KeyMismatch));
    assert!(!events.events.iter().any(|e| matches!(
        e,
        Event::File { path, .. } if path.contains("secret.txt")
    )));
}
