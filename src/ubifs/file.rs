//! Reassembly of regular-file bodies from their data extents.

use crate::err::UbifsError;
use crate::ubifs::compress::{self, ComprType};
use crate::ubifs::crypt::FileKey;
use crate::ubifs::nodes::UBIFS_BLOCK_SIZE;
use crate::ubifs::walk::InodeEntry;

/// Rebuilds the body of a regular file.
///
/// Extents land at `block_index * 4096`; regions no extent covers stay
/// zero (sparse holes), and the buffer is sized to the inode's logical
/// size, which also trims the partial final block. With `key` set each
/// payload is AES-XTS-decrypted (and its ciphertext padding dropped)
/// before decompression.
///
/// # Errors
///
/// Fails with [`UbifsError::OrphanInode`] when the entry has no inode
/// node, and with [`UbifsError::Decompress`] when a payload does not
/// inflate to exactly the length the inode admits for its block.
pub(crate) fn reassemble(
    inum: u64,
    entry: &InodeEntry,
    key: Option<&FileKey>,
) -> Result<Vec<u8>, UbifsError> {
    let Some((ino, _)) = entry.ino.as_ref() else {
        return Err(UbifsError::OrphanInode { inum });
    };

    let size = ino.size();
    let mut out = vec![0u8; size as usize];

    for (&block, extent) in &entry.data {
        let offset = u64::from(block) * u64::from(UBIFS_BLOCK_SIZE);
        if offset >= size {
            // Stale extent past the file end; a truncation that was never
            // committed. Nothing of it is visible.
            continue;
        }

        let expected = u64::min(u64::from(UBIFS_BLOCK_SIZE), size - offset) as usize;

        let payload;
        let raw = match key {
            Some(key) => {
                let mut plain = key
                    .decrypt_block(u64::from(block), &extent.payload)
                    .map_err(UbifsError::Crypto)?;
                let compr_size = extent.node.compr_size() as usize;
                if compr_size != 0 && compr_size <= plain.len() {
                    plain.truncate(compr_size);
                }
                payload = plain;
                &payload[..]
            }
            None => &extent.payload[..],
        };

        let body = compress::decompress(
            ComprType::from_raw(extent.node.compr_type()),
            raw,
            extent.node.size() as usize,
        )
        .map_err(|e| UbifsError::Decompress {
            inum,
            block,
            reason: e.to_string(),
        })?;

        if body.len() != expected {
            return Err(UbifsError::Decompress {
                inum,
                block,
                reason: format!(
                    "block inflates to {} bytes where the inode admits {expected}",
                    body.len()
                ),
            });
        }

        out[offset as usize..offset as usize + body.len()].copy_from_slice(&body);
    }

    Ok(out)
}

/// Rebuilds an encrypted file for which no usable key exists: raw
/// ciphertext extents placed at their block offsets, truncated to the
/// inode size. Callers pair this with a decrypt-failure warning.
pub(crate) fn reassemble_ciphertext(
    inum: u64,
    entry: &InodeEntry,
) -> Result<Vec<u8>, UbifsError> {
    let Some((ino, _)) = entry.ino.as_ref() else {
        return Err(UbifsError::OrphanInode { inum });
    };

    let size = ino.size() as usize;
    let mut out = vec![0u8; size];

    for (&block, extent) in &entry.data {
        let offset = block as usize * UBIFS_BLOCK_SIZE as usize;
        if offset >= size {
            continue;
        }
        let n = extent.payload.len().min(size - offset);
        out[offset..offset + n].copy_from_slice(&extent.payload[..n]);
    }

    Ok(out)
}
