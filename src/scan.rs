//! Heuristics for sizing and locating UBI/UBIFS data inside arbitrary
//! dump files.
//!
//! Firmware dumps rarely start at the flash data and never advertise
//! their erase-block geometry. These helpers scan for the EC-header and
//! node magics to recover a plausible start offset, PEB size, or LEB
//! size. They are best-effort by nature: explicit configuration always
//! wins over a guess.

use std::io::{Read, Seek, SeekFrom};

use bytemuck::pod_read_unaligned;
use hashbrown::HashMap;

use crate::ubifs::nodes::{self, SbNode, UBIFS_NODE_MAGIC};

/// What the bytes at a start offset look like.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    /// Raw UBI: PEBs with EC/VID headers.
    Ubi,

    /// Bare UBIFS: nodes addressed directly in LEB-sized slices.
    Ubifs,
}

/// On-disk byte patterns of the two magics.
const EC_MAGIC_BYTES: [u8; 4] = *b"UBI#";
const UBIFS_MAGIC_BYTES: [u8; 4] = UBIFS_NODE_MAGIC.to_le_bytes();

const SCAN_CHUNK: usize = 1 << 20;

/// Identifies the content at `offset` from its first 4 bytes.
pub fn guess_filetype<R: Read + Seek>(
    source: &mut R,
    offset: u64,
) -> std::io::Result<Option<ImageKind>> {
    source.seek(SeekFrom::Start(offset))?;
    let mut magic = [0u8; 4];
    if source.read(&mut magic)? < 4 {
        return Ok(None);
    }

    Ok(match magic {
        EC_MAGIC_BYTES => Some(ImageKind::Ubi),
        UBIFS_MAGIC_BYTES => Some(ImageKind::Ubifs),
        _ => None,
    })
}

/// Scans forward from `from` for the first EC or UBIFS magic.
pub fn guess_start_offset<R: Read + Seek>(
    source: &mut R,
    from: u64,
) -> std::io::Result<Option<u64>> {
    Ok(magic_offsets(source, from, None)?.first().map(|&(offs, _)| offs))
}

/// Guesses the PEB size as the dominant distance between consecutive
/// EC headers.
pub fn guess_peb_size<R: Read + Seek>(source: &mut R) -> std::io::Result<Option<u32>> {
    let offsets: Vec<u64> = magic_offsets(source, 0, Some(ImageKind::Ubi))?
        .into_iter()
        .map(|(offs, _)| offs)
        .collect();

    let mut votes: HashMap<u64, usize> = HashMap::new();
    for pair in offsets.windows(2) {
        let gap = pair[1] - pair[0];
        if gap > 0 {
            *votes.entry(gap).or_default() += 1;
        }
    }

    Ok(votes
        .into_iter()
        .max_by_key(|&(gap, count)| (count, core::cmp::Reverse(gap)))
        .and_then(|(gap, _)| u32::try_from(gap).ok()))
}

/// Reads the LEB size out of the superblock node a bare UBIFS image
/// starts with.
pub fn guess_leb_size<R: Read + Seek>(source: &mut R) -> std::io::Result<Option<u32>> {
    source.seek(SeekFrom::Start(0))?;
    let mut head = vec![0u8; nodes::UBIFS_SB_PARSE_SZ];
    if source.read(&mut head)? < head.len() {
        return Ok(None);
    }

    if head[..4] != UBIFS_MAGIC_BYTES || head[20] != nodes::NodeType::SB.0 {
        return Ok(None);
    }

    let sb: SbNode = pod_read_unaligned(&head);
    Ok(Some(sb.leb_size()))
}

/// All magic occurrences (offset, kind), in file order.
fn magic_offsets<R: Read + Seek>(
    source: &mut R,
    from: u64,
    only: Option<ImageKind>,
) -> std::io::Result<Vec<(u64, ImageKind)>> {
    source.seek(SeekFrom::Start(from))?;

    let mut found = Vec::new();
    let mut carry: Vec<u8> = Vec::new();
    let mut base = from;

    loop {
        let mut chunk = vec![0u8; SCAN_CHUNK];
        let n = source.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        chunk.truncate(n);

        // Keep 3 bytes of the previous chunk so magics spanning the seam
        // are still seen.
        let seam = carry.len();
        carry.extend_from_slice(&chunk);

        for i in 0..carry.len().saturating_sub(3) {
            let window: [u8; 4] = carry[i..i + 4].try_into().unwrap();
            let kind = match window {
                EC_MAGIC_BYTES => ImageKind::Ubi,
                UBIFS_MAGIC_BYTES => ImageKind::Ubifs,
                _ => continue,
            };
            if only.map_or(true, |want| want == kind) {
                found.push((base - seam as u64 + i as u64, kind));
            }
        }

        base += n as u64;
        let keep = carry.len().saturating_sub(3);
        carry.drain(..keep);
    }

    Ok(found)
}
