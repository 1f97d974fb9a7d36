//! Per-PEB header parsing and validation.

use bytemuck::pod_read_unaligned;

use crate::err::UbiError;
use crate::io::PebIndex;
use crate::options::DecodeOptions;
use crate::ubi::headers::{
    EcHeader, VidHeader, UBI_EC_HDR_MAGIC, UBI_EC_HDR_SIZE, UBI_VERSION, UBI_VID_HDR_MAGIC,
    UBI_VID_HDR_SIZE,
};

/// One PEB whose headers parsed (or were forced in despite errors).
#[derive(Clone, Copy, Debug)]
pub struct Block {
    pub peb: PebIndex,
    pub ec: EcHeader,
    pub vid: VidHeader,

    /// `false` when a header failed validation but
    /// `ignore_block_header_errors` kept the block anyway.
    pub valid: bool,
}

impl Block {
    /// Offset of this block's data area inside its PEB.
    pub fn data_offset(&self) -> u32 {
        self.ec.data_offset()
    }
}

/// What a PEB turned out to contain.
pub(crate) enum PebParse {
    /// Both headers check out (or errors were configured away).
    Block(Block),

    /// The VID area is erased: the PEB is mapped to no LEB.
    Empty,

    /// The PEB is not usable as part of any volume.
    Bad(UbiError),
}

/// Parses the EC and VID headers of one raw PEB.
///
/// Validation order follows the on-flash layering: EC magic, EC CRC, then
/// the VID area (whose erased state is detected by an all-ones magic),
/// then VID magic and CRC. With `ignore_block_header_errors` set, magic
/// and CRC failures degrade to an invalid-but-kept [`Block`] as long as
/// the headers lie inside the PEB.
pub(crate) fn parse_peb(peb: PebIndex, raw: &[u8], options: &DecodeOptions) -> PebParse {
    let forced = options.ignore_block_header_errors;

    if raw.len() < UBI_EC_HDR_SIZE {
        return PebParse::Bad(UbiError::Truncated { peb: peb.0 });
    }

    let ec: EcHeader = pod_read_unaligned(&raw[..UBI_EC_HDR_SIZE]);
    let mut valid = true;

    if ec.magic() != UBI_EC_HDR_MAGIC {
        if !forced {
            return PebParse::Bad(UbiError::MagicMismatch {
                peb: peb.0,
                expected: UBI_EC_HDR_MAGIC,
                found: ec.magic(),
            });
        }
        valid = false;
    }

    if ec.version() != UBI_VERSION {
        if !forced {
            return PebParse::Bad(UbiError::UnsupportedVersion {
                peb: peb.0,
                version: ec.version(),
            });
        }
        valid = false;
    }

    let computed = EcHeader::compute_crc(raw);
    if ec.hdr_crc() != computed {
        if !forced {
            return PebParse::Bad(UbiError::CrcMismatch {
                peb: peb.0,
                stored: ec.hdr_crc(),
                computed,
            });
        }
        valid = false;
    }

    let vid_offs = ec.vid_hdr_offset() as usize;
    if vid_offs + UBI_VID_HDR_SIZE > raw.len() || ec.data_offset() as usize > raw.len() {
        return PebParse::Bad(UbiError::Truncated { peb: peb.0 });
    }

    let vid_raw = &raw[vid_offs..vid_offs + UBI_VID_HDR_SIZE];
    let vid: VidHeader = pod_read_unaligned(vid_raw);

    if vid.magic() == u32::MAX {
        // Erased flash reads back all ones: the PEB carries no LEB.
        // Forced decoding keeps even these, falling through to the
        // magic and CRC checks below to mark the block invalid.
        if !forced {
            return PebParse::Empty;
        }
        valid = false;
    }

    if vid.magic() != UBI_VID_HDR_MAGIC {
        if !forced {
            return PebParse::Bad(UbiError::MagicMismatch {
                peb: peb.0,
                expected: UBI_VID_HDR_MAGIC,
                found: vid.magic(),
            });
        }
        valid = false;
    }

    let computed = VidHeader::compute_crc(vid_raw);
    if vid.hdr_crc() != computed {
        if !forced {
            return PebParse::Bad(UbiError::CrcMismatch {
                peb: peb.0,
                stored: vid.hdr_crc(),
                computed,
            });
        }
        valid = false;
    }

    PebParse::Block(Block {
        peb,
        ec,
        vid,
        valid,
    })
}
