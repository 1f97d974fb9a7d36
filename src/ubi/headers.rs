//! On-flash UBI header layouts.
//!
//! A PEB starts with the erase-count header; the volume-identifier header
//! sits at the offset the EC header records, and the data area begins at
//! `data_offset`. Both headers, and the volume-table records stored in the
//! internal layout volume, are big-endian as laid out by the kernel's
//! `ubi-media.h`. Multi-byte fields are therefore private and exposed
//! through accessors applying the byte-order conversion.
//!
//! All three structures carry a trailing CRC32 (seed `0xFFFFFFFF`, no final
//! inversion) over the bytes preceding it.

use bytemuck::{Pod, Zeroable};

use super::{Sqnum, VolumeId};

/// "UBI#", start of every erase-count header.
pub const UBI_EC_HDR_MAGIC: u32 = 0x5542_4923;

/// "UBI!", start of every volume-identifier header.
pub const UBI_VID_HDR_MAGIC: u32 = 0x5542_4921;

/// The only on-flash format version this decoder understands.
pub const UBI_VERSION: u8 = 1;

pub const UBI_EC_HDR_SIZE: usize = 64;
pub const UBI_VID_HDR_SIZE: usize = 64;
pub const UBI_VTBL_RECORD_SIZE: usize = 172;

/// Volume id of the internal layout volume carrying the volume table.
pub const UBI_LAYOUT_VOLUME_ID: u32 = 0x7FFF_EFFF;

/// Highest user volume id; everything at or above is internal.
pub const UBI_INTERNAL_VOL_START: u32 = 0x7FFF_EFFF;

pub const UBI_VOL_NAME_MAX: usize = 127;
pub const UBI_MAX_VOLUMES: usize = 128;

/// UBI's CRC32: IEEE polynomial, seed `0xFFFFFFFF`, without the final
/// inversion the zlib convention applies.
pub(crate) fn ubi_crc32(buf: &[u8]) -> u32 {
    !crc32fast::hash(buf)
}

/// Volume type recorded in a VID header or a volume-table record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct VolumeType(u8);

impl VolumeType {
    /// LEBs are mapped on demand; the volume grows as it is written.
    pub const DYNAMIC: Self = Self(1);

    /// Fixed content whose used size is recorded per LEB.
    pub const STATIC: Self = Self(2);

    pub fn is_static(self) -> bool {
        self == Self::STATIC
    }
}

/// Erase-count header, at offset 0 of every PEB.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct EcHeader {
    magic: u32,
    version: u8,
    padding1: [u8; 3],
    ec: u64,
    vid_hdr_offset: u32,
    data_offset: u32,
    image_seq: u32,
    padding2: [u8; 32],
    hdr_crc: u32,
}

impl EcHeader {
    pub fn magic(&self) -> u32 {
        u32::from_be(self.magic)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Times this PEB has been erased. Informational only for a reader.
    pub fn erase_count(&self) -> u64 {
        u64::from_be(self.ec)
    }

    /// Offset of the VID header inside the PEB.
    pub fn vid_hdr_offset(&self) -> u32 {
        u32::from_be(self.vid_hdr_offset)
    }

    /// Offset of the data area inside the PEB.
    pub fn data_offset(&self) -> u32 {
        u32::from_be(self.data_offset)
    }

    /// Random sequence shared by every PEB written as part of one image.
    pub fn image_seq(&self) -> u32 {
        u32::from_be(self.image_seq)
    }

    pub fn hdr_crc(&self) -> u32 {
        u32::from_be(self.hdr_crc)
    }

    /// Recomputes the header CRC from its first 60 bytes.
    pub fn compute_crc(raw: &[u8]) -> u32 {
        ubi_crc32(&raw[..UBI_EC_HDR_SIZE - 4])
    }
}

/// Volume-identifier header: which volume and which LEB this PEB carries.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct VidHeader {
    magic: u32,
    version: u8,
    vol_type: u8,
    copy_flag: u8,
    compat: u8,
    vol_id: u32,
    lnum: u32,
    padding1: [u8; 4],
    data_size: u32,
    used_ebs: u32,
    data_pad: u32,
    data_crc: u32,
    padding2: [u8; 4],
    sqnum: u64,
    padding3: [u8; 12],
    hdr_crc: u32,
}

impl VidHeader {
    pub fn magic(&self) -> u32 {
        u32::from_be(self.magic)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn vol_type(&self) -> VolumeType {
        VolumeType(self.vol_type)
    }

    /// Set when this PEB was written while moving the LEB during wear
    /// levelling. Two PEBs claiming one LEB differ by this and `sqnum`.
    pub fn copy_flag(&self) -> u8 {
        self.copy_flag
    }

    pub fn compat(&self) -> u8 {
        self.compat
    }

    pub fn vol_id(&self) -> VolumeId {
        VolumeId(u32::from_be(self.vol_id))
    }

    /// Logical erase block number this PEB carries.
    pub fn lnum(&self) -> u32 {
        u32::from_be(self.lnum)
    }

    /// Bytes of payload in this LEB. Meaningful for static volumes and for
    /// copied LEBs; zero otherwise.
    pub fn data_size(&self) -> u32 {
        u32::from_be(self.data_size)
    }

    /// Total LEBs of a static volume, recorded in each of its headers.
    pub fn used_ebs(&self) -> u32 {
        u32::from_be(self.used_ebs)
    }

    /// Bytes of padding between the data area and the end of the PEB, used
    /// to keep LEB sizes aligned for flash with odd geometry.
    pub fn data_pad(&self) -> u32 {
        u32::from_be(self.data_pad)
    }

    pub fn data_crc(&self) -> u32 {
        u32::from_be(self.data_crc)
    }

    /// Global, monotonically increasing number arbitrating duplicate LEB
    /// claims: the greater `sqnum` is the newer copy.
    pub fn sqnum(&self) -> Sqnum {
        Sqnum(u64::from_be(self.sqnum))
    }

    pub fn hdr_crc(&self) -> u32 {
        u32::from_be(self.hdr_crc)
    }

    pub fn compute_crc(raw: &[u8]) -> u32 {
        ubi_crc32(&raw[..UBI_VID_HDR_SIZE - 4])
    }
}

/// One volume-table record from the layout volume.
///
/// The layout volume holds [`UBI_MAX_VOLUMES`] of these back to back, one
/// per possible volume id; unused slots are all zeroes (whose CRC happens
/// to validate, so emptiness is detected through `name_len == 0`).
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct VtblRecord {
    reserved_pebs: u32,
    alignment: u32,
    data_pad: u32,
    vol_type: u8,
    upd_marker: u8,
    name_len: u16,
    name: [u8; UBI_VOL_NAME_MAX + 1],
    flags: u8,
    padding: [u8; 23],
    crc: u32,
}

impl VtblRecord {
    pub fn reserved_pebs(&self) -> u32 {
        u32::from_be(self.reserved_pebs)
    }

    pub fn alignment(&self) -> u32 {
        u32::from_be(self.alignment)
    }

    pub fn data_pad(&self) -> u32 {
        u32::from_be(self.data_pad)
    }

    pub fn vol_type(&self) -> VolumeType {
        VolumeType(self.vol_type)
    }

    pub fn name_len(&self) -> usize {
        u16::from_be(self.name_len) as usize
    }

    /// Volume name, if the record is in use and its name well-formed.
    pub fn name(&self) -> Option<&str> {
        let len = self.name_len();
        if len == 0 || len > UBI_VOL_NAME_MAX {
            return None;
        }

        core::str::from_utf8(&self.name[..len]).ok()
    }

    pub fn crc(&self) -> u32 {
        u32::from_be(self.crc)
    }

    pub fn compute_crc(raw: &[u8]) -> u32 {
        ubi_crc32(&raw[..UBI_VTBL_RECORD_SIZE - 4])
    }
}
