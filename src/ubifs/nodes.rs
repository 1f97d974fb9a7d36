//! On-medium UBIFS node layouts and the node reader.
//!
//! Every UBIFS structure is a node: a 24-byte common header followed by a
//! typed body, 8-byte aligned on the LEB. All fields are little-endian per
//! the kernel's `ubifs-media.h`; fixed-size bodies are `bytemuck` `Pod`
//! structs read in place, variable tails (inline data, names, index
//! branches) are carried alongside in the [`Node`] sum type.
//!
//! [`parse_node`] is the single entry point: it validates the magic, the
//! claimed length and the node CRC, then dispatches on the node type. A
//! node that fails any of these checks is reported, never partially
//! parsed.

use bytemuck::{pod_read_unaligned, Pod, Zeroable};

use crate::err::UbifsError;
use crate::ubifs::key::Key;

/// Magic number opening every node's common header.
pub const UBIFS_NODE_MAGIC: u32 = 0x0610_1831;

/// Size of the logical block a data node covers.
pub const UBIFS_BLOCK_SIZE: u32 = 4096;

/// Data shorter than this is stored uncompressed regardless of the
/// inode's compression type.
pub const UBIFS_MIN_COMPR_LEN: u32 = 128;

/// LEB holding the superblock node.
pub const UBIFS_SB_LNUM: u32 = 0;

/// First of the two LEBs holding master-node copies.
pub const UBIFS_MST_LNUM: u32 = 1;

pub const UBIFS_CH_SZ: usize = 24;
pub const UBIFS_INO_NODE_SZ: usize = 160;
pub const UBIFS_DATA_NODE_SZ: usize = 48;
pub const UBIFS_DENT_NODE_SZ: usize = 56;
pub const UBIFS_TRUN_NODE_SZ: usize = 56;
pub const UBIFS_MST_NODE_SZ: usize = 512;
pub const UBIFS_REF_NODE_SZ: usize = 64;
pub const UBIFS_CS_NODE_SZ: usize = 32;
pub const UBIFS_ORPH_NODE_SZ: usize = 32;
pub const UBIFS_IDX_NODE_SZ: usize = 28;
pub const UBIFS_PAD_NODE_SZ: usize = 28;

/// Bytes of the superblock node this decoder interprets; the node itself
/// fills a whole LEB-aligned 4096 bytes.
pub const UBIFS_SB_PARSE_SZ: usize = 128;

/// On-disk key length inside index-node branches (simple key format).
pub const UBIFS_SK_LEN: usize = 8;

const UBIFS_BRANCH_SZ: usize = 12;

/// UBIFS node CRC: IEEE polynomial seeded with `0xFFFFFFFF` over the node
/// bytes past the magic and CRC words, without final inversion.
pub(crate) fn node_crc32(buf: &[u8]) -> u32 {
    !crc32fast::hash(buf)
}

/// Discriminant stored in the common header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct NodeType(pub u8);

impl NodeType {
    pub const INO: Self = Self(0);
    pub const DATA: Self = Self(1);
    pub const DENT: Self = Self(2);
    pub const XENT: Self = Self(3);
    pub const TRUN: Self = Self(4);
    pub const PAD: Self = Self(5);
    pub const SB: Self = Self(6);
    pub const MST: Self = Self(7);
    pub const REF: Self = Self(8);
    pub const IDX: Self = Self(9);
    pub const CS: Self = Self(10);
    pub const ORPH: Self = Self(11);
}

/// Directory-entry type, shared by dent and xent nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct DentType(pub u8);

impl DentType {
    pub const REG: Self = Self(0);
    pub const DIR: Self = Self(1);
    pub const LNK: Self = Self(2);
    pub const BLK: Self = Self(3);
    pub const CHR: Self = Self(4);
    pub const FIFO: Self = Self(5);
    pub const SOCK: Self = Self(6);
}

bitflags::bitflags! {
    /// Inode flags relevant to decoding.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InodeFlags: u32 {
        const COMPR = 0x01;
        const SYNC = 0x02;
        const IMMUTABLE = 0x04;
        const APPEND = 0x08;
        const DIRSYNC = 0x10;
        const XATTR = 0x20;
        const ORPHAN = 0x40;
        const CRYPT = 0x80;

        const _ = !0;
    }
}

/// Common header opening every node.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct CommonHeader {
    magic: u32,
    crc: u32,
    sqnum: u64,
    len: u32,
    node_type: u8,
    group_type: u8,
    padding: [u8; 2],
}

impl CommonHeader {
    pub fn magic(&self) -> u32 {
        u32::from_le(self.magic)
    }

    pub fn crc(&self) -> u32 {
        u32::from_le(self.crc)
    }

    /// Journal sequence number; arbitrates duplicate leaves during walk.
    pub fn sqnum(&self) -> u64 {
        u64::from_le(self.sqnum)
    }

    /// Full node length in bytes, common header included.
    pub fn len(&self) -> u32 {
        u32::from_le(self.len)
    }

    pub fn node_type(&self) -> NodeType {
        NodeType(self.node_type)
    }

    pub fn group_type(&self) -> u8 {
        self.group_type
    }
}

/// Inode node: metadata plus inline data (symlink target, device number,
/// or the tail of very small files).
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct InoNode {
    ch: CommonHeader,
    key: [u8; 16],
    creat_sqnum: u64,
    size: u64,
    atime_sec: u64,
    ctime_sec: u64,
    mtime_sec: u64,
    atime_nsec: u32,
    ctime_nsec: u32,
    mtime_nsec: u32,
    nlink: u32,
    uid: u32,
    gid: u32,
    mode: u32,
    flags: u32,
    data_len: u32,
    xattr_cnt: u32,
    xattr_size: u32,
    padding1: [u8; 4],
    xattr_names: u32,
    compr_type: u16,
    padding2: [u8; 26],
}

impl InoNode {
    pub fn ch(&self) -> &CommonHeader {
        &self.ch
    }

    pub fn key(&self) -> Key {
        Key::from_bytes(&self.key)
    }

    pub fn inum(&self) -> u64 {
        self.key().inum
    }

    /// Logical file size in bytes.
    pub fn size(&self) -> u64 {
        u64::from_le(self.size)
    }

    pub fn atime_sec(&self) -> u64 {
        u64::from_le(self.atime_sec)
    }

    pub fn ctime_sec(&self) -> u64 {
        u64::from_le(self.ctime_sec)
    }

    pub fn mtime_sec(&self) -> u64 {
        u64::from_le(self.mtime_sec)
    }

    pub fn nlink(&self) -> u32 {
        u32::from_le(self.nlink)
    }

    pub fn uid(&self) -> u32 {
        u32::from_le(self.uid)
    }

    pub fn gid(&self) -> u32 {
        u32::from_le(self.gid)
    }

    pub fn mode(&self) -> u32 {
        u32::from_le(self.mode)
    }

    pub fn flags(&self) -> InodeFlags {
        InodeFlags::from_bits_retain(u32::from_le(self.flags))
    }

    /// Length of the inline data following the fixed part.
    pub fn data_len(&self) -> u32 {
        u32::from_le(self.data_len)
    }

    pub fn xattr_cnt(&self) -> u32 {
        u32::from_le(self.xattr_cnt)
    }

    /// Default compressor for this inode's data nodes.
    pub fn compr_type(&self) -> u16 {
        u16::from_le(self.compr_type)
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags().contains(InodeFlags::CRYPT)
    }
}

/// Directory-entry node; xattr entries share the layout.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct DentNode {
    ch: CommonHeader,
    key: [u8; 16],
    inum: u64,
    padding1: u8,
    dtype: u8,
    nlen: u16,
    cookie: u32,
}

impl DentNode {
    pub fn ch(&self) -> &CommonHeader {
        &self.ch
    }

    /// Key of this entry: parent inode number plus name hash.
    pub fn key(&self) -> Key {
        Key::from_bytes(&self.key)
    }

    /// Inode the entry points at.
    pub fn inum(&self) -> u64 {
        u64::from_le(self.inum)
    }

    pub fn dtype(&self) -> DentType {
        DentType(self.dtype)
    }

    pub fn nlen(&self) -> usize {
        u16::from_le(self.nlen) as usize
    }
}

/// Data node: one compressed (possibly encrypted) 4096-byte block of a
/// file.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct DataNode {
    ch: CommonHeader,
    key: [u8; 16],
    size: u32,
    compr_type: u16,
    compr_size: u16,
}

impl DataNode {
    pub fn ch(&self) -> &CommonHeader {
        &self.ch
    }

    /// Key of this extent: owning inode number plus block index.
    pub fn key(&self) -> Key {
        Key::from_bytes(&self.key)
    }

    pub fn inum(&self) -> u64 {
        self.key().inum
    }

    /// Index of the 4096-byte block this node covers.
    pub fn block_index(&self) -> u32 {
        self.key().hash
    }

    /// Uncompressed payload size; at most [`UBIFS_BLOCK_SIZE`].
    pub fn size(&self) -> u32 {
        u32::from_le(self.size)
    }

    pub fn compr_type(&self) -> u16 {
        u16::from_le(self.compr_type)
    }

    /// For encrypted nodes, the compressed length before the ciphertext
    /// padding; zero otherwise.
    pub fn compr_size(&self) -> u16 {
        u16::from_le(self.compr_size)
    }
}

/// Truncation node, written in the journal when a file shrinks.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct TrunNode {
    ch: CommonHeader,
    inum: u32,
    padding: [u8; 12],
    old_size: u64,
    new_size: u64,
}

impl TrunNode {
    pub fn ch(&self) -> &CommonHeader {
        &self.ch
    }

    pub fn inum(&self) -> u64 {
        u64::from(u32::from_le(self.inum))
    }

    pub fn old_size(&self) -> u64 {
        u64::from_le(self.old_size)
    }

    pub fn new_size(&self) -> u64 {
        u64::from_le(self.new_size)
    }
}

/// Superblock node, at the start of LEB 0.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct SbNode {
    ch: CommonHeader,
    padding: [u8; 2],
    key_hash: u8,
    key_fmt: u8,
    flags: u32,
    min_io_size: u32,
    leb_size: u32,
    leb_cnt: u32,
    max_leb_cnt: u32,
    max_bud_bytes: u64,
    log_lebs: u32,
    lpt_lebs: u32,
    orph_lebs: u32,
    jhead_cnt: u32,
    fanout: u32,
    lsave_cnt: u32,
    fmt_version: u32,
    default_compr: u16,
    padding1: [u8; 2],
    rp_uid: u32,
    rp_gid: u32,
    rp_size: u64,
    time_gran: u32,
    uuid: [u8; 16],
    ro_compat_version: u32,
}

impl SbNode {
    pub fn ch(&self) -> &CommonHeader {
        &self.ch
    }

    pub fn key_hash(&self) -> u8 {
        self.key_hash
    }

    pub fn key_fmt(&self) -> u8 {
        self.key_fmt
    }

    pub fn flags(&self) -> u32 {
        u32::from_le(self.flags)
    }

    pub fn min_io_size(&self) -> u32 {
        u32::from_le(self.min_io_size)
    }

    pub fn leb_size(&self) -> u32 {
        u32::from_le(self.leb_size)
    }

    pub fn leb_cnt(&self) -> u32 {
        u32::from_le(self.leb_cnt)
    }

    pub fn max_leb_cnt(&self) -> u32 {
        u32::from_le(self.max_leb_cnt)
    }

    pub fn log_lebs(&self) -> u32 {
        u32::from_le(self.log_lebs)
    }

    pub fn fanout(&self) -> u32 {
        u32::from_le(self.fanout)
    }

    pub fn fmt_version(&self) -> u32 {
        u32::from_le(self.fmt_version)
    }

    pub fn default_compr(&self) -> u16 {
        u16::from_le(self.default_compr)
    }

    pub fn time_gran(&self) -> u32 {
        u32::from_le(self.time_gran)
    }

    pub fn uuid(&self) -> &[u8; 16] {
        &self.uuid
    }

    pub fn ro_compat_version(&self) -> u32 {
        u32::from_le(self.ro_compat_version)
    }
}

/// Master node: root of the index plus global accounting.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct MstNode {
    ch: CommonHeader,
    highest_inum: u64,
    cmt_no: u64,
    flags: u32,
    log_lnum: u32,
    root_lnum: u32,
    root_offs: u32,
    root_len: u32,
    gc_lnum: u32,
    ihead_lnum: u32,
    ihead_offs: u32,
    index_size: u64,
    total_free: u64,
    total_dirty: u64,
    total_used: u64,
    total_dead: u64,
    total_dark: u64,
    lpt_lnum: u32,
    lpt_offs: u32,
    nhead_lnum: u32,
    nhead_offs: u32,
    ltab_lnum: u32,
    ltab_offs: u32,
    lsave_lnum: u32,
    lsave_offs: u32,
    lscan_lnum: u32,
    empty_lebs: u32,
    idx_lebs: u32,
    leb_cnt: u32,
    hash_root_idx: [u8; 64],
    hash_lpt: [u8; 64],
    hmac: [u8; 64],
    padding: [u8; 152],
}

impl MstNode {
    pub fn ch(&self) -> &CommonHeader {
        &self.ch
    }

    /// Highest inode number committed so far.
    pub fn highest_inum(&self) -> u64 {
        u64::from_le(self.highest_inum)
    }

    /// Commit counter; arbitrates the two master copies.
    pub fn cmt_no(&self) -> u64 {
        u64::from_le(self.cmt_no)
    }

    pub fn flags(&self) -> u32 {
        u32::from_le(self.flags)
    }

    pub fn log_lnum(&self) -> u32 {
        u32::from_le(self.log_lnum)
    }

    pub fn root_lnum(&self) -> u32 {
        u32::from_le(self.root_lnum)
    }

    pub fn root_offs(&self) -> u32 {
        u32::from_le(self.root_offs)
    }

    pub fn root_len(&self) -> u32 {
        u32::from_le(self.root_len)
    }

    pub fn index_size(&self) -> u64 {
        u64::from_le(self.index_size)
    }

    pub fn total_free(&self) -> u64 {
        u64::from_le(self.total_free)
    }

    pub fn total_dirty(&self) -> u64 {
        u64::from_le(self.total_dirty)
    }

    pub fn leb_cnt(&self) -> u32 {
        u32::from_le(self.leb_cnt)
    }
}

/// Journal-head reference node.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct RefNode {
    ch: CommonHeader,
    lnum: u32,
    offs: u32,
    jhead: u32,
    padding: [u8; 28],
}

impl RefNode {
    pub fn lnum(&self) -> u32 {
        u32::from_le(self.lnum)
    }

    pub fn offs(&self) -> u32 {
        u32::from_le(self.offs)
    }

    pub fn jhead(&self) -> u32 {
        u32::from_le(self.jhead)
    }
}

/// Commit-start node.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct CsNode {
    ch: CommonHeader,
    cmt_no: u64,
}

impl CsNode {
    pub fn cmt_no(&self) -> u64 {
        u64::from_le(self.cmt_no)
    }
}

/// Index node header; its branch array is parsed alongside.
#[derive(Clone, Copy, Debug)]
pub struct IdxNode {
    pub child_cnt: u16,
    pub level: u16,
}

/// One branch of an index node: where a child node lives, and the least
/// key reachable through it.
#[derive(Clone, Copy, Debug)]
pub struct Branch {
    pub lnum: u32,
    pub offs: u32,
    pub len: u32,
    pub key: Key,
}

/// Padding node; `pad_len` further bytes after the node are dead space.
#[derive(Clone, Copy, Debug)]
pub struct PadNode {
    pub pad_len: u32,
}

/// Orphan node listing inodes deleted but not yet committed.
#[derive(Clone, Debug)]
pub struct OrphNode {
    pub cmt_no: u64,
    pub inos: Vec<u64>,
}

/// A fully parsed node: fixed body plus its variable tail where one
/// exists. Dispatch is by tag, per the common header's node type.
#[derive(Clone, Debug)]
pub enum Node {
    /// Inode with its inline data.
    Ino(InoNode, Vec<u8>),

    /// Data extent with its (compressed, possibly encrypted) payload.
    Data(DataNode, Vec<u8>),

    /// Directory entry with its (possibly encrypted) name.
    Dent(DentNode, Vec<u8>),

    /// Extended-attribute entry with its name.
    Xent(DentNode, Vec<u8>),

    Trun(TrunNode),
    Sb(SbNode),
    Mst(MstNode),
    Ref(RefNode),
    Cs(CsNode),
    Orph(OrphNode),
    Idx(IdxNode, Vec<Branch>),
    Pad(PadNode),
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        match self {
            Node::Ino(..) => NodeType::INO,
            Node::Data(..) => NodeType::DATA,
            Node::Dent(..) => NodeType::DENT,
            Node::Xent(..) => NodeType::XENT,
            Node::Trun(_) => NodeType::TRUN,
            Node::Sb(_) => NodeType::SB,
            Node::Mst(_) => NodeType::MST,
            Node::Ref(_) => NodeType::REF,
            Node::Cs(_) => NodeType::CS,
            Node::Orph(_) => NodeType::ORPH,
            Node::Idx(..) => NodeType::IDX,
            Node::Pad(_) => NodeType::PAD,
        }
    }
}

/// Parses and validates the common header at the start of `buf`.
///
/// `buf` need not hold the whole node yet; callers use the returned
/// length to fetch the rest.
pub(crate) fn parse_common_header(
    lnum: u32,
    offs: u32,
    buf: &[u8],
) -> Result<CommonHeader, UbifsError> {
    if buf.len() < UBIFS_CH_SZ {
        return Err(UbifsError::Truncated {
            lnum,
            offs,
            len: UBIFS_CH_SZ as u32,
            available: buf.len() as u32,
        });
    }

    let ch: CommonHeader = pod_read_unaligned(&buf[..UBIFS_CH_SZ]);

    if ch.magic() != UBIFS_NODE_MAGIC {
        return Err(UbifsError::MagicMismatch {
            lnum,
            offs,
            found: ch.magic(),
        });
    }

    if (ch.len() as usize) < UBIFS_CH_SZ {
        return Err(UbifsError::Truncated {
            lnum,
            offs,
            len: ch.len(),
            available: UBIFS_CH_SZ as u32,
        });
    }

    Ok(ch)
}

/// Parses one whole node from `buf` (which must hold exactly `ch.len()`
/// bytes), validating the CRC before dispatching on the node type.
pub(crate) fn parse_node(lnum: u32, offs: u32, buf: &[u8]) -> Result<Node, UbifsError> {
    let ch = parse_common_header(lnum, offs, buf)?;

    let len = ch.len() as usize;
    if buf.len() < len {
        return Err(UbifsError::Truncated {
            lnum,
            offs,
            len: ch.len(),
            available: buf.len() as u32,
        });
    }
    let buf = &buf[..len];

    let computed = node_crc32(&buf[8..]);
    if ch.crc() != computed {
        return Err(UbifsError::CrcMismatch {
            lnum,
            offs,
            stored: ch.crc(),
            computed,
        });
    }

    let need = |min: usize| -> Result<(), UbifsError> {
        if len < min {
            return Err(UbifsError::Truncated {
                lnum,
                offs,
                len: min as u32,
                available: len as u32,
            });
        }
        Ok(())
    };

    match ch.node_type() {
        NodeType::INO => {
            need(UBIFS_INO_NODE_SZ)?;
            let node: InoNode = pod_read_unaligned(&buf[..UBIFS_INO_NODE_SZ]);
            let data_len = (node.data_len() as usize).min(len - UBIFS_INO_NODE_SZ);
            let data = buf[UBIFS_INO_NODE_SZ..UBIFS_INO_NODE_SZ + data_len].to_vec();
            Ok(Node::Ino(node, data))
        }
        NodeType::DATA => {
            need(UBIFS_DATA_NODE_SZ)?;
            let node: DataNode = pod_read_unaligned(&buf[..UBIFS_DATA_NODE_SZ]);
            Ok(Node::Data(node, buf[UBIFS_DATA_NODE_SZ..].to_vec()))
        }
        NodeType::DENT | NodeType::XENT => {
            need(UBIFS_DENT_NODE_SZ)?;
            let node: DentNode = pod_read_unaligned(&buf[..UBIFS_DENT_NODE_SZ]);
            let nlen = node.nlen().min(len - UBIFS_DENT_NODE_SZ);
            let name = buf[UBIFS_DENT_NODE_SZ..UBIFS_DENT_NODE_SZ + nlen].to_vec();
            Ok(if ch.node_type() == NodeType::DENT {
                Node::Dent(node, name)
            } else {
                Node::Xent(node, name)
            })
        }
        NodeType::TRUN => {
            need(UBIFS_TRUN_NODE_SZ)?;
            Ok(Node::Trun(pod_read_unaligned(&buf[..UBIFS_TRUN_NODE_SZ])))
        }
        NodeType::SB => {
            need(UBIFS_SB_PARSE_SZ)?;
            Ok(Node::Sb(pod_read_unaligned(&buf[..UBIFS_SB_PARSE_SZ])))
        }
        NodeType::MST => {
            need(UBIFS_MST_NODE_SZ)?;
            Ok(Node::Mst(pod_read_unaligned(&buf[..UBIFS_MST_NODE_SZ])))
        }
        NodeType::REF => {
            need(UBIFS_REF_NODE_SZ)?;
            Ok(Node::Ref(pod_read_unaligned(&buf[..UBIFS_REF_NODE_SZ])))
        }
        NodeType::CS => {
            need(UBIFS_CS_NODE_SZ)?;
            Ok(Node::Cs(pod_read_unaligned(&buf[..UBIFS_CS_NODE_SZ])))
        }
        NodeType::ORPH => {
            need(UBIFS_ORPH_NODE_SZ)?;
            let cmt_no = u64::from_le_bytes(buf[UBIFS_CH_SZ..UBIFS_CH_SZ + 8].try_into().unwrap());
            let inos = buf[UBIFS_ORPH_NODE_SZ..]
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                .collect();
            Ok(Node::Orph(OrphNode { cmt_no, inos }))
        }
        NodeType::IDX => {
            need(UBIFS_IDX_NODE_SZ)?;
            let child_cnt = u16::from_le_bytes(buf[24..26].try_into().unwrap());
            let level = u16::from_le_bytes(buf[26..28].try_into().unwrap());

            let stride = UBIFS_BRANCH_SZ + UBIFS_SK_LEN;
            let wanted = UBIFS_IDX_NODE_SZ + usize::from(child_cnt) * stride;
            need(wanted)?;

            let branches = buf[UBIFS_IDX_NODE_SZ..wanted]
                .chunks_exact(stride)
                .map(|c| Branch {
                    lnum: u32::from_le_bytes(c[0..4].try_into().unwrap()),
                    offs: u32::from_le_bytes(c[4..8].try_into().unwrap()),
                    len: u32::from_le_bytes(c[8..12].try_into().unwrap()),
                    key: Key::from_bytes(&c[12..]),
                })
                .collect();

            Ok(Node::Idx(IdxNode { child_cnt, level }, branches))
        }
        NodeType::PAD => {
            need(UBIFS_PAD_NODE_SZ)?;
            let pad_len = u32::from_le_bytes(buf[24..28].try_into().unwrap());
            Ok(Node::Pad(PadNode { pad_len }))
        }
        NodeType(other) => Err(UbifsError::UnknownNodeType {
            lnum,
            offs,
            node_type: other,
        }),
    }
}
