//! Error types for the UBI and UBIFS decoding layers.
//!
//! Each layer defines its own enum, in dependency order: block-level I/O,
//! then UBI header and volume handling, then UBIFS node and tree handling,
//! then fscrypt. [`Error`] aggregates them for callers that drive a whole
//! decode and do not care which layer failed.
//!
//! Errors inside an independent unit (one PEB, one node, one inode subtree)
//! are downgraded to warnings by the decoding loops when a tolerant mode is
//! configured; errors in structural prerequisites (master node, index root)
//! are always surfaced through these types.

use thiserror::Error;

/// Result alias for block-granular I/O.
pub type IoResult<T> = Result<T, BlockIoError>;

/// Failures raised by the block I/O layer ([`crate::io::UbiFile`]).
#[derive(Debug, Error)]
pub enum BlockIoError {
    /// A read was requested past the end of the configured data region.
    #[error("read beyond data region end (offset {offset:#x}, len {len})")]
    OutOfRange { offset: u64, len: usize },

    /// The underlying source failed while reading a PEB.
    #[error("read error on peb {peb}")]
    BlockRead {
        peb: u32,
        #[source]
        source: std::io::Error,
    },

    /// The underlying source failed outside of any specific PEB.
    #[error("read error at offset {offset:#x}")]
    Read {
        offset: u64,
        #[source]
        source: std::io::Error,
    },
}

/// Failures raised while decoding the UBI layer.
#[derive(Debug, Error)]
pub enum UbiError {
    #[error("bad magic in peb {peb}: expected {expected:#010x}, found {found:#010x}")]
    MagicMismatch { peb: u32, expected: u32, found: u32 },

    #[error("unsupported UBI version {version} in peb {peb}")]
    UnsupportedVersion { peb: u32, version: u8 },

    #[error("header crc mismatch in peb {peb}: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { peb: u32, stored: u32, computed: u32 },

    #[error("peb {peb} truncated")]
    Truncated { peb: u32 },

    /// The scan found no PEB with a valid EC header.
    #[error("no UBI images found")]
    NoImages,

    #[error("image {image_seq:#x} holds no volumes")]
    NoVolumes { image_seq: u32 },

    /// Two PEBs claim the same LEB with the same sequence number. Resolved
    /// in favour of the later PEB, reported when strict decoding is on.
    #[error("pebs {first_peb} and {second_peb} both claim leb {lnum} of volume {vol_id} at sqnum {sqnum}")]
    DuplicateLeb {
        vol_id: u32,
        lnum: u32,
        sqnum: u64,
        first_peb: u32,
        second_peb: u32,
    },

    /// A LEB number inside a volume's range has no backing PEB.
    #[error("volume {vol_id} has no peb for leb {lnum}")]
    MissingLeb { vol_id: u32, lnum: u32 },

    #[error(transparent)]
    Io(#[from] BlockIoError),
}

/// Failures raised while decoding UBIFS structures.
#[derive(Debug, Error)]
pub enum UbifsError {
    #[error("bad node magic at ({lnum}:{offs:#x}): found {found:#010x}")]
    MagicMismatch { lnum: u32, offs: u32, found: u32 },

    #[error("node crc mismatch at ({lnum}:{offs:#x}): stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        lnum: u32,
        offs: u32,
        stored: u32,
        computed: u32,
    },

    #[error("unknown node type {node_type} at ({lnum}:{offs:#x})")]
    UnknownNodeType { lnum: u32, offs: u32, node_type: u8 },

    #[error("truncated node at ({lnum}:{offs:#x}): {len} bytes claimed, {available} available")]
    Truncated {
        lnum: u32,
        offs: u32,
        len: u32,
        available: u32,
    },

    /// Neither master LEB holds a CRC-valid master node.
    #[error("no valid master node in lebs 1 and 2")]
    NoMaster,

    /// The superblock node is missing or does not describe a readable medium.
    #[error("bad superblock node: {reason}")]
    BadSuperblock { reason: &'static str },

    /// An index branch points at something that is not a well-formed node.
    #[error("bad index branch at ({lnum}:{offs:#x}): {reason}")]
    BadIndex {
        lnum: u32,
        offs: u32,
        reason: &'static str,
    },

    /// A directory entry references an inode the index never produced.
    #[error("dent references unknown inode {inum}")]
    OrphanInode { inum: u64 },

    /// A truncation node shrinks an inode to a size beyond its old size.
    #[error("truncation of inode {inum} out of range: old {old_size}, new {new_size}")]
    TruncationOutOfRange {
        inum: u64,
        old_size: u64,
        new_size: u64,
    },

    /// A data node payload could not be decompressed, or inflated to a
    /// length other than the one the inode admits.
    #[error("decompression failed for inode {inum} block {block}: {reason}")]
    Decompress {
        inum: u64,
        block: u32,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] BlockIoError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Failures raised by the fscrypt v1 machinery.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The provided master key does not match the descriptor stored in the
    /// encryption context.
    #[error("master key descriptor mismatch: context wants {expected}, key is {actual}")]
    KeyMismatch { expected: String, actual: String },

    #[error("decryption failed: {reason}")]
    DecryptError { reason: &'static str },

    #[error("unsupported fscrypt context version {0}, only v1 is handled")]
    UnsupportedFscryptVersion(u8),

    #[error("malformed encryption context ({len} bytes)")]
    BadContext { len: usize },
}

/// Aggregate error for whole-image decoding drivers
/// ([`crate::decode_image`]).
#[derive(Debug, Error)]
pub enum Error {
    /// The input could not be identified as UBI or bare UBIFS, or its
    /// erase-block geometry could not be determined.
    #[error("cannot decode input: {reason}")]
    Unrecognized { reason: &'static str },

    #[error(transparent)]
    Io(#[from] BlockIoError),

    #[error(transparent)]
    Ubi(#[from] UbiError),

    #[error(transparent)]
    Ubifs(#[from] UbifsError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
