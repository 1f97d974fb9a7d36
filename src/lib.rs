//! Read-only decoder for raw UBI flash images and the UBIFS filesystems they
//! carry.
//!
//! The crate is split in two layers, mirroring the on-flash stacking:
//!
//! - [`ubi`] parses physical erase blocks (PEBs) out of a flash dump, groups
//!   them into images and volumes, and arbitrates duplicate logical erase
//!   blocks (LEBs) by sequence number.
//! - [`ubifs`] walks the node-based UBIFS structures of a single volume: the
//!   wandering B+ index rooted in the master node, the inode / directory-entry
//!   / data leaves, file reassembly (including decompression) and fscrypt v1
//!   name and content decryption.
//!
//! Decoded entities are handed to an [`ubifs::emit::Emitter`], so the library
//! never touches the host filesystem itself. [`decode_image`] drives a whole
//! pass over either container kind; the `ubiread` binary is a thin driver
//! around it.
//!
//! Both layers read their input through [`io::UbiFile`], a sliced
//! random-access view over any `Read + Seek` source, so whole decodes can run
//! against an in-memory buffer as easily as against a dump file.

pub mod decode;
pub mod err;
pub mod io;
pub mod options;
pub mod scan;
pub mod ubi;
pub mod ubifs;

pub use decode::decode_image;
pub use err::Error;
pub use options::DecodeOptions;
