//! The UBIFS layer: node reading, master selection, index walking and
//! emission, over any [`LebRead`] medium.
//!
//! Construction validates the structural prerequisites: the superblock
//! node (LEB 0) when present, and a winning master node from the two
//! master LEBs. Everything else is reached from the master's index root
//! on demand. [`Ubifs::decode`] drives a whole pass: walk the index into
//! an inode arena, then replay the tree onto an
//! [`Emitter`](emit::Emitter).

use log::{debug, info, warn};

use crate::err::UbifsError;
use crate::io::LebRead;
use crate::options::DecodeOptions;

pub mod compress;
pub mod crypt;
pub mod emit;
pub mod file;
pub mod key;
pub mod lzo;
pub mod nodes;
pub mod walk;

use std::collections::BTreeSet;

use emit::{Emitter, Warning, WarningKind};
use nodes::{
    parse_common_header, parse_node, MstNode, Node, SbNode, UBIFS_CH_SZ, UBIFS_MST_LNUM,
    UBIFS_NODE_MAGIC,
};
use walk::InodeMap;

/// A mounted-for-reading UBIFS filesystem.
pub struct Ubifs<L> {
    leb: L,
    options: DecodeOptions,
    sb: Option<SbNode>,
    mst: MstNode,
}

impl<L: LebRead> Ubifs<L> {
    /// Reads the structural prerequisites and prepares for decoding.
    ///
    /// # Errors
    ///
    /// Fails with [`UbifsError::NoMaster`] when neither master LEB holds
    /// a CRC-valid master node; a missing superblock node only costs the
    /// metadata (the LEB geometry is already fixed by `leb`).
    pub fn new(mut leb: L, options: DecodeOptions) -> Result<Self, UbifsError> {
        let sb = match read_node_at(&mut leb, nodes::UBIFS_SB_LNUM, 0) {
            Ok(Node::Sb(sb)) => {
                if sb.leb_size() != leb.leb_size() {
                    warn!(
                        "ubifs: superblock says {} byte lebs, medium provides {}",
                        sb.leb_size(),
                        leb.leb_size()
                    );
                }
                Some(sb)
            }
            Ok(other) => {
                warn!(
                    "ubifs: leb 0 starts with a {:?} node instead of the superblock",
                    other.node_type()
                );
                None
            }
            Err(e) => {
                warn!("ubifs: no readable superblock node: {e}");
                None
            }
        };

        let mst = select_master(&mut leb)?;

        info!(
            "ubifs: master at cmt_no {} root ({}:{:#x}) highest inum {}",
            mst.cmt_no(),
            mst.root_lnum(),
            mst.root_offs(),
            mst.highest_inum()
        );

        Ok(Self {
            leb,
            options,
            sb,
            mst,
        })
    }

    /// The superblock node, when LEB 0 held one.
    pub fn superblock(&self) -> Option<&SbNode> {
        self.sb.as_ref()
    }

    /// The winning master node.
    pub fn master(&self) -> &MstNode {
        &self.mst
    }

    /// Reads and validates the node at `(lnum, offs)`.
    pub fn read_node(&mut self, lnum: u32, offs: u32) -> Result<Node, UbifsError> {
        read_node_at(&mut self.leb, lnum, offs)
    }

    /// Scans one whole LEB for consecutive nodes. Invalid nodes are
    /// skipped, the erased tail ends the scan.
    pub fn scan_leb(&mut self, lnum: u32) -> Vec<(u32, Node)> {
        scan_leb(&mut self.leb, lnum)
    }

    /// Walks the index from the master's root into an inode arena.
    ///
    /// Unreadable branches are collected in the returned set and the
    /// walk continues around them; only an unreadable root is fatal.
    pub fn walk(&mut self) -> Result<(InodeMap, BTreeSet<u32>), UbifsError> {
        let (root_lnum, root_offs) = (self.mst.root_lnum(), self.mst.root_offs());

        // The index root is a structural prerequisite: probe it before
        // delegating to the fault-tolerant walk.
        self.read_node(root_lnum, root_offs)
            .map_err(|_| UbifsError::BadIndex {
                lnum: root_lnum,
                offs: root_offs,
                reason: "index root is unreadable",
            })?;

        let mut inodes = InodeMap::new();
        let mut bad_blocks = BTreeSet::new();
        walk::index(self, root_lnum, root_offs, &mut inodes, &mut bad_blocks);

        debug!(
            "ubifs: walk found {} inodes, {} bad lebs",
            inodes.len(),
            bad_blocks.len()
        );

        Ok((inodes, bad_blocks))
    }

    /// Runs one full decode pass: walk, then replay onto `emitter`.
    ///
    /// Non-fatal problems (bad branches, orphans, undecryptable content)
    /// arrive as [`Warning`](emit::Warning) events; structural failures
    /// abort with an error.
    pub fn decode(&mut self, emitter: &mut dyn Emitter) -> Result<(), UbifsError> {
        let (inodes, bad_blocks) = self.walk()?;

        for lnum in &bad_blocks {
            emitter.on_warning(&Warning::new(
                WarningKind::BlockReadError,
                format!("leb {lnum}: index branch unreadable, data may be missing"),
            ));
        }

        emit::emit_tree(&inodes, &self.options, emitter)
    }
}

/// Rounds `offs` up to the 8-byte node alignment.
fn align8(offs: u32) -> u32 {
    offs.saturating_add(7) & !7
}

/// Reads the node at `(lnum, offs)`: common header first, then the
/// claimed length, validating as it goes.
fn read_node_at<L: LebRead>(leb: &mut L, lnum: u32, offs: u32) -> Result<Node, UbifsError> {
    let leb_size = leb.leb_size();
    let base = u64::from(lnum) * u64::from(leb_size);

    let head = leb.read(base + u64::from(offs), UBIFS_CH_SZ)?;
    let ch = parse_common_header(lnum, offs, &head)?;

    // Nodes never span LEBs.
    if u64::from(offs) + u64::from(ch.len()) > u64::from(leb_size) {
        return Err(UbifsError::Truncated {
            lnum,
            offs,
            len: ch.len(),
            available: leb_size.saturating_sub(offs),
        });
    }

    let buf = leb.read(base + u64::from(offs), ch.len() as usize)?;
    parse_node(lnum, offs, &buf)
}

/// Scans one whole LEB for consecutive nodes, stopping at the first
/// byte run that is not node-shaped (the erased tail).
///
/// CRC-invalid nodes are skipped by their claimed length so later nodes
/// are still found; this is what master-node recovery relies on.
fn scan_leb<L: LebRead>(leb: &mut L, lnum: u32) -> Vec<(u32, Node)> {
    let leb_size = leb.leb_size();
    let raw = match leb.read_leb(lnum) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("ubifs: leb {lnum} unreadable while scanning: {e}");
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    let mut offs = 0u32;

    while (offs as usize) + UBIFS_CH_SZ <= raw.len() {
        let at = offs as usize;
        let magic = u32::from_le_bytes(raw[at..at + 4].try_into().unwrap());
        if magic != UBIFS_NODE_MAGIC {
            break;
        }

        let ch = match parse_common_header(lnum, offs, &raw[at..]) {
            Ok(ch) => ch,
            Err(_) => break,
        };
        let len = ch.len();
        if at + len as usize > raw.len() {
            break;
        }

        match parse_node(lnum, offs, &raw[at..at + len as usize]) {
            Ok(Node::Pad(pad)) => {
                offs = align8(offs.saturating_add(len).saturating_add(pad.pad_len));
                continue;
            }
            Ok(node) => found.push((offs, node)),
            Err(e) => debug!("ubifs: scan skipping node at ({lnum}:{offs:#x}): {e}"),
        }

        offs = align8(offs.saturating_add(len));
    }

    found
}

/// Picks the winning master node from the two master LEBs.
///
/// Commits append master copies within LEBs 1 and 2, so both are
/// scanned in full. The winner has the greatest common-header sequence
/// number; ties fall back to the higher `highest_inum`, then `cmt_no`,
/// then the later LEB.
fn select_master<L: LebRead>(leb: &mut L) -> Result<MstNode, UbifsError> {
    let mut best: Option<MstNode> = None;

    for lnum in [UBIFS_MST_LNUM, UBIFS_MST_LNUM + 1] {
        for (offs, node) in scan_leb(leb, lnum) {
            let Node::Mst(mst) = node else {
                debug!(
                    "ubifs: leb {lnum} holds a stray {:?} node at {offs:#x}",
                    node.node_type()
                );
                continue;
            };

            let wins = best.as_ref().map_or(true, |held| {
                let lhs = (mst.ch().sqnum(), mst.highest_inum(), mst.cmt_no());
                let rhs = (held.ch().sqnum(), held.highest_inum(), held.cmt_no());
                lhs >= rhs
            });
            if wins {
                best = Some(mst);
            }
        }
    }

    best.ok_or(UbifsError::NoMaster)
}
