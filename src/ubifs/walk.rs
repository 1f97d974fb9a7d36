//! Depth-first traversal of the wandering index into an inode arena.
//!
//! The index is a B+ tree of [`Node::Idx`] nodes whose branches point at
//! further index nodes or at leaves (inode, data, dent, xent, trun). The
//! walk flattens everything reachable from the master's root into a flat
//! `inum -> InodeEntry` map; directory structure is reconstructed later
//! from the dent lists, so no reference cycles ever form.
//!
//! Journal replay semantics are folded in as the leaves arrive: a leaf
//! seen twice (possible after an unclean unmount) is resolved in favour
//! of the greater common-header sequence number, and truncation nodes
//! drop the data blocks they invalidate.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;
use log::{debug, warn};

use crate::err::UbifsError;
use crate::io::LebRead;
use crate::ubifs::nodes::{DataNode, DentNode, InoNode, Node, UBIFS_BLOCK_SIZE};
use crate::ubifs::Ubifs;

/// A directory or xattr entry attached to its parent inode.
#[derive(Clone, Debug)]
pub struct DentEntry {
    pub node: DentNode,
    pub name: Vec<u8>,
}

/// One data extent of a regular file.
#[derive(Clone, Debug)]
pub struct DataEntry {
    pub node: DataNode,
    pub payload: Vec<u8>,
}

/// Everything the index said about one inode number.
#[derive(Clone, Debug, Default)]
pub struct InodeEntry {
    /// The inode node and its inline data; absent for orphans that only
    /// ever appeared as somebody's dent.
    pub ino: Option<(InoNode, Vec<u8>)>,

    /// Directory entries whose *parent* is this inode.
    pub dents: Vec<DentEntry>,

    /// Extended-attribute entries of this inode.
    pub xents: Vec<DentEntry>,

    /// Data extents keyed by block index.
    pub data: BTreeMap<u32, DataEntry>,
}

/// Flat arena of decoded inodes. Inode 1 is the root directory.
pub type InodeMap = HashMap<u64, InodeEntry>;

/// The on-medium format allows far fewer index levels than this; a
/// deeper recursion means the tree references itself.
const MAX_INDEX_DEPTH: usize = 64;

/// Walks the index from `(lnum, offs)` and merges every reachable leaf
/// into `inodes`.
///
/// A branch whose target cannot be read or validated is recorded in
/// `bad_blocks` and skipped; the rest of the tree is still visited.
pub(crate) fn index<L: LebRead>(
    fs: &mut Ubifs<L>,
    lnum: u32,
    offs: u32,
    inodes: &mut InodeMap,
    bad_blocks: &mut BTreeSet<u32>,
) {
    descend(fs, lnum, offs, inodes, bad_blocks, 0);
}

fn descend<L: LebRead>(
    fs: &mut Ubifs<L>,
    lnum: u32,
    offs: u32,
    inodes: &mut InodeMap,
    bad_blocks: &mut BTreeSet<u32>,
    depth: usize,
) {
    if depth > MAX_INDEX_DEPTH {
        warn!("ubifs: index deeper than {MAX_INDEX_DEPTH} levels at ({lnum}:{offs:#x}), cycle assumed");
        bad_blocks.insert(lnum);
        return;
    }

    let node = match fs.read_node(lnum, offs) {
        Ok(node) => node,
        Err(e) => {
            warn!("ubifs: unreadable index branch target: {e}");
            bad_blocks.insert(lnum);
            return;
        }
    };

    match node {
        Node::Idx(_, branches) => {
            for branch in branches {
                descend(fs, branch.lnum, branch.offs, inodes, bad_blocks, depth + 1);
            }
        }
        leaf => insert_leaf(leaf, inodes),
    }
}

/// Folds one leaf into the arena, applying duplicate arbitration.
fn insert_leaf(leaf: Node, inodes: &mut InodeMap) {
    match leaf {
        Node::Ino(node, data) => {
            let entry = inodes.entry(node.inum()).or_default();
            let newer = entry
                .ino
                .as_ref()
                .map_or(true, |(held, _)| held.ch().sqnum() <= node.ch().sqnum());
            if newer {
                entry.ino = Some((node, data));
            }
        }
        Node::Dent(node, name) => {
            let entry = inodes.entry(node.key().inum).or_default();
            merge_dent(&mut entry.dents, DentEntry { node, name });
        }
        Node::Xent(node, name) => {
            let entry = inodes.entry(node.key().inum).or_default();
            merge_dent(&mut entry.xents, DentEntry { node, name });
        }
        Node::Data(node, payload) => {
            let entry = inodes.entry(node.inum()).or_default();
            let block = node.block_index();
            let newer = entry
                .data
                .get(&block)
                .map_or(true, |held| held.node.ch().sqnum() <= node.ch().sqnum());
            if newer {
                entry.data.insert(block, DataEntry { node, payload });
            }
        }
        Node::Trun(node) => {
            if node.new_size() > node.old_size() {
                warn!(
                    "ubifs: {}",
                    UbifsError::TruncationOutOfRange {
                        inum: node.inum(),
                        old_size: node.old_size(),
                        new_size: node.new_size(),
                    }
                );
                return;
            }

            if let Some(entry) = inodes.get_mut(&node.inum()) {
                // Blocks that start at or past the new size are gone; the
                // final size truncation trims the boundary block.
                let new_size = node.new_size();
                entry
                    .data
                    .retain(|&block, _| u64::from(block) * u64::from(UBIFS_BLOCK_SIZE) < new_size);
            }
        }
        other => {
            debug!(
                "ubifs: ignoring {:?} node reached through the index",
                other.node_type()
            );
        }
    }
}

/// Replaces a same-named entry if the newcomer is newer, appends it
/// otherwise.
fn merge_dent(list: &mut Vec<DentEntry>, entry: DentEntry) {
    match list.iter_mut().find(|held| held.name == entry.name) {
        Some(held) if held.node.ch().sqnum() <= entry.node.ch().sqnum() => *held = entry,
        Some(_) => {}
        None => list.push(entry),
    }
}
