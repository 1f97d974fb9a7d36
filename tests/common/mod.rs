//! In-memory image builders shared by the integration tests.
//!
//! `UbifsBuilder` assembles a node-exact UBIFS medium: superblock in LEB
//! 0, master copies in LEBs 1 and 2, leaves from LEB 4 on, and a
//! single- or two-level index behind them. The result is either a bare
//! UBIFS byte image or a list of LEBs for `wrap_ubi_image` to dress in
//! EC/VID headers.

#![allow(dead_code)]

use std::collections::BTreeMap;

pub const TEST_LEB_SIZE: u32 = 32768;
pub const TEST_DATA_OFFSET: u32 = 128;
pub const TEST_VID_OFFSET: u32 = 64;
pub const TEST_PEB_SIZE: u32 = TEST_LEB_SIZE + TEST_DATA_OFFSET;

pub const UBIFS_MAGIC: u32 = 0x0610_1831;

const FIRST_LEAF_LNUM: u32 = 4;

fn ubifs_crc(buf: &[u8]) -> u32 {
    !crc32fast::hash(buf)
}

fn ubi_crc(buf: &[u8]) -> u32 {
    !crc32fast::hash(buf)
}

/// 16 bytes of key space: inum, then `(type << 29) | hash`.
pub fn key_bytes(inum: u32, ktype: u8, hash: u32) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&inum.to_le_bytes());
    key[4..8].copy_from_slice(&((u32::from(ktype) << 29) | hash).to_le_bytes());
    key
}

pub struct UbifsBuilder {
    pub leb_size: u32,
    lebs: BTreeMap<u32, Vec<u8>>,
    next_sqnum: u64,
    leaf_lnum: u32,
    leaves: Vec<(u32, u32, u32, [u8; 8])>,
    pub two_level_index: bool,
}

impl UbifsBuilder {
    pub fn new() -> Self {
        Self {
            leb_size: TEST_LEB_SIZE,
            lebs: BTreeMap::new(),
            next_sqnum: 1,
            leaf_lnum: FIRST_LEAF_LNUM,
            leaves: Vec::new(),
            two_level_index: false,
        }
    }

    fn wrap_node(&mut self, node_type: u8, body: &[u8]) -> Vec<u8> {
        let len = 24 + body.len();
        let mut buf = vec![0u8; 24];
        buf[0..4].copy_from_slice(&UBIFS_MAGIC.to_le_bytes());
        buf[8..16].copy_from_slice(&self.next_sqnum.to_le_bytes());
        buf[16..20].copy_from_slice(&(len as u32).to_le_bytes());
        buf[20] = node_type;
        buf.extend_from_slice(body);

        let crc = ubifs_crc(&buf[8..]);
        buf[4..8].copy_from_slice(&crc.to_le_bytes());

        self.next_sqnum += 1;
        buf
    }

    /// Appends a node to `lnum`, 8-aligned, and returns `(offs, len)`.
    fn place(&mut self, lnum: u32, node: Vec<u8>) -> (u32, u32) {
        let leb = self.lebs.entry(lnum).or_default();
        while leb.len() % 8 != 0 {
            leb.push(0);
        }
        let offs = leb.len() as u32;
        assert!(
            offs as usize + node.len() <= self.leb_size as usize,
            "test leb {lnum} overflow"
        );
        let len = node.len() as u32;
        leb.extend_from_slice(&node);
        (offs, len)
    }

    /// Appends a leaf to the spill area and registers it for the index.
    fn place_leaf(&mut self, node_type: u8, body: &[u8], key: [u8; 16]) {
        let node = self.wrap_node(node_type, body);
        let used = self.lebs.get(&self.leaf_lnum).map_or(0, Vec::len);
        if used + node.len() + 8 > self.leb_size as usize {
            self.leaf_lnum += 1;
        }
        let lnum = self.leaf_lnum;
        let (offs, len) = self.place(lnum, node);
        self.leaves
            .push((lnum, offs, len, key[..8].try_into().unwrap()));
    }

    pub fn add_ino(
        &mut self,
        inum: u32,
        mode: u32,
        size: u64,
        nlink: u32,
        flags: u32,
        compr_type: u16,
        data: &[u8],
    ) {
        let key = key_bytes(inum, 0, 0);
        let mut body = vec![0u8; 136];
        body[..16].copy_from_slice(&key);
        body[24..32].copy_from_slice(&size.to_le_bytes());
        body[32..40].copy_from_slice(&1_700_000_000u64.to_le_bytes()); // atime
        body[40..48].copy_from_slice(&1_700_000_000u64.to_le_bytes()); // ctime
        body[48..56].copy_from_slice(&1_700_000_000u64.to_le_bytes()); // mtime
        body[68..72].copy_from_slice(&nlink.to_le_bytes());
        body[72..76].copy_from_slice(&1000u32.to_le_bytes()); // uid
        body[76..80].copy_from_slice(&1000u32.to_le_bytes()); // gid
        body[80..84].copy_from_slice(&mode.to_le_bytes());
        body[84..88].copy_from_slice(&flags.to_le_bytes());
        body[88..92].copy_from_slice(&(data.len() as u32).to_le_bytes());
        body[108..110].copy_from_slice(&compr_type.to_le_bytes());
        body.extend_from_slice(data);

        self.place_leaf(0, &body, key);
    }

    pub fn add_dent(&mut self, parent: u32, hash: u32, name: &[u8], child: u64, dtype: u8) {
        self.add_dent_like(2, parent, hash, name, child, dtype);
    }

    pub fn add_xent(&mut self, host: u32, hash: u32, name: &[u8], value_inum: u64) {
        self.add_dent_like(3, host, hash, name, value_inum, 0);
    }

    fn add_dent_like(
        &mut self,
        node_type: u8,
        parent: u32,
        hash: u32,
        name: &[u8],
        child: u64,
        dtype: u8,
    ) {
        let key = key_bytes(parent, node_type, hash);
        let mut body = vec![0u8; 32];
        body[..16].copy_from_slice(&key);
        body[16..24].copy_from_slice(&child.to_le_bytes());
        body[25] = dtype;
        body[26..28].copy_from_slice(&(name.len() as u16).to_le_bytes());
        body.extend_from_slice(name);

        self.place_leaf(node_type, &body, key);
    }

    pub fn add_data(
        &mut self,
        inum: u32,
        block: u32,
        compr_type: u16,
        size: u32,
        compr_size: u16,
        payload: &[u8],
    ) {
        let key = key_bytes(inum, 1, block);
        let mut body = vec![0u8; 24];
        body[..16].copy_from_slice(&key);
        body[16..20].copy_from_slice(&size.to_le_bytes());
        body[20..22].copy_from_slice(&compr_type.to_le_bytes());
        body[22..24].copy_from_slice(&compr_size.to_le_bytes());
        body.extend_from_slice(payload);

        self.place_leaf(1, &body, key);
    }

    pub fn add_trun(&mut self, inum: u32, old_size: u64, new_size: u64) {
        let key = key_bytes(inum, 0, 0);
        let mut body = vec![0u8; 32];
        body[..4].copy_from_slice(&inum.to_le_bytes());
        body[16..24].copy_from_slice(&old_size.to_le_bytes());
        body[24..32].copy_from_slice(&new_size.to_le_bytes());

        self.place_leaf(4, &body, key);
    }

    fn idx_node_body(level: u16, branches: &[(u32, u32, u32, [u8; 8])]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(branches.len() as u16).to_le_bytes());
        body.extend_from_slice(&level.to_le_bytes());
        for (lnum, offs, len, key) in branches {
            body.extend_from_slice(&lnum.to_le_bytes());
            body.extend_from_slice(&offs.to_le_bytes());
            body.extend_from_slice(&len.to_le_bytes());
            body.extend_from_slice(key);
        }
        body
    }

    /// Builds index, master copies and superblock, and returns the LEB
    /// map (missing numbers are holes).
    pub fn finish(mut self) -> BTreeMap<u32, Vec<u8>> {
        let idx_lnum = self.leaf_lnum + 1;

        let leaves = self.leaves.clone();
        let (root_offs, root_len, root_lnum) = if self.two_level_index && leaves.len() >= 2 {
            let (lo, hi) = leaves.split_at(leaves.len() / 2);
            let mut subs = Vec::new();
            for half in [lo, hi] {
                let body = Self::idx_node_body(0, half);
                let node = self.wrap_node(9, &body);
                let key = half[0].3;
                let (offs, len) = self.place(idx_lnum, node);
                subs.push((idx_lnum, offs, len, key));
            }
            let body = Self::idx_node_body(1, &subs);
            let node = self.wrap_node(9, &body);
            let (offs, len) = self.place(idx_lnum, node);
            (offs, len, idx_lnum)
        } else {
            let body = Self::idx_node_body(0, &leaves);
            let node = self.wrap_node(9, &body);
            let (offs, len) = self.place(idx_lnum, node);
            (offs, len, idx_lnum)
        };

        let leb_cnt = idx_lnum + 1;
        let highest_inum: u64 = 256;

        let mut mst_body = vec![0u8; 488];
        mst_body[0..8].copy_from_slice(&u64::from(highest_inum).to_le_bytes());
        mst_body[8..16].copy_from_slice(&1u64.to_le_bytes()); // cmt_no
        mst_body[20..24].copy_from_slice(&3u32.to_le_bytes()); // log_lnum
        mst_body[24..28].copy_from_slice(&root_lnum.to_le_bytes());
        mst_body[28..32].copy_from_slice(&root_offs.to_le_bytes());
        mst_body[32..36].copy_from_slice(&root_len.to_le_bytes());
        mst_body[48..56].copy_from_slice(&u64::from(root_len).to_le_bytes()); // index_size

        for mst_lnum in [1u32, 2] {
            let node = self.wrap_node(7, &mst_body.clone());
            self.place(mst_lnum, node);
        }

        let mut sb_body = vec![0u8; 4072];
        sb_body[2] = 0; // key_hash r5
        sb_body[8..12].copy_from_slice(&8u32.to_le_bytes()); // min_io_size
        sb_body[12..16].copy_from_slice(&self.leb_size.to_le_bytes());
        sb_body[16..20].copy_from_slice(&leb_cnt.to_le_bytes());
        sb_body[20..24].copy_from_slice(&(leb_cnt + 32).to_le_bytes()); // max_leb_cnt
        sb_body[32..36].copy_from_slice(&1u32.to_le_bytes()); // log_lebs
        sb_body[48..52].copy_from_slice(&8u32.to_le_bytes()); // fanout
        sb_body[56..60].copy_from_slice(&5u32.to_le_bytes()); // fmt_version
        sb_body[60..62].copy_from_slice(&1u16.to_le_bytes()); // default_compr: lzo
        sb_body[80..84].copy_from_slice(&1_000_000_000u32.to_le_bytes()); // time_gran
        sb_body[84..100].copy_from_slice(b"ubiread-test-fs!");
        let node = self.wrap_node(6, &sb_body);

        // The superblock must be the first node of LEB 0.
        assert!(self.lebs.get(&0).is_none());
        self.place(0, node);

        self.lebs
    }

    /// Finishes and concatenates into a bare UBIFS image.
    pub fn finish_bare(self) -> Vec<u8> {
        let leb_size = self.leb_size as usize;
        let lebs = self.finish();
        let count = lebs.keys().next_back().map_or(0, |&l| l + 1);

        let mut image = Vec::with_capacity(count as usize * leb_size);
        for lnum in 0..count {
            let mut content = lebs.get(&lnum).cloned().unwrap_or_default();
            content.resize(leb_size, 0xFF);
            image.extend_from_slice(&content);
        }
        image
    }
}

/// Big-endian EC header with a valid CRC.
pub fn ec_header_bytes(vid_hdr_offset: u32, data_offset: u32, image_seq: u32) -> [u8; 64] {
    let mut raw = [0u8; 64];
    raw[..4].copy_from_slice(b"UBI#");
    raw[4] = 1; // version
    raw[8..16].copy_from_slice(&1u64.to_be_bytes()); // erase count
    raw[16..20].copy_from_slice(&vid_hdr_offset.to_be_bytes());
    raw[20..24].copy_from_slice(&data_offset.to_be_bytes());
    raw[24..28].copy_from_slice(&image_seq.to_be_bytes());
    let crc = ubi_crc(&raw[..60]);
    raw[60..].copy_from_slice(&crc.to_be_bytes());
    raw
}

/// Big-endian VID header with a valid CRC.
pub fn vid_header_bytes(
    vol_id: u32,
    lnum: u32,
    sqnum: u64,
    vol_type: u8,
    data_size: u32,
    used_ebs: u32,
) -> [u8; 64] {
    let mut raw = [0u8; 64];
    raw[..4].copy_from_slice(b"UBI!");
    raw[4] = 1; // version
    raw[5] = vol_type;
    raw[8..12].copy_from_slice(&vol_id.to_be_bytes());
    raw[12..16].copy_from_slice(&lnum.to_be_bytes());
    raw[20..24].copy_from_slice(&data_size.to_be_bytes());
    raw[24..28].copy_from_slice(&used_ebs.to_be_bytes());
    raw[40..48].copy_from_slice(&sqnum.to_be_bytes());
    let crc = ubi_crc(&raw[..60]);
    raw[60..].copy_from_slice(&crc.to_be_bytes());
    raw
}

/// One PEB: EC header, VID header, data area, erase-fill tail.
pub fn wrap_peb(ec: &[u8; 64], vid: &[u8; 64], data: &[u8]) -> Vec<u8> {
    let mut peb = vec![0xFFu8; TEST_PEB_SIZE as usize];
    peb[..64].copy_from_slice(ec);
    peb[TEST_VID_OFFSET as usize..TEST_VID_OFFSET as usize + 64].copy_from_slice(vid);
    peb[TEST_DATA_OFFSET as usize..TEST_DATA_OFFSET as usize + data.len()].copy_from_slice(data);
    peb
}

/// Wraps a finished LEB map into a single-volume UBI image.
pub fn wrap_ubi_image(lebs: &BTreeMap<u32, Vec<u8>>, vol_id: u32, image_seq: u32) -> Vec<u8> {
    let mut image = Vec::new();
    let mut sqnum = 100;

    for (&lnum, content) in lebs {
        let ec = ec_header_bytes(TEST_VID_OFFSET, TEST_DATA_OFFSET, image_seq);
        let vid = vid_header_bytes(vol_id, lnum, sqnum, 1, 0, 0);
        image.extend_from_slice(&wrap_peb(&ec, &vid, content));
        sqnum += 1;
    }

    image
}

/// A volume-table record naming one volume slot.
pub fn vtbl_record_bytes(name: &str) -> [u8; 172] {
    let mut raw = [0u8; 172];
    raw[0..4].copy_from_slice(&1u32.to_be_bytes()); // reserved_pebs
    raw[4..8].copy_from_slice(&1u32.to_be_bytes()); // alignment
    raw[12] = 1; // dynamic
    raw[14..16].copy_from_slice(&(name.len() as u16).to_be_bytes());
    raw[16..16 + name.len()].copy_from_slice(name.as_bytes());
    let crc = ubi_crc(&raw[..168]);
    raw[168..].copy_from_slice(&crc.to_be_bytes());
    raw
}
