//! Grouping of parsed blocks into images and volumes, and arbitration of
//! duplicate LEB claims.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::err::UbiError;
use crate::io::leb::LebSlot;
use crate::ubi::block::Block;
use crate::ubi::headers::{VolumeType, UBI_INTERNAL_VOL_START};
use crate::ubi::{Sqnum, VolumeId};

/// All PEBs of one volume, reduced to one winning block per LEB.
#[derive(Debug)]
pub struct Volume {
    pub vol_id: VolumeId,
    pub vol_type: VolumeType,

    /// Name from the volume table, when the layout volume was readable.
    pub name: Option<String>,

    /// Usable bytes per LEB: PEB size minus the data offset and the
    /// alignment padding recorded in the VID headers.
    pub leb_size: u32,

    /// For static volumes, the total LEB count recorded in every header.
    pub used_ebs: Option<u32>,

    lebs: BTreeMap<u32, Block>,
}

impl Volume {
    /// Reduces `blocks` (all claiming `vol_id`) to winners by LEB number.
    ///
    /// The winner of a contested LEB is the block with the greater VID
    /// sequence number. Equal sequence numbers cannot occur on a
    /// well-formed image; when they do, the later PEB wins and the clash
    /// is reported through `warnings`.
    pub(crate) fn from_blocks(
        vol_id: VolumeId,
        peb_size: u32,
        blocks: Vec<Block>,
        warnings: &mut Vec<UbiError>,
    ) -> Self {
        let mut lebs: BTreeMap<u32, Block> = BTreeMap::new();
        let mut vol_type = VolumeType::DYNAMIC;
        let mut used_ebs = None;
        let mut leb_size = 0;

        for block in blocks {
            vol_type = block.vid.vol_type();
            if vol_type.is_static() {
                used_ebs = Some(block.vid.used_ebs());
            }
            // Saturating: blocks forced in despite header errors can
            // carry all-ones padding fields.
            leb_size = peb_size
                .saturating_sub(block.data_offset())
                .saturating_sub(block.vid.data_pad());

            let lnum = block.vid.lnum();
            match lebs.get(&lnum) {
                Some(held) if held.vid.sqnum() > block.vid.sqnum() => {}
                Some(held) => {
                    if held.vid.sqnum() == block.vid.sqnum() {
                        warnings.push(UbiError::DuplicateLeb {
                            vol_id: vol_id.0,
                            lnum,
                            sqnum: block.vid.sqnum().0,
                            first_peb: held.peb.0,
                            second_peb: block.peb.0,
                        });
                    }
                    lebs.insert(lnum, block);
                }
                None => {
                    lebs.insert(lnum, block);
                }
            }
        }

        Self {
            vol_id,
            vol_type,
            name: None,
            leb_size,
            used_ebs,
            lebs,
        }
    }

    /// `true` for UBI-internal volumes such as the layout volume.
    pub fn is_internal(&self) -> bool {
        self.vol_id.0 >= UBI_INTERNAL_VOL_START
    }

    /// One past the highest claimed LEB number.
    pub fn leb_count(&self) -> u32 {
        self.lebs.keys().next_back().map_or(0, |&last| last + 1)
    }

    /// `true` if no PEB claims any LEB of this volume.
    pub fn is_empty(&self) -> bool {
        self.lebs.is_empty()
    }

    /// The winning block for `lnum`, if any PEB claims it.
    pub fn leb(&self, lnum: u32) -> Option<&Block> {
        self.lebs.get(&lnum)
    }

    /// LEB numbers inside the claimed range with no backing PEB. These
    /// read as zeroes; a well-formed dynamic volume may legitimately
    /// have them, so they are reported, not fatal.
    pub fn missing_lebs(&self) -> Vec<u32> {
        (0..self.leb_count())
            .filter(|lnum| !self.lebs.contains_key(lnum))
            .collect()
    }

    /// Winning blocks in LEB order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.lebs.values()
    }

    /// Highest VID sequence number across the volume's winners.
    pub fn highest_sqnum(&self) -> Sqnum {
        self.lebs
            .values()
            .map(|b| b.vid.sqnum())
            .max()
            .unwrap_or_default()
    }

    /// Per-LEB placement for a [`crate::io::VolumeLebFile`].
    pub fn slots(&self) -> BTreeMap<u32, LebSlot> {
        self.lebs
            .iter()
            .map(|(&lnum, block)| {
                (
                    lnum,
                    LebSlot {
                        peb: block.peb,
                        data_offset: block.data_offset(),
                        data_size: self
                            .vol_type
                            .is_static()
                            .then(|| block.vid.data_size()),
                    },
                )
            })
            .collect()
    }
}

/// All volumes sharing one image sequence number.
#[derive(Debug)]
pub struct Image {
    pub image_seq: u32,
    volumes: Vec<Volume>,
}

impl Image {
    /// Buckets `blocks` by volume id. Volumes come out sorted by id;
    /// internal volumes are kept (the layout volume is still needed for
    /// names) but callers normally iterate [`Image::user_volumes`].
    pub(crate) fn from_blocks(
        image_seq: u32,
        peb_size: u32,
        blocks: Vec<Block>,
        warnings: &mut Vec<UbiError>,
    ) -> Self {
        let mut by_vol: HashMap<u32, Vec<Block>> = HashMap::new();
        for block in blocks {
            by_vol.entry(block.vid.vol_id().0).or_default().push(block);
        }

        let mut vol_ids: Vec<u32> = by_vol.keys().copied().collect();
        vol_ids.sort_unstable();

        let volumes = vol_ids
            .into_iter()
            .map(|vol_id| {
                Volume::from_blocks(
                    VolumeId(vol_id),
                    peb_size,
                    by_vol.remove(&vol_id).unwrap_or_default(),
                    warnings,
                )
            })
            .collect();

        Self { image_seq, volumes }
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    pub(crate) fn volumes_mut(&mut self) -> &mut [Volume] {
        &mut self.volumes
    }

    /// Volumes that carry user data, in id order.
    pub fn user_volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.iter().filter(|v| !v.is_internal())
    }

    /// The internal layout volume, if this image has one.
    pub fn layout_volume(&self) -> Option<&Volume> {
        self.volumes
            .iter()
            .find(|v| v.vol_id.0 == super::headers::UBI_LAYOUT_VOLUME_ID)
    }

    pub fn block_count(&self) -> usize {
        self.volumes.iter().map(|v| v.lebs.len()).sum()
    }
}
