//! The UBI layer: scanning PEBs out of a flash dump and regrouping them
//! into images, volumes and ordered LEB streams.
//!
//! Decoding is a single pass: every PEB is read once, its headers parsed
//! and validated, and the surviving blocks bucketed by `image_seq` then
//! `vol_id`. Duplicate LEB claims within a volume are arbitrated by VID
//! sequence number. The result is exposed as [`Image`]s holding
//! [`Volume`]s, and each volume can be opened as a
//! [`VolumeLebFile`](crate::io::VolumeLebFile) for the UBIFS layer.

use std::io::{Read, Seek};

use bytemuck::pod_read_unaligned;
use log::{debug, warn};

use crate::err::{UbiError, BlockIoError};
use crate::io::{PebIndex, UbiFile, VolumeLebFile};
use crate::options::DecodeOptions;

pub mod block;
pub mod headers;
pub mod volume;

pub use block::Block;
pub use volume::{Image, Volume};

use block::PebParse;
use hashbrown::HashMap;
use headers::{VtblRecord, UBI_MAX_VOLUMES, UBI_VTBL_RECORD_SIZE};

/// Derives [`core::fmt::Display`] for tuple structs wrapping one number.
macro_rules! display_as_number {
    ($name: tt) => {
        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_fmt(format_args!("{}", self.0))
            }
        }
    };
}

/// Identifier of a volume within an image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VolumeId(pub u32);

display_as_number!(VolumeId);

/// Global 64-bit sequence number stamped on every written PEB.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Sqnum(pub u64);

display_as_number!(Sqnum);

/// A decoded UBI image file: every readable PEB, grouped and arbitrated.
pub struct Ubi<R> {
    file: UbiFile<R>,
    images: Vec<Image>,
    bad_blocks: Vec<PebIndex>,
    warnings: Vec<UbiError>,
}

impl<R: Read + Seek> Ubi<R> {
    /// Scans every PEB of `file` and builds the image/volume hierarchy.
    ///
    /// # Errors
    ///
    /// Fails with [`UbiError::NoImages`] when no PEB carries a valid EC
    /// header, with the underlying header error when a PEB is malformed
    /// and neither `ignore_block_header_errors` nor
    /// `warn_only_block_read_errors` allow skipping it, and with
    /// [`BlockIoError`] on unrecoverable reads.
    pub fn new(mut file: UbiFile<R>, options: &DecodeOptions) -> Result<Self, UbiError> {
        let mut blocks = Vec::new();
        let mut bad_blocks = Vec::new();
        let mut warnings = Vec::new();

        for peb in 0..file.peb_count() {
            let peb = PebIndex(peb);

            let raw = match file.read_block(peb) {
                Ok(raw) => raw,
                Err(e @ BlockIoError::BlockRead { .. })
                    if options.warn_only_block_read_errors =>
                {
                    warn!("ubi: {e}, substituting zeroes");
                    bad_blocks.push(peb);
                    warnings.push(UbiError::Io(e));
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match block::parse_peb(peb, &raw, options) {
                PebParse::Block(block) => {
                    debug!(
                        "ubi: peb {peb}: vol {} leb {} sqnum {}",
                        block.vid.vol_id(),
                        block.vid.lnum(),
                        block.vid.sqnum()
                    );
                    blocks.push(block);
                }
                PebParse::Empty => debug!("ubi: peb {peb} is erased"),
                PebParse::Bad(e) => {
                    warn!("ubi: skipping peb {peb}: {e}");
                    bad_blocks.push(peb);
                    warnings.push(e);
                }
            }
        }

        if blocks.is_empty() {
            return Err(UbiError::NoImages);
        }

        let images = group_images(blocks, file.peb_size(), options, &mut warnings);

        for image in &images {
            for volume in image.user_volumes() {
                for lnum in volume.missing_lebs() {
                    warnings.push(UbiError::MissingLeb {
                        vol_id: volume.vol_id.0,
                        lnum,
                    });
                }
            }
        }

        let mut ubi = Self {
            file,
            images,
            bad_blocks,
            warnings,
        };
        ubi.name_volumes();

        Ok(ubi)
    }

    /// Decoded images, ordered by image sequence number.
    pub fn images(&self) -> &[Image] {
        &self.images
    }

    /// PEBs that were skipped or zero-substituted.
    pub fn bad_blocks(&self) -> &[PebIndex] {
        &self.bad_blocks
    }

    /// Non-fatal problems encountered during the scan.
    pub fn warnings(&self) -> &[UbiError] {
        &self.warnings
    }

    pub fn peb_size(&self) -> u32 {
        self.file.peb_size()
    }

    /// Opens volume `vol_idx` of image `image_idx` as a LEB stream.
    ///
    /// # Panics
    ///
    /// Panics if either index is out of range; callers iterate the ranges
    /// reported by [`Ubi::images`].
    pub fn volume_leb_file(&mut self, image_idx: usize, vol_idx: usize) -> VolumeLebFile<'_, R> {
        let volume = &self.images[image_idx].volumes()[vol_idx];
        let (leb_size, slots) = (volume.leb_size, volume.slots());

        VolumeLebFile::new(&mut self.file, leb_size, slots)
    }

    /// Attaches volume-table names by parsing each image's layout volume.
    ///
    /// The layout volume holds two copies of the table (LEB 0 and 1);
    /// records are matched to volumes by position. An unreadable table
    /// only costs the names.
    fn name_volumes(&mut self) {
        for image_idx in 0..self.images.len() {
            let Some(layout) = self.images[image_idx].layout_volume() else {
                continue;
            };

            let table_len = UBI_MAX_VOLUMES * UBI_VTBL_RECORD_SIZE;
            let mut raw = None;
            for lnum in [0u32, 1] {
                let Some(b) = layout.leb(lnum) else { continue };
                let offset =
                    u64::from(b.peb.0) * u64::from(self.file.peb_size()) + u64::from(b.data_offset());
                let len = table_len.min((self.file.peb_size() - b.data_offset()) as usize);
                match self.file.read(offset, len) {
                    Ok(bytes) => {
                        raw = Some(bytes);
                        break;
                    }
                    Err(e) => warn!("ubi: layout volume leb {lnum} unreadable: {e}"),
                }
            }
            let Some(raw) = raw else { continue };

            let names: Vec<(u32, String)> = raw
                .chunks_exact(UBI_VTBL_RECORD_SIZE)
                .enumerate()
                .filter_map(|(slot, rec_raw)| {
                    let rec: VtblRecord = pod_read_unaligned(rec_raw);
                    // Unused slots are zeroed (or erased flash); only
                    // plausibly-named records are worth CRC-checking.
                    if rec.name_len() == 0 || rec.name_len() > headers::UBI_VOL_NAME_MAX {
                        return None;
                    }
                    if rec.crc() != VtblRecord::compute_crc(rec_raw) {
                        warn!("ubi: vtbl record {slot} has a bad crc, ignoring");
                        return None;
                    }
                    rec.name().map(|name| (slot as u32, name.to_owned()))
                })
                .collect();

            for volume in self.images[image_idx].volumes_mut() {
                if let Some((_, name)) = names.iter().find(|(slot, _)| *slot == volume.vol_id.0) {
                    volume.name = Some(name.clone());
                }
            }
        }
    }
}

/// Buckets blocks by image sequence, applying the U-Boot fixup if asked.
fn group_images(
    blocks: Vec<Block>,
    peb_size: u32,
    options: &DecodeOptions,
    warnings: &mut Vec<UbiError>,
) -> Vec<Image> {
    let mut by_seq: HashMap<u32, Vec<Block>> = HashMap::new();
    for block in blocks {
        by_seq.entry(block.ec.image_seq()).or_default().push(block);
    }

    // Old U-Boot writers leave image_seq zeroed; fold those PEBs into the
    // image that owns the most blocks.
    if options.uboot_fix && by_seq.len() > 1 {
        if let Some(orphans) = by_seq.remove(&0) {
            let dominant = by_seq
                .iter()
                .max_by_key(|(_, blocks)| blocks.len())
                .map(|(&seq, _)| seq)
                .expect("at least one image remains");
            debug!(
                "ubi: uboot fix: merging {} seq-0 pebs into image {dominant:#x}",
                orphans.len()
            );
            by_seq.entry(dominant).or_default().extend(orphans);
        }
    }

    let mut seqs: Vec<u32> = by_seq.keys().copied().collect();
    seqs.sort_unstable();

    seqs.into_iter()
        .map(|seq| {
            let image = Image::from_blocks(
                seq,
                peb_size,
                by_seq.remove(&seq).unwrap_or_default(),
                warnings,
            );
            if image.user_volumes().next().is_none() {
                let e = UbiError::NoVolumes { image_seq: seq };
                warn!("ubi: {e}");
                warnings.push(e);
            }
            image
        })
        .collect()
}
