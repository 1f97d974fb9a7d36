//! Logical erase block views over a decoded volume or a bare UBIFS dump.
//!
//! UBIFS addresses its medium as a dense array of LEBs. [`LebRead`] is the
//! seam between the two layers: [`VolumeLebFile`] assembles the view from a
//! UBI volume's winning PEBs, [`LinearLebFile`] slices a bare UBIFS image
//! directly. Neither holds a buffer larger than one LEB; missing LEBs read
//! as zeroes.

use crate::err::IoResult;
use crate::io::{PebIndex, UbiFile};

use std::collections::BTreeMap;
use std::io::{Read, Seek};

/// Where a volume LEB lives inside the flash dump.
#[derive(Clone, Copy, Debug)]
pub struct LebSlot {
    /// Winning PEB backing this LEB.
    pub peb: PebIndex,

    /// Offset of the data area inside the PEB (from the EC header).
    pub data_offset: u32,

    /// For static volumes, the number of used bytes in this LEB; reads past
    /// it yield zeroes.
    pub data_size: Option<u32>,
}

/// A contiguous, zero-filled-on-holes view of a volume's logical blocks.
pub trait LebRead {
    /// LEB size in bytes.
    fn leb_size(&self) -> u32;

    /// One past the highest LEB number this view can produce non-zero data
    /// for.
    fn leb_count(&self) -> u32;

    /// Reads `len` bytes at the logical byte `offset`, concatenating across
    /// LEB boundaries. Missing LEBs contribute zeroes.
    fn read(&mut self, offset: u64, len: usize) -> IoResult<Vec<u8>>;

    /// Reads one whole LEB, or zeroes if nothing backs it.
    fn read_leb(&mut self, lnum: u32) -> IoResult<Vec<u8>> {
        let leb_size = self.leb_size();
        self.read(u64::from(lnum) * u64::from(leb_size), leb_size as usize)
    }
}

/// [`LebRead`] over the winning PEBs of one UBI volume.
///
/// Holds only PEB metadata; bytes are fetched from the underlying
/// [`UbiFile`] one LEB fragment at a time.
pub struct VolumeLebFile<'a, R> {
    file: &'a mut UbiFile<R>,
    lebs: BTreeMap<u32, LebSlot>,
    leb_size: u32,
}

impl<'a, R: Read + Seek> VolumeLebFile<'a, R> {
    pub fn new(file: &'a mut UbiFile<R>, leb_size: u32, lebs: BTreeMap<u32, LebSlot>) -> Self {
        Self {
            file,
            lebs,
            leb_size,
        }
    }
}

impl<R: Read + Seek> LebRead for VolumeLebFile<'_, R> {
    fn leb_size(&self) -> u32 {
        self.leb_size
    }

    fn leb_count(&self) -> u32 {
        self.lebs.keys().next_back().map_or(0, |&last| last + 1)
    }

    fn read(&mut self, offset: u64, len: usize) -> IoResult<Vec<u8>> {
        let leb_size = u64::from(self.leb_size);
        let mut out = Vec::with_capacity(len);
        let mut cursor = offset;

        while out.len() < len {
            let lnum = (cursor / leb_size) as u32;
            let leb_offs = cursor % leb_size;
            let chunk = usize::min((leb_size - leb_offs) as usize, len - out.len());

            match self.lebs.get(&lnum) {
                Some(slot) => {
                    // For static volumes only data_size bytes are meaningful;
                    // the tail of the LEB reads as zeroes.
                    let used = slot.data_size.map_or(leb_size, u64::from);
                    let avail = used.saturating_sub(leb_offs).min(chunk as u64) as usize;

                    if avail > 0 {
                        let peb_offset = u64::from(slot.peb.0)
                            * u64::from(self.file.peb_size())
                            + u64::from(slot.data_offset)
                            + leb_offs;
                        out.extend_from_slice(&self.file.read(peb_offset, avail)?);
                    }
                    out.resize(out.len() + chunk - avail, 0);
                }
                None => out.resize(out.len() + chunk, 0),
            }

            cursor += chunk as u64;
        }

        Ok(out)
    }
}

/// [`LebRead`] over a bare UBIFS image: LEB `n` is simply the `n`-th
/// `leb_size` slice of the data region.
pub struct LinearLebFile<R> {
    file: UbiFile<R>,
    leb_size: u32,
}

impl<R: Read + Seek> LinearLebFile<R> {
    pub fn new(file: UbiFile<R>, leb_size: u32) -> Self {
        Self { file, leb_size }
    }
}

impl<R: Read + Seek> LebRead for LinearLebFile<R> {
    fn leb_size(&self) -> u32 {
        self.leb_size
    }

    fn leb_count(&self) -> u32 {
        (self.file.len() / u64::from(self.leb_size)) as u32
    }

    fn read(&mut self, offset: u64, len: usize) -> IoResult<Vec<u8>> {
        // The image may end mid-LEB; the tail reads as zeroes like any
        // other hole.
        let avail = self.file.len().saturating_sub(offset).min(len as u64) as usize;

        let mut out = if avail > 0 {
            self.file.read(offset, avail)?
        } else {
            Vec::new()
        };
        out.resize(len, 0);

        Ok(out)
    }
}
