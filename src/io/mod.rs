//! Block-granular I/O over a flash dump.
//!
//! [`UbiFile`] wraps any `Read + Seek` source and exposes it as a `[start,
//! end)` byte window addressed either freely ([`UbiFile::read`]) or in whole
//! physical erase blocks ([`UbiFile::read_block`]). All higher layers go
//! through it, which keeps them testable against in-memory buffers.

use std::io::{Read, Seek, SeekFrom};

use crate::err::{BlockIoError, IoResult};

pub mod leb;

pub use leb::{LebRead, LinearLebFile, VolumeLebFile};

/// Index of a physical erase block within the data region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PebIndex(pub u32);

impl core::fmt::Display for PebIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

/// Random-access reader over the UBI/UBIFS data region of a source.
///
/// The PEB size and the `[start, end)` slice are fixed at construction.
/// Reads past `end` fail with [`BlockIoError::OutOfRange`]; short reads from
/// the source surface as [`BlockIoError::BlockRead`] with the PEB index when
/// block-addressed, [`BlockIoError::Read`] otherwise.
#[derive(Debug)]
pub struct UbiFile<R> {
    inner: R,
    peb_size: u32,
    start: u64,
    end: u64,
}

impl<R: Read + Seek> UbiFile<R> {
    /// Wraps `inner`, slicing it to `[start, end)`.
    ///
    /// `end = None` means the end of the source. The slice is not required
    /// to be a whole number of PEBs; a trailing partial block is ignored by
    /// [`UbiFile::peb_count`].
    ///
    /// # Errors
    ///
    /// Fails with [`BlockIoError::Read`] if the source cannot be sized, and
    /// with [`BlockIoError::OutOfRange`] if `start` lies past the end.
    pub fn new(mut inner: R, peb_size: u32, start: u64, end: Option<u64>) -> IoResult<Self> {
        let source_len = inner
            .seek(SeekFrom::End(0))
            .map_err(|source| BlockIoError::Read { offset: 0, source })?;
        let end = end.unwrap_or(source_len).min(source_len);

        if start > end {
            return Err(BlockIoError::OutOfRange {
                offset: start,
                len: 0,
            });
        }

        Ok(Self {
            inner,
            peb_size,
            start,
            end,
        })
    }

    /// Size of one physical erase block in bytes.
    pub fn peb_size(&self) -> u32 {
        self.peb_size
    }

    /// Length of the data region in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// `true` if the data region holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Number of whole PEBs in the data region.
    pub fn peb_count(&self) -> u32 {
        (self.len() / u64::from(self.peb_size)) as u32
    }

    /// Reads `len` bytes at `offset` (relative to the region start).
    ///
    /// Reads may straddle PEB boundaries. Reads crossing `end` fail with
    /// [`BlockIoError::OutOfRange`] without partial results.
    pub fn read(&mut self, offset: u64, len: usize) -> IoResult<Vec<u8>> {
        if offset + len as u64 > self.len() {
            return Err(BlockIoError::OutOfRange { offset, len });
        }

        let absolute = self.start + offset;
        self.inner
            .seek(SeekFrom::Start(absolute))
            .map_err(|source| BlockIoError::Read {
                offset: absolute,
                source,
            })?;

        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .map_err(|source| BlockIoError::Read {
                offset: absolute,
                source,
            })?;

        Ok(buf)
    }

    /// Reads one whole PEB. Always returns exactly `peb_size` bytes.
    pub fn read_block(&mut self, peb: PebIndex) -> IoResult<Vec<u8>> {
        let offset = u64::from(peb.0) * u64::from(self.peb_size);

        self.read(offset, self.peb_size as usize)
            .map_err(|e| match e {
                BlockIoError::Read { source, .. } => BlockIoError::BlockRead {
                    peb: peb.0,
                    source,
                },
                other => other,
            })
    }
}
