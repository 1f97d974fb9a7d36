//! Whole-image decoding driver.
//!
//! [`decode_image`] is the one-call entry point: it locates the data in
//! the source, autodetects raw UBI versus bare UBIFS from the magic at
//! the start offset, fills in any geometry the options leave unset, and
//! replays every decodable volume onto the emitter. The layered types
//! ([`Ubi`], [`Ubifs`]) stay available for callers that want to steer
//! the pass themselves.

use std::io::{Read, Seek};

use log::warn;

use crate::err::{BlockIoError, Error, UbiError};
use crate::io::{LinearLebFile, UbiFile};
use crate::options::DecodeOptions;
use crate::scan::{self, ImageKind};
use crate::ubi::Ubi;
use crate::ubifs::emit::{Emitter, Warning, WarningKind};
use crate::ubifs::Ubifs;

/// Decodes a whole UBI or bare UBIFS image onto `emitter`.
///
/// UBI images are decoded volume by volume, in image and volume-id
/// order, all into the same emitter; UBI-level scan problems arrive as
/// [`Warning`] events ahead of the tree. Unset geometry (start offset,
/// PEB or LEB size) is guessed from the medium.
///
/// # Errors
///
/// Fails with [`Error::Unrecognized`] when no UBI/UBIFS magic or no
/// usable geometry can be found, and otherwise propagates the layer
/// errors of the decode itself. Per-volume UBIFS mount failures are
/// downgraded to log warnings so one broken volume does not hide its
/// siblings.
pub fn decode_image<R: Read + Seek>(
    mut source: R,
    options: &DecodeOptions,
    emitter: &mut dyn Emitter,
) -> Result<(), Error> {
    let start = match (options.start_offset, options.guess_offset) {
        (Some(start), _) => start,
        (None, guess_from) => {
            let from = guess_from.unwrap_or(0);
            scan::guess_start_offset(&mut source, from)
                .map_err(|source| host_read_error(from, source))?
                .ok_or(Error::Unrecognized {
                    reason: "no UBI or UBIFS magic in the input",
                })?
        }
    };

    let kind = scan::guess_filetype(&mut source, start)
        .map_err(|source| host_read_error(start, source))?
        .ok_or(Error::Unrecognized {
            reason: "the data at the start offset is neither UBI nor UBIFS",
        })?;

    match kind {
        ImageKind::Ubi => decode_ubi(source, start, options, emitter),
        ImageKind::Ubifs => decode_bare_ubifs(source, start, options, emitter),
    }
}

fn decode_ubi<R: Read + Seek>(
    mut source: R,
    start: u64,
    options: &DecodeOptions,
    emitter: &mut dyn Emitter,
) -> Result<(), Error> {
    let peb_size = match options.peb_size {
        Some(size) => size,
        None => scan::guess_peb_size(&mut source)
            .map_err(|source| host_read_error(start, source))?
            .ok_or(Error::Unrecognized {
                reason: "PEB size could not be determined",
            })?,
    };

    let file = UbiFile::new(source, peb_size, start, options.end_offset)?;
    let mut ubi = Ubi::new(file, options)?;

    for warning in ubi.warnings() {
        let kind = match warning {
            UbiError::DuplicateLeb { .. } => WarningKind::DuplicateLeb,
            UbiError::Io(_)
            | UbiError::CrcMismatch { .. }
            | UbiError::MagicMismatch { .. }
            | UbiError::UnsupportedVersion { .. }
            | UbiError::Truncated { .. } => WarningKind::BlockReadError,
            _ => WarningKind::BadNode,
        };
        emitter.on_warning(&Warning::new(kind, warning.to_string()));
    }

    let mut targets = Vec::new();
    for (image_idx, image) in ubi.images().iter().enumerate() {
        for (vol_idx, volume) in image.volumes().iter().enumerate() {
            if volume.is_internal() || volume.is_empty() {
                continue;
            }
            targets.push((image_idx, vol_idx, volume.vol_id));
        }
    }

    if targets.is_empty() {
        let image_seq = ubi.images().first().map_or(0, |image| image.image_seq);
        return Err(UbiError::NoVolumes { image_seq }.into());
    }

    for (image_idx, vol_idx, vol_id) in targets {
        let leb_file = ubi.volume_leb_file(image_idx, vol_idx);
        match Ubifs::new(leb_file, options.clone()) {
            Ok(mut fs) => fs.decode(emitter)?,
            Err(e) => warn!("skipping volume {vol_id} of image {image_idx}: {e}"),
        }
    }

    Ok(())
}

fn decode_bare_ubifs<R: Read + Seek>(
    mut source: R,
    start: u64,
    options: &DecodeOptions,
    emitter: &mut dyn Emitter,
) -> Result<(), Error> {
    let leb_size = match options.leb_size {
        Some(size) => size,
        None => scan::guess_leb_size(&mut source)
            .map_err(|source| host_read_error(start, source))?
            .ok_or(Error::Unrecognized {
                reason: "LEB size could not be determined",
            })?,
    };

    let file = UbiFile::new(source, leb_size, start, options.end_offset)?;
    let mut fs = Ubifs::new(LinearLebFile::new(file, leb_size), options.clone())?;
    fs.decode(emitter)?;

    Ok(())
}

fn host_read_error(offset: u64, source: std::io::Error) -> Error {
    Error::Io(BlockIoError::Read { offset, source })
}
