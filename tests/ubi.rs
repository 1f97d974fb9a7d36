//! UBI-layer scenarios: header validation, grouping, LEB arbitration
//! and degraded decoding of damaged images.

mod common;

use std::io::Cursor;

use common::*;
use ubiread::err::UbiError;
use ubiread::io::{LebRead, UbiFile};
use ubiread::ubi::Ubi;
use ubiread::DecodeOptions;

fn open(image: Vec<u8>, options: &DecodeOptions) -> Ubi<Cursor<Vec<u8>>> {
    let file = UbiFile::new(Cursor::new(image), TEST_PEB_SIZE, 0, None).unwrap();
    Ubi::new(file, options).unwrap()
}

#[test]
fn groups_blocks_into_images_and_volumes() {
    let mut image = Vec::new();
    for (vol, lnum) in [(3u32, 0u32), (3, 1), (5, 0)] {
        let ec = ec_header_bytes(TEST_VID_OFFSET, TEST_DATA_OFFSET, 0xAA);
        let vid = vid_header_bytes(vol, lnum, u64::from(lnum) + 1, 1, 0, 0);
        image.extend_from_slice(&wrap_peb(&ec, &vid, b"payload"));
    }

    let ubi = open(image, &DecodeOptions::default());

    assert_eq!(ubi.images().len(), 1);
    let image = &ubi.images()[0];
    assert_eq!(image.image_seq, 0xAA);

    let vols: Vec<u32> = image.user_volumes().map(|v| v.vol_id.0).collect();
    assert_eq!(vols, vec![3, 5]);
    assert_eq!(image.user_volumes().next().unwrap().leb_count(), 2);
}

#[test]
fn empty_and_foreign_pebs_are_skipped() {
    let mut image = Vec::new();

    // An erased PEB: valid EC header, all-ones VID area.
    let ec = ec_header_bytes(TEST_VID_OFFSET, TEST_DATA_OFFSET, 1);
    image.extend_from_slice(&wrap_peb(&ec, &[0xFF; 64], &[]));

    // Garbage that never was a PEB.
    image.extend_from_slice(&vec![0x5Au8; TEST_PEB_SIZE as usize]);

    // One real block so the scan finds an image at all.
    let vid = vid_header_bytes(7, 0, 1, 1, 0, 0);
    image.extend_from_slice(&wrap_peb(&ec, &vid, b"x"));

    let ubi = open(image, &DecodeOptions::default());
    assert_eq!(ubi.images().len(), 1);
    assert_eq!(ubi.bad_blocks().len(), 1); // the garbage PEB only
}

/// S2: two PEBs claim one LEB; the greater sequence number wins.
#[test]
fn newer_sqnum_wins_a_contested_leb() {
    let ec = ec_header_bytes(TEST_VID_OFFSET, TEST_DATA_OFFSET, 1);
    let mut image = Vec::new();

    let vid_old = vid_header_bytes(7, 0, 5, 1, 0, 0);
    image.extend_from_slice(&wrap_peb(&ec, &vid_old, b"old content"));
    let vid_new = vid_header_bytes(7, 0, 7, 1, 0, 0);
    image.extend_from_slice(&wrap_peb(&ec, &vid_new, b"new content"));

    let mut ubi = open(image, &DecodeOptions::default());

    let volume = ubi.images()[0].user_volumes().next().unwrap();
    assert_eq!(volume.leb_count(), 1);
    assert_eq!(volume.leb(0).unwrap().vid.sqnum().0, 7);

    let mut lebs = ubi.volume_leb_file(0, 0);
    let head = lebs.read(0, 11).unwrap();
    assert_eq!(&head, b"new content");
}

#[test]
fn equal_sqnums_keep_the_later_peb_and_warn() {
    let ec = ec_header_bytes(TEST_VID_OFFSET, TEST_DATA_OFFSET, 1);
    let mut image = Vec::new();
    for content in [&b"first"[..], b"later"] {
        let vid = vid_header_bytes(7, 0, 9, 1, 0, 0);
        image.extend_from_slice(&wrap_peb(&ec, &vid, content));
    }

    let mut ubi = open(image, &DecodeOptions::default());

    assert!(ubi
        .warnings()
        .iter()
        .any(|w| matches!(w, UbiError::DuplicateLeb { lnum: 0, .. })));

    let mut lebs = ubi.volume_leb_file(0, 0);
    assert_eq!(&lebs.read(0, 5).unwrap(), b"later");
}

/// S6: a corrupt PEB in the middle of a volume costs one LEB, which
/// reads back as zeroes, and is reported; the rest decodes normally.
#[test]
fn corrupt_peb_is_reported_and_zero_substituted() {
    let ec = ec_header_bytes(TEST_VID_OFFSET, TEST_DATA_OFFSET, 1);
    let mut image = Vec::new();

    let vid0 = vid_header_bytes(7, 0, 1, 1, 0, 0);
    image.extend_from_slice(&wrap_peb(&ec, &vid0, b"leb zero"));

    let vid1 = vid_header_bytes(7, 1, 2, 1, 0, 0);
    let mut broken = wrap_peb(&ec, &vid1, b"leb one");
    broken[70] ^= 0xFF; // flip a bit inside the VID header
    image.extend_from_slice(&broken);

    let vid2 = vid_header_bytes(7, 2, 3, 1, 0, 0);
    image.extend_from_slice(&wrap_peb(&ec, &vid2, b"leb two"));

    let mut ubi = open(image, &DecodeOptions::default());

    assert_eq!(ubi.bad_blocks().len(), 1);
    assert_eq!(ubi.bad_blocks()[0].0, 1);
    assert!(ubi
        .warnings()
        .iter()
        .any(|w| matches!(w, UbiError::CrcMismatch { peb: 1, .. })));

    let mut lebs = ubi.volume_leb_file(0, 0);
    assert_eq!(&lebs.read(0, 8).unwrap(), b"leb zero");
    assert_eq!(lebs.read(TEST_LEB_SIZE as u64, 7).unwrap(), vec![0u8; 7]);
    assert_eq!(
        &lebs.read(2 * u64::from(TEST_LEB_SIZE), 7).unwrap(),
        b"leb two"
    );
}

#[test]
fn ignore_block_header_errors_keeps_broken_blocks() {
    let ec = ec_header_bytes(TEST_VID_OFFSET, TEST_DATA_OFFSET, 1);
    let vid = vid_header_bytes(7, 0, 1, 1, 0, 0);
    let mut image = wrap_peb(&ec, &vid, b"survivor");
    image[70] ^= 0xFF;

    let options = DecodeOptions {
        ignore_block_header_errors: true,
        ..DecodeOptions::default()
    };
    let mut ubi = open(image, &options);

    let volume = ubi.images()[0].user_volumes().next().unwrap();
    assert_eq!(volume.leb_count(), 1);
    assert!(!volume.leb(0).unwrap().valid);

    let mut lebs = ubi.volume_leb_file(0, 0);
    assert_eq!(&lebs.read(0, 8).unwrap(), b"survivor");
}

/// The erased-VID sentinel is only a skip in normal decoding; forced
/// decoding keeps the block, marked invalid.
#[test]
fn ignore_block_header_errors_keeps_erased_blocks_too() {
    let ec = ec_header_bytes(TEST_VID_OFFSET, TEST_DATA_OFFSET, 1);
    let mut image = wrap_peb(&ec, &[0xFF; 64], &[]);

    // One well-formed block so both decodes find an image.
    let vid = vid_header_bytes(7, 0, 1, 1, 0, 0);
    image.extend_from_slice(&wrap_peb(&ec, &vid, b"x"));

    let plain = open(image.clone(), &DecodeOptions::default());
    assert_eq!(plain.images()[0].volumes().len(), 1);

    let forced = open(
        image,
        &DecodeOptions {
            ignore_block_header_errors: true,
            ..DecodeOptions::default()
        },
    );
    let erased = forced.images()[0]
        .volumes()
        .iter()
        .find(|v| v.vol_id.0 == u32::MAX)
        .expect("the erased block is kept as a volume claim");
    assert!(erased.is_internal());
    assert!(!erased.blocks().next().unwrap().valid);
}

#[test]
fn uboot_fix_merges_zero_sequence_blocks() {
    let mut image = Vec::new();

    for (seq, lnum) in [(0xBBu32, 0u32), (0xBB, 1), (0, 2)] {
        let ec = ec_header_bytes(TEST_VID_OFFSET, TEST_DATA_OFFSET, seq);
        let vid = vid_header_bytes(7, lnum, u64::from(lnum) + 1, 1, 0, 0);
        image.extend_from_slice(&wrap_peb(&ec, &vid, b"x"));
    }

    let plain = open(image.clone(), &DecodeOptions::default());
    assert_eq!(plain.images().len(), 2);

    let fixed = open(
        image,
        &DecodeOptions {
            uboot_fix: true,
            ..DecodeOptions::default()
        },
    );
    assert_eq!(fixed.images().len(), 1);
    assert_eq!(
        fixed.images()[0].user_volumes().next().unwrap().leb_count(),
        3
    );
}

#[test]
fn layout_volume_names_user_volumes() {
    let mut image = Vec::new();

    // The layout volume (two table copies) followed by volume 0's block.
    // Unused table slots are zeroed, as the kernel writes them.
    let mut table = vec![0u8; 128 * 172];
    table[..172].copy_from_slice(&vtbl_record_bytes("rootfs"));
    for lnum in [0u32, 1] {
        let ec = ec_header_bytes(TEST_VID_OFFSET, TEST_DATA_OFFSET, 1);
        let vid = vid_header_bytes(0x7FFF_EFFF, lnum, u64::from(lnum) + 1, 1, 0, 0);
        image.extend_from_slice(&wrap_peb(&ec, &vid, &table));
    }

    let ec = ec_header_bytes(TEST_VID_OFFSET, TEST_DATA_OFFSET, 1);
    let vid = vid_header_bytes(0, 0, 10, 1, 0, 0);
    image.extend_from_slice(&wrap_peb(&ec, &vid, b"data"));

    let ubi = open(image, &DecodeOptions::default());

    let volume = ubi.images()[0].user_volumes().next().unwrap();
    assert_eq!(volume.vol_id.0, 0);
    assert_eq!(volume.name.as_deref(), Some("rootfs"));
}

#[test]
fn static_volumes_bound_reads_to_data_size() {
    let ec = ec_header_bytes(TEST_VID_OFFSET, TEST_DATA_OFFSET, 1);
    let vid = vid_header_bytes(9, 0, 1, 2, 6, 1); // static, 6 used bytes
    let image = wrap_peb(&ec, &vid, b"abcdefXXXX");

    let mut ubi = open(image, &DecodeOptions::default());
    let mut lebs = ubi.volume_leb_file(0, 0);

    let read = lebs.read(0, 10).unwrap();
    assert_eq!(&read[..6], b"abcdef");
    assert_eq!(&read[6..], &[0u8; 4]);
}

#[test]
fn an_image_without_any_valid_peb_is_refused() {
    let image = vec![0u8; TEST_PEB_SIZE as usize * 2];
    let file = UbiFile::new(Cursor::new(image), TEST_PEB_SIZE, 0, None).unwrap();

    assert!(matches!(
        Ubi::new(file, &DecodeOptions::default()),
        Err(UbiError::NoImages)
    ));
}

/// Round-trip sanity for the UBI-wrapped UBIFS builder used by the other
/// integration suites: the LEB view must reproduce the bare LEB bytes.
#[test]
fn wrapped_lebs_read_back_identically() {
    let mut fs = UbifsBuilder::new();
    fs.add_ino(1, 0o040755, 0, 1, 0, 0, &[]);
    let lebs = fs.finish();

    let image = wrap_ubi_image(&lebs, 0, 1);
    let mut ubi = open(image, &DecodeOptions::default());
    let mut view = ubi.volume_leb_file(0, 0);

    assert_eq!(view.leb_size(), TEST_LEB_SIZE);
    for (&lnum, content) in &lebs {
        let mut want = content.clone();
        want.resize(TEST_LEB_SIZE as usize, 0xFF);
        assert_eq!(view.read_leb(lnum).unwrap(), want, "leb {lnum}");
    }
}
