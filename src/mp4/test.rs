// SPDX-License-Identifier: GPL-2.0-or-later

#![allow(clippy::unwrap_used)]

use crate::*;
use pretty_assertions::assert_eq;
use pretty_hex::pretty_hex;

fn marshal_single(b: &dyn ImmutableBox) -> Vec<u8> {
    let mut buf = Vec::new();
    let size = write_single_box(&mut buf, b).unwrap();
    assert_eq!(size, buf.len());
    buf
}

#[test]
fn test_ftyp() {
    let got = marshal_single(&Ftyp {
        major_brand: *b"iso4",
        minor_version: 512,
        compatible_brands: vec![CompatibleBrandElem(*b"iso4")],
    });

    let want = vec![
        0, 0, 0, 0x14, b'f', b't', b'y', b'p', //
        b'i', b's', b'o', b'4', // Major brand.
        0, 0, 2, 0, // Minor version.
        b'i', b's', b'o', b'4', // Compatible brand.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_mvhd() {
    let got = marshal_single(&Mvhd {
        timescale: 1000,
        duration: 0,
        rate: 65536,
        volume: 256,
        matrix: [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000],
        next_track_id: 2,
        ..Default::default()
    });

    let want = vec![
        0, 0, 0, 0x6c, b'm', b'v', b'h', b'd', //
        0, 0, 0, 0, // Fullbox.
        0, 0, 0, 0, // Creation time.
        0, 0, 0, 0, // Modification time.
        0, 0, 3, 0xe8, // Timescale.
        0, 0, 0, 0, // Duration.
        0, 1, 0, 0, // Rate.
        1, 0, // Volume.
        0, 0, // Reserved.
        0, 0, 0, 0, 0, 0, 0, 0, // Reserved2.
        0, 1, 0, 0, 0, 0, 0, 0, 0, // Matrix.
        0, 0, 0, 0, 0, 0, 0, 0, 1, //
        0, 0, 0, 0, 0, 0, 0, 0, 0, //
        0, 0, 0, 0, 0, 0x40, 0, 0, 0, //
        0, 0, 0, 0, 0, 0, // Pre-defined.
        0, 0, 0, 0, 0, 0, //
        0, 0, 0, 0, 0, 0, //
        0, 0, 0, 0, 0, 0, //
        0, 0, 0, 2, // Next track ID.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_avcc() {
    let got = marshal_single(&AvcC {
        profile: 0x64,
        profile_compatibility: 0,
        level: 0x16,
        sequence_parameter_set: AvcParameterSet(vec![0x67, 0x64, 0, 0x16]),
        picture_parameter_set: AvcParameterSet(vec![0x68, 0xee]),
    });

    let want = vec![
        0, 0, 0, 0x19, b'a', b'v', b'c', b'C', //
        1,    // Configuration version.
        0x64, // Profile.
        0,    // Profile compatibility.
        0x16, // Level.
        0xff, // Reserved, length size minus one.
        0xe1, // Reserved, N sequence parameters.
        0, 4, // SPS length.
        0x67, 0x64, 0, 0x16, // SPS.
        1, // N picture parameters.
        0, 2, // PPS length.
        0x68, 0xee, // PPS.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_mp4a() {
    let got = marshal_single(&Mp4a {
        sample_entry: SampleEntry {
            data_reference_index: 1,
            ..Default::default()
        },
        channel_count: 2,
        sample_size: 16,
        sample_rate: 48000 << 16,
        ..Default::default()
    });

    let want = vec![
        0, 0, 0, 0x24, b'm', b'p', b'4', b'a', //
        0, 0, 0, 0, 0, 0, // Reserved.
        0, 1, // Data reference index.
        0, 0, 0, 0, 0, 0, 0, 0, // Reserved2.
        0, 2, // Channel count.
        0, 0x10, // Sample size.
        0, 0, // Pre-defined.
        0, 0, // Reserved3.
        0xbb, 0x80, 0, 0, // Sample rate.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_esds() {
    let got = marshal_single(&Esds {
        full_box: FullBox::default(),
        es_id: 2,
        object_type_indication: 0x40,
        stream_type: 0x15,
        buffer_size_db: 0,
        max_bitrate: 128_825,
        avg_bitrate: 128_825,
        dec_specific_info: vec![0x12, 0x10],
    });

    let want = vec![
        0, 0, 0, 0x27, b'e', b's', b'd', b's', //
        0, 0, 0, 0, // Fullbox.
        0x03, 0x19, // ES descriptor.
        0, 2, // ES ID.
        0,    // Flags.
        0x04, 0x11, // Decoder config descriptor.
        0x40, // Object type indication.
        0x15, // Stream type.
        0, 0, 0, // Buffer size DB.
        0, 1, 0xf7, 0x39, // Max bitrate.
        0, 1, 0xf7, 0x39, // Average bitrate.
        0x05, 2, // Decoder specific info.
        0x12, 0x10, // Config.
        0x06, 1, 0x02, // SL config descriptor.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_smhd() {
    let got = marshal_single(&Smhd::default());

    let want = vec![
        0, 0, 0, 0x10, b's', b'm', b'h', b'd', //
        0, 0, 0, 0, // Fullbox.
        0, 0, // Balance.
        0, 0, // Reserved.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}

#[test]
fn test_box_tree() {
    let tree = Boxes::new(Moov).with_children([
        Boxes::new(Trak).with_child(Boxes::new(Mdia)),
        Boxes::new(Trak),
    ]);

    // Empty boxes are 8 bytes each.
    assert_eq!(32, tree.size());

    let mut buf = Vec::new();
    tree.marshal(&mut buf).unwrap();

    let want = vec![
        0, 0, 0, 0x20, b'm', b'o', b'o', b'v', //
        0, 0, 0, 0x10, b't', b'r', b'a', b'k', //
        0, 0, 0, 8, b'm', b'd', b'i', b'a', //
        0, 0, 0, 8, b't', b'r', b'a', b'k', //
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&buf));
}

#[test]
fn test_url_nopt() {
    let url = Url {
        full_box: FullBox {
            version: 0,
            flags: [0, 0, 1],
        },
        location: String::new(),
    };
    let got = marshal_single(&url);

    let want = vec![
        0, 0, 0, 0xc, b'u', b'r', b'l', b' ', //
        0, 0, 0, 1, // Fullbox.
    ];
    assert_eq!(pretty_hex(&want), pretty_hex(&got));
}
