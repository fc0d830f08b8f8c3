mod common;

use std::fs::File;

use common::*;
use imgx_core::codec::CodecId;
use imgx_core::hash::crc32::Crc32;
use imgx_core::{
    BlockKind, DiskSource, ImgxError, PartitionTableKind, describe, disks, read_backup_file,
    read_disk_metadata, read_file_metadata_data, verify_backup, write_backup,
};
use proptest::prelude::*;

#[test]
fn wrong_or_missing_password_fails_before_any_block() {
    let dir = tempfile::tempdir().unwrap();
    let img = write_file(dir.path(), "d.img", &pattern(8192, 0));
    let c = backup(dir.path(), &[img], &options(Some("hunter2"), 4096, 3));

    assert!(matches!(
        read_backup_file(&c, "hunter3", true),
        Err(ImgxError::Authentication)
    ));
    assert!(matches!(
        read_backup_file(&c, "", false),
        Err(ImgxError::Authentication)
    ));
    let l = read_backup_file(&c, "hunter2", true).unwrap();
    assert!(l.encrypted());
}

#[test]
fn unencrypted_container_ignores_password() {
    let dir = tempfile::tempdir().unwrap();
    let img = write_file(dir.path(), "d.img", &pattern(8192, 0));
    let c = backup(dir.path(), &[img], &options(None, 4096, 3));
    let l = read_backup_file(&c, "anything", true).unwrap();
    assert!(!l.encrypted());
    assert_eq!(l.disk_count(), 1);
}

#[test]
fn every_truncation_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let img = write_file(dir.path(), "d.img", &pattern(3000, 1));
    let c = backup(dir.path(), &[img], &options(None, 1024, 3));
    let full = std::fs::read(&c).unwrap();

    let cut_path = dir.path().join("cut.imgx");
    for cut in 0..full.len() {
        std::fs::write(&cut_path, &full[..cut]).unwrap();
        let r = read_backup_file(&cut_path, "", true);
        assert!(
            matches!(r, Err(ImgxError::Truncated { .. }) | Err(ImgxError::Format(_))),
            "cut at {cut} gave {r:?}"
        );
    }
}

#[test]
fn index_exposes_file_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_file(dir.path(), "a.img", &pattern(4096, 0));
    let b = write_file(dir.path(), "b.img", &pattern(4096, 9));
    let out = dir.path().join("meta.imgx");
    let json = r#"{"path":"/etc/fstab","size":812}"#;
    let sources = vec![
        DiskSource {
            file_metadata: vec![json.to_string()],
            ..DiskSource::new(&a)
        },
        DiskSource::new(&b),
    ];
    write_backup(&sources, &out, &options(Some("pw"), 4096, 3)).unwrap();

    let l = read_backup_file(&out, "pw", true).unwrap();
    let idx = l.index.as_ref().unwrap();
    assert_eq!(idx.disks.len(), 2);
    assert_eq!(idx.files.len(), 1);
    assert_eq!(idx.files[0].disk, 0);
    assert_eq!(idx.files[0].json, json);

    // without the index, blocks are still reachable through the table
    let l = read_backup_file(&out, "pw", false).unwrap();
    assert!(l.index.is_none());
    let mut f = File::open(&out).unwrap();
    assert_eq!(
        read_file_metadata_data(&l, &mut f, 0).unwrap().as_deref(),
        Some(json)
    );
    assert_eq!(read_file_metadata_data(&l, &mut f, 1).unwrap(), None);
    let d1 = read_disk_metadata(&l, &mut f, 1).unwrap();
    assert_eq!(d1.disk_number, 1);
    assert_eq!(d1.table, PartitionTableKind::None);
    assert!(read_disk_metadata(&l, &mut f, 2).is_err());
}

#[test]
fn describe_and_disk_rows() {
    let dir = tempfile::tempdir().unwrap();
    let img = write_file(dir.path(), "mbr.img", &mbr_image());
    let c = backup(dir.path(), &[img], &options(None, 256 * 1024, 3));
    let l = read_backup_file(&c, "", false).unwrap();

    let rows = describe(&l);
    assert_eq!(rows[0].kind, BlockKind::DiskMetadata);
    assert_eq!(rows[0].target_off, None);
    let data: Vec<_> = rows.iter().filter(|r| r.kind == BlockKind::Data).collect();
    assert_eq!(data.len(), 8); // 2 MiB partition in 256 KiB blocks
    assert_eq!(data[0].target_off, Some(1 << 20));
    assert!(rows.windows(2).all(|w| w[0].pct_end <= w[1].pct_end));
    assert!(rows.last().unwrap().pct_end > 99.9);

    let mut f = File::open(&c).unwrap();
    let d = disks(&l, &mut f).unwrap();
    assert_eq!(d.len(), 1);
    assert_eq!(d[0].disk_id, "12345678");
    assert_eq!(d[0].table, PartitionTableKind::Mbr);
    assert_eq!(d[0].data_bytes, 2 << 20);
    assert_eq!(d[0].boot_area, 1 << 20);
}

#[test]
fn verify_catches_a_flipped_payload_byte() {
    let dir = tempfile::tempdir().unwrap();
    let img = write_file(dir.path(), "d.img", &pattern(16384, 0));
    let c = backup(dir.path(), &[img], &options(Some("pw"), 4096, 0));

    let report = verify_backup(&c, "pw").unwrap();
    assert_eq!(report.blocks, 5);
    assert_eq!(report.disks, 1);

    let l = read_backup_file(&c, "pw", false).unwrap();
    let victim = l.blocks.iter().find(|b| b.kind == BlockKind::Data).unwrap();
    let mut bytes = std::fs::read(&c).unwrap();
    bytes[(victim.offset + 24 + 100) as usize] ^= 0x40;
    std::fs::write(&c, bytes).unwrap();

    match verify_backup(&c, "pw") {
        Err(ImgxError::Integrity { kind, offset }) => {
            assert_eq!(kind, BlockKind::Data);
            assert_eq!(offset, victim.offset);
        }
        other => panic!("expected integrity error, got {other:?}"),
    }
}

#[test]
fn stored_payload_is_encrypted_only_with_a_password() {
    let dir = tempfile::tempdir().unwrap();
    let raw = pattern(4096, 5);
    let img = write_file(dir.path(), "d.img", &raw);

    for (pw, expect_plain) in [(None, true), (Some("pw"), false)] {
        let c = backup(dir.path(), &[img.clone()], &options(pw, 4096, 0));
        let l = read_backup_file(&c, pw.unwrap_or(""), false).unwrap();
        let b = l.blocks.iter().find(|b| b.kind == BlockKind::Data).unwrap();
        assert_eq!(b.codec, CodecId::Store);
        let bytes = std::fs::read(&c).unwrap();
        let start = (b.offset + 24) as usize;
        let stored = &bytes[start..start + 4096];
        assert_eq!(stored == &raw[..], expect_plain);
    }
}

#[test]
fn oversized_raw_length_is_rejected_at_open() {
    let dir = tempfile::tempdir().unwrap();
    let img = write_file(dir.path(), "d.img", &pattern(8192, 4));
    let c = backup(dir.path(), &[img], &options(None, 4096, 3));
    let l = read_backup_file(&c, "", false).unwrap();
    let i = l
        .blocks
        .iter()
        .position(|b| b.kind == BlockKind::Data && b.codec == CodecId::Zstd)
        .unwrap();

    // patch raw_len in the table entry and reseal the header checksum
    let mut bytes = std::fs::read(&c).unwrap();
    let h = l.header_off as usize;
    let entry = h + 148 + i * 48;
    bytes[entry + 32..entry + 40].copy_from_slice(&(1u64 << 46).to_le_bytes());
    let mut crc = Crc32::new();
    crc.update(&bytes[h..h + 140]);
    crc.update(&bytes[h + 148..]);
    let crc = crc.finalize();
    bytes[h + 140..h + 144].copy_from_slice(&crc.to_le_bytes());
    std::fs::write(&c, bytes).unwrap();

    assert!(matches!(read_backup_file(&c, "", false), Err(ImgxError::Format(_))));
    assert!(matches!(verify_backup(&c, ""), Err(ImgxError::Format(_))));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn header_corruption_is_format_error(pos in 0usize..140, bit in 0u8..8) {
        let dir = tempfile::tempdir().unwrap();
        let img = write_file(dir.path(), "d.img", &pattern(2048, 2));
        let c = backup(dir.path(), &[img], &options(None, 1024, 3));
        let l = read_backup_file(&c, "", false).unwrap();

        let mut bytes = std::fs::read(&c).unwrap();
        bytes[l.header_off as usize + pos] ^= 1 << bit;
        std::fs::write(&c, bytes).unwrap();
        let r = read_backup_file(&c, "", false);
        prop_assert!(matches!(r, Err(ImgxError::Format(_)) | Err(ImgxError::Truncated { .. })), "unexpected result: {:?}", r);
    }
}
