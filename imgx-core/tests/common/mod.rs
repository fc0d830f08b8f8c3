#![allow(dead_code)]

use std::path::{Path, PathBuf};

use imgx_core::hash::crc32::checksum;
use imgx_core::{BackupOptions, DiskSource, KdfParams, write_backup};

pub const FAST: KdfParams = KdfParams {
    m_cost: 8,
    t_cost: 1,
    p_cost: 1,
};

pub const MIB: usize = 1 << 20;

/// Never zero, so restored regions are told apart from untouched ones.
pub fn pattern(len: usize, salt: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i % 251) as u8).wrapping_add(salt) | 1)
        .collect()
}

/// 4 MiB image, MBR signature 0x12345678, one partition at [1 MiB, 3 MiB).
pub fn mbr_image() -> Vec<u8> {
    let mut img = vec![0u8; 4 * MIB];
    img[0..440].copy_from_slice(&pattern(440, 3)); // boot code
    img[440..444].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    let e = &mut img[446..462];
    e[4] = 0x83;
    e[8..12].copy_from_slice(&2048u32.to_le_bytes());
    e[12..16].copy_from_slice(&4096u32.to_le_bytes());
    img[510] = 0x55;
    img[511] = 0xAA;
    img[MIB..3 * MIB].copy_from_slice(&pattern(2 * MIB, 7));
    img
}

/// 4 MiB image with a protective MBR and one GPT partition at LBA 2048..=4095.
pub fn gpt_image() -> Vec<u8> {
    let mut img = vec![0u8; 4 * MIB];
    let e = &mut img[446..462];
    e[4] = 0xEE;
    e[8..12].copy_from_slice(&1u32.to_le_bytes());
    e[12..16].copy_from_slice(&8191u32.to_le_bytes());
    img[510] = 0x55;
    img[511] = 0xAA;

    let ent = &mut img[1024..1152];
    ent[0..16].copy_from_slice(&[0x0F; 16]);
    ent[16..32].copy_from_slice(&[0x11; 16]);
    ent[32..40].copy_from_slice(&2048u64.to_le_bytes());
    ent[40..48].copy_from_slice(&4095u64.to_le_bytes());

    let h = &mut img[512..604];
    h[..8].copy_from_slice(b"EFI PART");
    h[8..12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
    h[12..16].copy_from_slice(&92u32.to_le_bytes());
    h[56..72].copy_from_slice(&[0x42; 16]);
    h[72..80].copy_from_slice(&2u64.to_le_bytes());
    h[80..84].copy_from_slice(&4u32.to_le_bytes());
    h[84..88].copy_from_slice(&128u32.to_le_bytes());
    let crc = checksum(h);
    h[16..20].copy_from_slice(&crc.to_le_bytes());

    img[MIB..2 * MIB].copy_from_slice(&pattern(MIB, 11));
    img
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, bytes).unwrap();
    p
}

/// Zero-filled restore target.
pub fn blank_target(dir: &Path, name: &str, size: usize) -> PathBuf {
    write_file(dir, name, &vec![0u8; size])
}

pub fn options(password: Option<&str>, block_size: u32, level: i32) -> BackupOptions {
    BackupOptions {
        password: password.map(str::to_string),
        kdf: FAST,
        block_size,
        level,
        deterministic: true,
        ..Default::default()
    }
}

pub fn backup(dir: &Path, images: &[PathBuf], opts: &BackupOptions) -> PathBuf {
    let out = dir.join("backup.imgx");
    let sources: Vec<DiskSource> = images.iter().map(DiskSource::new).collect();
    write_backup(&sources, &out, opts).unwrap();
    out
}
