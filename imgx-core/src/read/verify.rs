use std::fs::File;
use std::path::Path;

use rayon::prelude::*;
use tracing::info;

use super::metadata::{read_block_payload, read_disk_metadata};
use super::reader::read_backup_file;
use crate::error::Result;

/// Blocks checked per rayon task; each task opens its own handle.
const VERIFY_BATCH: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub disks: u32,
    pub blocks: u64,
    pub raw_bytes: u64,
    pub stored_bytes: u64,
}

/// Read every block of the container through the full decrypt, decompress
/// and CRC path without writing anything. The first failing block in
/// container order is reported.
pub fn verify_backup(path: &Path, password: &str) -> Result<VerifyReport> {
    let layout = read_backup_file(path, password, false)?;

    let mut f = File::open(path)?;
    for disk in 0..layout.disk_count() {
        read_disk_metadata(&layout, &mut f, disk as u16)?;
    }

    let idxs: Vec<usize> = (0..layout.blocks.len()).collect();
    let checked: Vec<Result<u64>> = idxs
        .par_chunks(VERIFY_BATCH)
        .map(|batch| -> Result<u64> {
            let mut f = File::open(path)?;
            let mut raw = 0u64;
            for &i in batch {
                raw += read_block_payload(&layout, i, &mut f)?.len() as u64;
            }
            Ok(raw)
        })
        .collect();

    let mut report = VerifyReport {
        disks: layout.disk_count(),
        blocks: layout.blocks.len() as u64,
        ..Default::default()
    };
    for r in checked {
        report.raw_bytes += r?;
    }
    report.stored_bytes = layout.blocks.iter().map(|b| b.stored_len).sum();
    info!(
        path = %path.display(),
        blocks = report.blocks,
        raw = report.raw_bytes,
        "container verified"
    );
    Ok(report)
}
