use std::io::{Read, Seek};

use crate::container::blocktab::BlockKind;
use crate::container::prefix::PREFIX_LEN;
use crate::domain::{BlockRow, DiskRow};
use crate::error::Result;
use crate::read::metadata::read_disk_metadata;
use crate::read::reader::FileLayout;

/// One row per block in container order. Needs only the block table.
pub fn describe(layout: &FileLayout) -> Vec<BlockRow> {
    let area = layout.header_off.saturating_sub(PREFIX_LEN).max(1) as f64;
    layout
        .blocks
        .iter()
        .enumerate()
        .map(|(i, b)| BlockRow {
            ordinal: i,
            kind: b.kind,
            codec: b.codec,
            disk: b.disk,
            offset: b.offset,
            stored_len: b.stored_len,
            raw_len: b.raw_len,
            target_off: (b.kind == BlockKind::Data).then_some(b.target_off),
            checksum: b.checksum,
            pct_end: ((b.end() - PREFIX_LEN) as f64 * 100.0 / area) as f32,
        })
        .collect()
}

/// One row per disk. Uses the loaded index when present, otherwise reads
/// each disk-metadata block through `r`.
pub fn disks<R: Read + Seek + ?Sized>(layout: &FileLayout, r: &mut R) -> Result<Vec<DiskRow>> {
    (0..layout.disk_count())
        .map(|n| {
            let n = n as u16;
            let dl = match &layout.index {
                Some(idx) => idx.disks[n as usize].clone(),
                None => read_disk_metadata(layout, r, n)?,
            };
            let data = layout.data_blocks(n);
            Ok(DiskRow {
                disk_number: n,
                disk_id: dl.disk_id.to_string(),
                table: dl.table,
                size: dl.size,
                boot_area: dl.track0.len() as u64,
                partitions: dl.partitions,
                logical_partitions: dl.logical_partitions,
                data_blocks: data.len(),
                data_bytes: layout.data_bytes(n),
                file_metadata_blocks: layout.blocks_of(n, BlockKind::FileMetadata).count(),
            })
        })
        .collect()
}
