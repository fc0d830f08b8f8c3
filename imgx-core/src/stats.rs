use serde::{Deserialize, Serialize};

use crate::read::reader::FileLayout;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Stats {
    pub version: u16,
    pub disks: u32,
    pub blocks: u64,
    pub metadata_blocks: u64,
    pub data_blocks: u64,
    pub raw_bytes: u64,
    pub stored_bytes: u64,
    pub compression_ratio: f32,
    pub encrypted: bool,
    pub created: i64,
    pub container_bytes: u64,
}

impl Stats {
    pub fn of(layout: &FileLayout) -> Self {
        let mut s = Stats {
            version: layout.version(),
            disks: layout.disk_count(),
            blocks: layout.blocks.len() as u64,
            encrypted: layout.encrypted(),
            created: layout.header.created,
            container_bytes: layout.container_len,
            ..Default::default()
        };
        for b in &layout.blocks {
            if b.kind.is_metadata() {
                s.metadata_blocks += 1;
            } else {
                s.data_blocks += 1;
            }
            s.raw_bytes += b.raw_len;
            s.stored_bytes += b.stored_len;
        }
        s.compression_ratio = if s.raw_bytes == 0 {
            1.0
        } else {
            s.stored_bytes as f32 / s.raw_bytes as f32
        };
        s
    }
}
