use serde::Serialize;

use crate::codec::CodecId;
use crate::container::blocktab::BlockKind;
use crate::container::disk::{PartitionEntry, PartitionTableKind};

#[derive(Clone, Debug)]
pub struct BlockRow {
    pub ordinal: usize,
    pub kind: BlockKind,
    pub codec: CodecId,
    pub disk: u16,
    pub offset: u64,
    pub stored_len: u64,
    pub raw_len: u64,
    /// Data blocks only.
    pub target_off: Option<u64>,
    pub checksum: u32,
    /// Where this block ends, as a share of the block area.
    pub pct_end: f32,
}

#[derive(Clone, Debug, Serialize)]
pub struct DiskRow {
    pub disk_number: u16,
    pub disk_id: String,
    pub table: PartitionTableKind,
    pub size: u64,
    pub boot_area: u64,
    pub partitions: Vec<PartitionEntry>,
    pub logical_partitions: Vec<PartitionEntry>,
    pub data_blocks: usize,
    pub data_bytes: u64,
    pub file_metadata_blocks: usize,
}
