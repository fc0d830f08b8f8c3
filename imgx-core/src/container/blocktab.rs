use std::fmt;
use std::io::Write;

use crate::codec::CodecId;
use crate::error::{ImgxError, Result};
use crate::util::fileio::{le16, le32, le64};

pub const ENTRY_SIZE: usize = 48;

/// Largest raw payload a single block may declare. Decoding allocates
/// `raw_len` up front, so the table is never trusted beyond this.
pub const MAX_BLOCK_RAW: u64 = 256 << 20;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BlockKind {
    DiskMetadata = 1,
    FileMetadata = 2,
    Data = 3,
}

impl BlockKind {
    pub fn is_metadata(self) -> bool {
        !matches!(self, BlockKind::Data)
    }
}

impl TryFrom<u8> for BlockKind {
    type Error = ImgxError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(BlockKind::DiskMetadata),
            2 => Ok(BlockKind::FileMetadata),
            3 => Ok(BlockKind::Data),
            other => Err(ImgxError::format(format!("unknown block kind {other}"))),
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlockKind::DiskMetadata => "disk-metadata",
            BlockKind::FileMetadata => "file-metadata",
            BlockKind::Data => "data",
        })
    }
}

/// One entry of the block table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub kind: BlockKind,
    pub codec: CodecId,
    pub disk: u16,
    /// Container offset of the block header.
    pub offset: u64,
    /// Payload bytes as stored (after compression).
    pub stored_len: u64,
    /// Destination offset on the target disk; 0 for metadata blocks.
    pub target_off: u64,
    /// Payload bytes after decompression.
    pub raw_len: u64,
    /// CRC32 of the raw payload.
    pub checksum: u32,
}

impl BlockDescriptor {
    /// First byte after this block (header + payload).
    pub fn end(&self) -> u64 {
        self.offset
            .saturating_add(super::block::BLOCK_HEADER_LEN)
            .saturating_add(self.stored_len)
    }
}

pub fn write_table(mut w: impl Write, entries: &[BlockDescriptor]) -> Result<()> {
    let mut buf = [0u8; ENTRY_SIZE];
    for e in entries {
        encode_entry(e, &mut buf);
        w.write_all(&buf)?;
    }
    Ok(())
}

fn encode_entry(e: &BlockDescriptor, buf: &mut [u8; ENTRY_SIZE]) {
    buf.fill(0);
    buf[0] = e.kind as u8;
    buf[1] = e.codec as u8;
    buf[2..4].copy_from_slice(&e.disk.to_le_bytes());
    buf[8..16].copy_from_slice(&e.offset.to_le_bytes());
    buf[16..24].copy_from_slice(&e.stored_len.to_le_bytes());
    buf[24..32].copy_from_slice(&e.target_off.to_le_bytes());
    buf[32..40].copy_from_slice(&e.raw_len.to_le_bytes());
    buf[40..44].copy_from_slice(&e.checksum.to_le_bytes());
}

pub fn read_table_from_slice(buf: &[u8], count: u64) -> Result<Vec<BlockDescriptor>> {
    let need = count
        .checked_mul(ENTRY_SIZE as u64)
        .ok_or_else(|| ImgxError::format("block table size overflow"))?;
    if buf.len() as u64 != need {
        return Err(ImgxError::format(format!(
            "block table size mismatch: got {} bytes, expected {}",
            buf.len(),
            need
        )));
    }

    let mut out = Vec::with_capacity(count as usize);
    for e in buf.chunks_exact(ENTRY_SIZE) {
        // Layout: [0]=kind, [1]=codec, [2..4]=disk, [4..8]=pad, [8..16]=offset,
        // [16..24]=stored_len, [24..32]=target_off, [32..40]=raw_len, [40..44]=crc
        out.push(BlockDescriptor {
            kind: BlockKind::try_from(e[0])?,
            codec: CodecId::try_from(e[1])?,
            disk: le16(&e[2..4]),
            offset: le64(&e[8..16]),
            stored_len: le64(&e[16..24]),
            target_off: le64(&e[24..32]),
            raw_len: le64(&e[32..40]),
            checksum: le32(&e[40..44]),
        });
    }
    Ok(out)
}
