use std::io::Write;

use super::blocktab::{BlockDescriptor, BlockKind};
use crate::codec::CodecId;
use crate::error::{ImgxError, Result};
use crate::util::fileio::{le16, le32, le64};

pub const BLOCK_HEADER_LEN: u64 = 24;

/// Header stored in front of every block payload. It repeats the table
/// entry so a mis-pointed table is caught before any payload is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub kind: BlockKind,
    pub codec: CodecId,
    pub disk: u16,
    pub checksum: u32,
    pub stored_len: u64,
    pub raw_len: u64,
}

impl BlockHeader {
    pub fn for_descriptor(d: &BlockDescriptor) -> Self {
        Self {
            kind: d.kind,
            codec: d.codec,
            disk: d.disk,
            checksum: d.checksum,
            stored_len: d.stored_len,
            raw_len: d.raw_len,
        }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_LEN as usize] {
        let mut b = [0u8; BLOCK_HEADER_LEN as usize];
        b[0] = self.kind as u8;
        b[1] = self.codec as u8;
        b[2..4].copy_from_slice(&self.disk.to_le_bytes());
        b[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        b[8..16].copy_from_slice(&self.stored_len.to_le_bytes());
        b[16..24].copy_from_slice(&self.raw_len.to_le_bytes());
        b
    }

    pub fn write_to(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(&self.to_bytes())
    }

    pub fn parse(b: &[u8; BLOCK_HEADER_LEN as usize]) -> Result<Self> {
        Ok(Self {
            kind: BlockKind::try_from(b[0])?,
            codec: CodecId::try_from(b[1])?,
            disk: le16(&b[2..4]),
            checksum: le32(&b[4..8]),
            stored_len: le64(&b[8..16]),
            raw_len: le64(&b[16..24]),
        })
    }

    /// The on-disk header must agree with what the table says lives there.
    pub fn check_against(&self, d: &BlockDescriptor) -> Result<()> {
        if *self != Self::for_descriptor(d) {
            return Err(ImgxError::format(format!(
                "block header at offset {} does not match the block table",
                d.offset
            )));
        }
        Ok(())
    }
}
