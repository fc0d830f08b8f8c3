use super::{CodecId, Compressor};
use crate::error::Result;

/// Whole-block zstd frames. Blocks are small enough to live in memory, so
/// the bulk API is used instead of the streaming one.
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn id(&self) -> CodecId {
        CodecId::Zstd
    }

    fn compress(&self, raw: &[u8], level: i32) -> Result<Vec<u8>> {
        Ok(zstd::bulk::compress(raw, level.max(1))?)
    }

    fn decompress(&self, stored: &[u8], limit: usize) -> Result<Vec<u8>> {
        // fails instead of growing past `limit`
        Ok(zstd::bulk::decompress(stored, limit)?)
    }
}
