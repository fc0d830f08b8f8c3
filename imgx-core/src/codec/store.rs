use super::{CodecId, Compressor};
use crate::error::{ImgxError, Result};

/// Payload kept verbatim.
pub struct Store;

impl Compressor for Store {
    fn id(&self) -> CodecId {
        CodecId::Store
    }

    fn compress(&self, raw: &[u8], _level: i32) -> Result<Vec<u8>> {
        Ok(raw.to_vec())
    }

    fn decompress(&self, stored: &[u8], limit: usize) -> Result<Vec<u8>> {
        if stored.len() > limit {
            return Err(ImgxError::format(format!(
                "stored payload of {} bytes exceeds {limit}",
                stored.len()
            )));
        }
        Ok(stored.to_vec())
    }
}
