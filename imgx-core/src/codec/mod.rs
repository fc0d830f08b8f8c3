use crate::container::blocktab::MAX_BLOCK_RAW;
use crate::error::{ImgxError, Result};

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodecId {
    Store = 0,
    Zstd = 1,
}

impl TryFrom<u8> for CodecId {
    type Error = ImgxError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(CodecId::Store),
            1 => Ok(CodecId::Zstd),
            other => Err(ImgxError::format(format!("unknown codec id {other}"))),
        }
    }
}

pub trait Compressor: Send + Sync {
    fn id(&self) -> CodecId;
    fn compress(&self, raw: &[u8], level: i32) -> Result<Vec<u8>>;
    /// Expand `stored`, failing rather than producing more than `limit` bytes.
    fn decompress(&self, stored: &[u8], limit: usize) -> Result<Vec<u8>>;
}

pub mod store;
pub mod zstdc;

pub fn compressor(id: CodecId) -> &'static dyn Compressor {
    match id {
        CodecId::Store => &store::Store,
        CodecId::Zstd => &zstdc::ZstdCompressor,
    }
}

/// Pick the codec for one block payload.
///
/// Zstd is kept only if it saves at least `min_gain` (fraction of the raw
/// size); otherwise the payload is stored as-is.
pub fn encode_block(raw: &[u8], level: i32, min_gain: f32) -> Result<(CodecId, Vec<u8>)> {
    if level <= 0 || raw.is_empty() {
        return Ok((CodecId::Store, raw.to_vec()));
    }
    let packed = compressor(CodecId::Zstd).compress(raw, level)?;
    if should_compress(raw.len(), packed.len(), min_gain) {
        Ok((CodecId::Zstd, packed))
    } else {
        Ok((CodecId::Store, raw.to_vec()))
    }
}

/// Undo `encode_block`. Returns the raw payload, which must be exactly
/// `raw_len` bytes long.
pub fn decode_block(codec: CodecId, stored: Vec<u8>, raw_len: u64) -> Result<Vec<u8>> {
    if raw_len > MAX_BLOCK_RAW {
        return Err(ImgxError::format(format!(
            "raw length {raw_len} exceeds the block limit"
        )));
    }
    let limit = usize::try_from(raw_len)
        .map_err(|_| ImgxError::format(format!("raw length {raw_len} does not fit in memory")))?;
    if codec == CodecId::Store {
        if stored.len() != limit {
            return Err(ImgxError::format(format!(
                "stored {} bytes, expected {raw_len}",
                stored.len()
            )));
        }
        return Ok(stored);
    }
    let out = compressor(codec).decompress(&stored, limit)?;
    if out.len() != limit {
        return Err(ImgxError::format(format!(
            "decompressed {} bytes, expected {raw_len}",
            out.len()
        )));
    }
    Ok(out)
}

fn should_compress(u: usize, c: usize, min_gain: f32) -> bool {
    // true if (u - c) >= u * min_gain  ⇔  c <= u * (1 - min_gain)
    (u as f64 - c as f64) >= (u as f64 * min_gain as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_block_uses_zstd() {
        let raw = vec![0u8; 65536];
        let (codec, stored) = encode_block(&raw, 3, 0.05).unwrap();
        assert_eq!(codec, CodecId::Zstd);
        assert!(stored.len() < raw.len());
        assert_eq!(decode_block(codec, stored, raw.len() as u64).unwrap(), raw);
    }

    #[test]
    fn incompressible_block_is_stored() {
        // xorshift noise does not compress
        let mut x = 0x9E37_79B9_7F4A_7C15u64;
        let raw: Vec<u8> = (0..4096)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x as u8
            })
            .collect();
        let (codec, stored) = encode_block(&raw, 3, 0.05).unwrap();
        assert_eq!(codec, CodecId::Store);
        assert_eq!(stored, raw);
    }

    #[test]
    fn level_zero_disables_compression() {
        let (codec, _) = encode_block(&[0u8; 1024], 0, 0.05).unwrap();
        assert_eq!(codec, CodecId::Store);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let (codec, stored) = encode_block(&[1u8; 8192], 3, 0.05).unwrap();
        assert!(decode_block(codec, stored.clone(), 4096).is_err());
        assert!(decode_block(codec, stored, 9000).is_err());
    }

    #[test]
    fn registry_matches_ids() {
        for id in [CodecId::Store, CodecId::Zstd] {
            assert_eq!(compressor(id).id(), id);
            assert_eq!(CodecId::try_from(id as u8).unwrap(), id);
        }
        assert!(CodecId::try_from(7).is_err());
        assert!(compressor(CodecId::Store).decompress(&[1, 2, 3], 2).is_err());
    }

    #[test]
    fn oversized_raw_len_is_refused_before_allocating() {
        let (codec, stored) = encode_block(&[0u8; 4096], 3, 0.05).unwrap();
        assert!(matches!(
            decode_block(codec, stored, 1 << 46),
            Err(ImgxError::Format(_))
        ));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(decode_block(CodecId::Zstd, vec![0xAB; 300], 1024).is_err());
    }
}
