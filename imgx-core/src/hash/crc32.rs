//! CRC32 (reflected polynomial 0xEDB88320) over block payloads and headers.
//!
//! The lookup tables live inside `crc32fast` as process-wide constants; nothing
//! here holds mutable global state.

use crate::container::blocktab::BlockKind;
use crate::error::{ImgxError, Result};

/// Checksum of one contiguous byte range.
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Incremental form, for checksums spanning several buffers.
#[derive(Clone, Default)]
pub struct Crc32 {
    inner: crc32fast::Hasher,
}

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finalize(self) -> u32 {
        self.inner.finalize()
    }
}

/// Compare `bytes` against a stored checksum. A mismatch is an
/// `Integrity` error naming the block, never a panic.
pub fn verify(expected: u32, bytes: &[u8], kind: BlockKind, offset: u64) -> Result<()> {
    if checksum(bytes) != expected {
        return Err(ImgxError::Integrity { kind, offset });
    }
    Ok(())
}
