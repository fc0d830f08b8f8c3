use blake3::Hasher;
use chacha20::{
    Key, XChaCha20, XNonce,
    cipher::{KeyIvInit, StreamCipher},
};

use super::kdf::ContainerKey;
use crate::container::blocktab::BlockKind;
use crate::error::{ImgxError, Result};

/// XChaCha20 requires a 24-byte nonce.
pub const IV_LEN: usize = 24;
pub const IV_SEED_LEN: usize = 32;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CipherId {
    None = 0,
    XChaCha20 = 1,
}

impl TryFrom<u8> for CipherId {
    type Error = ImgxError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(CipherId::None),
            1 => Ok(CipherId::XChaCha20),
            other => Err(ImgxError::format(format!("unknown cipher id {other}"))),
        }
    }
}

/// IV for one block: blake3("imgx-iv" || seed || kind || offset).take(24).
///
/// A pure function of data stored in the container, so any block can be
/// decrypted without touching the blocks before it.
pub fn iv_for(seed: &[u8; IV_SEED_LEN], kind: BlockKind, offset: u64) -> [u8; IV_LEN] {
    let mut h = Hasher::new();
    h.update(b"imgx-iv");
    h.update(seed);
    h.update(&[kind as u8]);
    h.update(&offset.to_le_bytes());
    let out = h.finalize();
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&out.as_bytes()[..IV_LEN]);
    iv
}

/// Key plus IV seed: everything needed to encrypt or decrypt a block.
/// Immutable once built, so restore tasks share it freely.
#[derive(Clone, Debug)]
pub struct BlockCipher {
    key: ContainerKey,
    seed: [u8; IV_SEED_LEN],
}

impl BlockCipher {
    pub fn new(key: ContainerKey, seed: [u8; IV_SEED_LEN]) -> Self {
        Self { key, seed }
    }

    /// Encrypt or decrypt in place; the stream cipher is its own inverse
    /// and never changes the length.
    pub fn apply(&self, kind: BlockKind, offset: u64, buf: &mut [u8]) {
        let iv = iv_for(&self.seed, kind, offset);
        let mut c = XChaCha20::new(Key::from_slice(&self.key.0), XNonce::from_slice(&iv));
        c.apply_keystream(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(byte: u8) -> BlockCipher {
        BlockCipher::new(ContainerKey([byte; 32]), [9u8; IV_SEED_LEN])
    }

    #[test]
    fn iv_depends_on_offset_and_kind() {
        let seed = [3u8; IV_SEED_LEN];
        let a = iv_for(&seed, BlockKind::Data, 16);
        assert_eq!(a, iv_for(&seed, BlockKind::Data, 16));
        assert_ne!(a, iv_for(&seed, BlockKind::Data, 17));
        assert_ne!(a, iv_for(&seed, BlockKind::DiskMetadata, 16));
        assert_ne!(a, iv_for(&[4u8; IV_SEED_LEN], BlockKind::Data, 16));
    }

    #[test]
    fn round_trip_preserves_length() {
        let c = cipher(1);
        let plain = vec![0x5Au8; 1000];
        let mut buf = plain.clone();
        c.apply(BlockKind::Data, 4096, &mut buf);
        assert_eq!(buf.len(), plain.len());
        assert_ne!(buf, plain);
        c.apply(BlockKind::Data, 4096, &mut buf);
        assert_eq!(buf, plain);
    }

    #[test]
    fn identical_blocks_encrypt_differently() {
        let c = cipher(1);
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        c.apply(BlockKind::Data, 100, &mut a);
        c.apply(BlockKind::Data, 200, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_yields_garbage() {
        let plain = b"partition table".to_vec();
        let mut buf = plain.clone();
        cipher(1).apply(BlockKind::DiskMetadata, 16, &mut buf);
        cipher(2).apply(BlockKind::DiskMetadata, 16, &mut buf);
        assert_ne!(buf, plain);
    }

    #[test]
    fn cipher_ids() {
        assert_eq!(CipherId::try_from(1).unwrap(), CipherId::XChaCha20);
        assert!(CipherId::try_from(9).is_err());
    }
}
