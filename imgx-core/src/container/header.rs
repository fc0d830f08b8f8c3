use std::io::{Read, Seek, Write};

use super::blocktab::{BlockDescriptor, ENTRY_SIZE, read_table_from_slice, write_table};
use crate::crypto::cipher::{CipherId, IV_SEED_LEN};
use crate::crypto::kdf::{KdfParams, SALT_LEN};
use crate::error::{ImgxError, Result};
use crate::hash::crc32::Crc32;
use crate::util::fileio::{le16, le32, le64, read_exact_at, read_vec_at};

pub const HEADER_MAGIC: &[u8; 8] = b"IMGXHDR\0";
pub const VERSION: u16 = 1;
/// Fixed part of the header; the block table follows it.
pub const HEADER_FIXED_LEN: u64 = 148;
const CRC_AT: usize = 140;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub cipher: CipherId,
    pub kdf: KdfParams,
    pub salt: [u8; SALT_LEN],
    pub iv_seed: [u8; IV_SEED_LEN],
    /// Zero for unencrypted containers.
    pub verify_tag: [u8; 32],
    /// Unix seconds; 0 in deterministic mode.
    pub created: i64,
    pub disk_count: u32,
    pub block_count: u64,
}

impl Header {
    fn encode_fixed(&self) -> [u8; HEADER_FIXED_LEN as usize] {
        let mut b = [0u8; HEADER_FIXED_LEN as usize];
        b[0..8].copy_from_slice(HEADER_MAGIC);
        b[8..10].copy_from_slice(&self.version.to_le_bytes());
        b[10] = self.cipher as u8;
        // b[11]: flags, reserved
        b[12..16].copy_from_slice(&self.kdf.m_cost.to_le_bytes());
        b[16..20].copy_from_slice(&self.kdf.t_cost.to_le_bytes());
        b[20..24].copy_from_slice(&self.kdf.p_cost.to_le_bytes());
        b[24..56].copy_from_slice(&self.salt);
        b[56..88].copy_from_slice(&self.iv_seed);
        b[88..120].copy_from_slice(&self.verify_tag);
        b[120..128].copy_from_slice(&self.created.to_le_bytes());
        b[128..132].copy_from_slice(&self.disk_count.to_le_bytes());
        b[132..140].copy_from_slice(&self.block_count.to_le_bytes());
        b
    }

    /// Write the fixed header, then the block table, sealing both with one CRC.
    pub fn write_to(&self, mut w: impl Write, table: &[BlockDescriptor]) -> Result<()> {
        if table.len() as u64 != self.block_count {
            return Err(ImgxError::format("block count does not match table"));
        }
        let mut fixed = self.encode_fixed();
        let mut tab = Vec::with_capacity(table.len() * ENTRY_SIZE);
        write_table(&mut tab, table)?;

        let mut crc = Crc32::new();
        crc.update(&fixed[..CRC_AT]);
        crc.update(&tab);
        fixed[CRC_AT..CRC_AT + 4].copy_from_slice(&crc.finalize().to_le_bytes());

        w.write_all(&fixed)?;
        w.write_all(&tab)?;
        Ok(())
    }

    /// Parse the header and block table at `header_off`. The header is the
    /// last structure in a container, so it must end exactly at `file_len`.
    pub fn read_at<R: Read + Seek>(
        r: &mut R,
        header_off: u64,
        file_len: u64,
    ) -> Result<(Header, Vec<BlockDescriptor>)> {
        let fixed_end = header_off.saturating_add(HEADER_FIXED_LEN);
        if fixed_end > file_len {
            return Err(ImgxError::Truncated {
                offset: header_off,
                needed: HEADER_FIXED_LEN,
            });
        }
        let mut b = [0u8; HEADER_FIXED_LEN as usize];
        read_exact_at(r, header_off, &mut b)?;

        if &b[0..8] != HEADER_MAGIC {
            return Err(ImgxError::format("bad header magic"));
        }
        let version = le16(&b[8..10]);
        if version != VERSION {
            return Err(ImgxError::format(format!(
                "unsupported container version {version}"
            )));
        }
        let cipher = CipherId::try_from(b[10])?;
        let kdf = KdfParams {
            m_cost: le32(&b[12..16]),
            t_cost: le32(&b[16..20]),
            p_cost: le32(&b[20..24]),
        };
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&b[24..56]);
        let mut iv_seed = [0u8; IV_SEED_LEN];
        iv_seed.copy_from_slice(&b[56..88]);
        let mut verify_tag = [0u8; 32];
        verify_tag.copy_from_slice(&b[88..120]);
        let created = le64(&b[120..128]) as i64;
        let disk_count = le32(&b[128..132]);
        let block_count = le64(&b[132..140]);
        let stored_crc = le32(&b[CRC_AT..CRC_AT + 4]);

        let table_len = block_count
            .checked_mul(ENTRY_SIZE as u64)
            .ok_or_else(|| ImgxError::format("block table size overflow"))?;
        let table_end = fixed_end
            .checked_add(table_len)
            .ok_or_else(|| ImgxError::format("block table size overflow"))?;
        if table_end > file_len {
            return Err(ImgxError::Truncated {
                offset: fixed_end,
                needed: table_len,
            });
        }
        if table_end < file_len {
            return Err(ImgxError::format(format!(
                "{} trailing bytes after the block table",
                file_len - table_end
            )));
        }
        let tab = read_vec_at(r, fixed_end, table_len)?;

        let mut crc = Crc32::new();
        crc.update(&b[..CRC_AT]);
        crc.update(&tab);
        if crc.finalize() != stored_crc {
            return Err(ImgxError::format("header checksum mismatch"));
        }

        let table = read_table_from_slice(&tab, block_count)?;
        Ok((
            Header {
                version,
                cipher,
                kdf,
                salt,
                iv_seed,
                verify_tag,
                created,
                disk_count,
                block_count,
            },
            table,
        ))
    }
}
