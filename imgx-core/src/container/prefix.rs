use std::io::{Read, Seek, Write};

use crate::error::{ImgxError, Result};
use crate::util::fileio::{le64, read_exact_at, stream_len};

pub const MAGIC: &[u8; 8] = b"IMGXDSK\0";
/// magic + header offset
pub const PREFIX_LEN: u64 = 16;

/// Fixed-size start of every container: the magic and where the header lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    pub header_off: u64,
}

impl Prefix {
    pub fn write_to(&self, mut w: impl Write) -> std::io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_all(&self.header_off.to_le_bytes())?;
        Ok(())
    }
}

/// Read the prefix and return the header offset.
///
/// Fewer than `PREFIX_LEN` bytes is `Truncated`; a foreign magic is `Format`.
/// The offset must leave room for the header inside the file.
pub fn read_header_offset_and_magic<R: Read + Seek>(r: &mut R) -> Result<u64> {
    let file_len = stream_len(r)?;
    if file_len < PREFIX_LEN {
        return Err(ImgxError::Truncated {
            offset: 0,
            needed: PREFIX_LEN,
        });
    }
    let mut buf = [0u8; PREFIX_LEN as usize];
    read_exact_at(r, 0, &mut buf)?;
    if &buf[..8] != MAGIC {
        return Err(ImgxError::format("not an imgx container (bad magic)"));
    }
    let header_off = le64(&buf[8..16]);
    if header_off < PREFIX_LEN {
        // zero means the writer never finished
        return Err(ImgxError::format(format!(
            "header offset {header_off} points into the prefix"
        )));
    }
    if header_off >= file_len {
        return Err(ImgxError::Truncated {
            offset: header_off,
            needed: 1,
        });
    }
    Ok(header_off)
}
