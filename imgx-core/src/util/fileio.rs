//! Positioned read/write helpers shared by the container reader, the writer
//! and the restore engine. Every helper fails fast: a short read is a
//! `Truncated` error, never a partially filled buffer.

use crate::error::{ImgxError, Result};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

/// Fill `buf` from absolute offset `off`.
pub fn read_exact_at<R: Read + Seek + ?Sized>(r: &mut R, off: u64, buf: &mut [u8]) -> Result<()> {
    r.seek(SeekFrom::Start(off))?;
    r.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => ImgxError::Truncated {
            offset: off,
            needed: buf.len() as u64,
        },
        _ => ImgxError::Io(e),
    })
}

/// Read `len` bytes at `off` into a fresh buffer.
pub fn read_vec_at<R: Read + Seek + ?Sized>(r: &mut R, off: u64, len: u64) -> Result<Vec<u8>> {
    let len = usize::try_from(len)
        .map_err(|_| ImgxError::format(format!("length {len} does not fit in memory")))?;
    let mut buf = vec![0u8; len];
    read_exact_at(r, off, &mut buf)?;
    Ok(buf)
}

/// Write all of `buf` at absolute offset `off`.
pub fn write_all_at<W: Write + Seek + ?Sized>(w: &mut W, off: u64, buf: &[u8]) -> Result<()> {
    w.seek(SeekFrom::Start(off))?;
    w.write_all(buf)?;
    Ok(())
}

/// Size of a file or block device. Seeking to the end works for both, where
/// `metadata().len()` reports 0 for devices.
pub fn stream_len<S: Seek + ?Sized>(s: &mut S) -> Result<u64> {
    let pos = s.stream_position()?;
    let len = s.seek(SeekFrom::End(0))?;
    s.seek(SeekFrom::Start(pos))?;
    Ok(len)
}

#[inline]
pub(crate) fn le16(x: &[u8]) -> u16 {
    u16::from_le_bytes([x[0], x[1]])
}

#[inline]
pub(crate) fn le32(x: &[u8]) -> u32 {
    u32::from_le_bytes([x[0], x[1], x[2], x[3]])
}

#[inline]
pub(crate) fn le64(x: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&x[..8]);
    u64::from_le_bytes(b)
}
