use std::io::{Read, Seek};

use super::reader::{FileLayout, FileMetadata};
use crate::codec::decode_block;
use crate::container::block::{BLOCK_HEADER_LEN, BlockHeader};
use crate::container::blocktab::BlockKind;
use crate::container::disk::DiskLayout;
use crate::error::{ImgxError, Result};
use crate::hash::crc32;
use crate::util::fileio::{read_exact_at, read_vec_at};

/// Read the on-disk header of block `idx` and check it against the table.
pub fn read_block<R: Read + Seek + ?Sized>(
    layout: &FileLayout,
    idx: usize,
    r: &mut R,
) -> Result<BlockHeader> {
    let desc = layout
        .blocks
        .get(idx)
        .ok_or_else(|| ImgxError::format(format!("no block {idx}")))?;
    let mut b = [0u8; BLOCK_HEADER_LEN as usize];
    read_exact_at(r, desc.offset, &mut b)?;
    let hdr = BlockHeader::parse(&b)?;
    hdr.check_against(desc)?;
    Ok(hdr)
}

/// Read block `idx` and return its raw payload: decrypt, decompress, then
/// check the CRC. Any failure past the header read is an integrity error
/// naming this block.
pub fn read_block_payload<R: Read + Seek + ?Sized>(
    layout: &FileLayout,
    idx: usize,
    r: &mut R,
) -> Result<Vec<u8>> {
    let hdr = read_block(layout, idx, r)?;
    let desc = &layout.blocks[idx];
    let mut stored = read_vec_at(r, desc.offset + BLOCK_HEADER_LEN, hdr.stored_len)?;
    if let Some(cipher) = &layout.cipher {
        cipher.apply(desc.kind, desc.offset, &mut stored);
    }
    let raw = decode_block(hdr.codec, stored, hdr.raw_len).map_err(|_| ImgxError::Integrity {
        kind: desc.kind,
        offset: desc.offset,
    })?;
    crc32::verify(hdr.checksum, &raw, desc.kind, desc.offset)?;
    Ok(raw)
}

/// Decode the disk-metadata block of `disk`.
pub fn read_disk_metadata<R: Read + Seek + ?Sized>(
    layout: &FileLayout,
    r: &mut R,
    disk: u16,
) -> Result<DiskLayout> {
    let idx = layout.disk_metadata_block(disk)?;
    let raw = read_block_payload(layout, idx, r)?;
    let dl = DiskLayout::from_cbor(&raw)?;
    if dl.disk_number != disk {
        return Err(ImgxError::format(format!(
            "metadata for disk {disk} describes disk {}",
            dl.disk_number
        )));
    }
    dl.validate()?;
    Ok(dl)
}

/// First file-metadata payload of `disk`, if it has any.
pub fn read_file_metadata_data<R: Read + Seek + ?Sized>(
    layout: &FileLayout,
    r: &mut R,
    disk: u16,
) -> Result<Option<String>> {
    match layout.blocks_of(disk, BlockKind::FileMetadata).next() {
        Some(idx) => Ok(Some(file_metadata_text(layout, idx, r)?)),
        None => Ok(None),
    }
}

pub fn read_all_file_metadata<R: Read + Seek + ?Sized>(
    layout: &FileLayout,
    r: &mut R,
    disk: u16,
) -> Result<Vec<FileMetadata>> {
    let idxs: Vec<usize> = layout.blocks_of(disk, BlockKind::FileMetadata).collect();
    idxs.into_iter()
        .map(|idx| {
            Ok(FileMetadata {
                disk,
                block: idx,
                json: file_metadata_text(layout, idx, r)?,
            })
        })
        .collect()
}

fn file_metadata_text<R: Read + Seek + ?Sized>(
    layout: &FileLayout,
    idx: usize,
    r: &mut R,
) -> Result<String> {
    let raw = read_block_payload(layout, idx, r)?;
    String::from_utf8(raw).map_err(|_| {
        ImgxError::format(format!(
            "file metadata at offset {} is not UTF-8",
            layout.blocks[idx].offset
        ))
    })
}
