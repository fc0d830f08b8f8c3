use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::metadata::{read_all_file_metadata, read_disk_metadata};
use crate::container::blocktab::{BlockDescriptor, BlockKind, MAX_BLOCK_RAW};
use crate::container::disk::DiskLayout;
use crate::container::header::Header;
use crate::container::prefix::{MAGIC, PREFIX_LEN, read_header_offset_and_magic};
use crate::codec::CodecId;
use crate::crypto::cipher::{BlockCipher, CipherId};
use crate::crypto::kdf::{check_password, derive_key};
use crate::error::{ImgxError, Result};
use crate::util::fileio::stream_len;

/// One decoded file-metadata block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub disk: u16,
    /// Index into `FileLayout::blocks`.
    pub block: usize,
    /// Opaque structured text (JSON as captured).
    pub json: String,
}

/// Everything decoded from the metadata blocks, built when the caller asks
/// for the full index.
#[derive(Debug, Clone, Default)]
pub struct MetadataIndex {
    pub disks: Vec<DiskLayout>,
    pub files: Vec<FileMetadata>,
}

/// Parsed container geometry. Built once by `read_backup_file` and never
/// mutated afterwards; restore tasks share it by reference.
#[derive(Debug, Clone)]
pub struct FileLayout {
    pub path: PathBuf,
    pub magic: [u8; 8],
    pub header_off: u64,
    pub container_len: u64,
    pub header: Header,
    /// The block table in container order. Everything else refers to
    /// blocks by index into this vector.
    pub blocks: Vec<BlockDescriptor>,
    pub cipher: Option<BlockCipher>,
    pub index: Option<MetadataIndex>,
}

impl FileLayout {
    pub fn version(&self) -> u16 {
        self.header.version
    }

    pub fn disk_count(&self) -> u32 {
        self.header.disk_count
    }

    pub fn encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn blocks_of(&self, disk: u16, kind: BlockKind) -> impl Iterator<Item = usize> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(move |(_, b)| b.disk == disk && b.kind == kind)
            .map(|(i, _)| i)
    }

    pub fn disk_metadata_block(&self, disk: u16) -> Result<usize> {
        if u32::from(disk) >= self.disk_count() {
            return Err(ImgxError::format(format!(
                "disk {disk} requested, container holds {}",
                self.disk_count()
            )));
        }
        self.blocks_of(disk, BlockKind::DiskMetadata)
            .next()
            .ok_or_else(|| ImgxError::format(format!("disk {disk} has no disk-metadata block")))
    }

    /// Data blocks of one disk in ascending target offset.
    pub fn data_blocks(&self, disk: u16) -> Vec<usize> {
        let mut v: Vec<usize> = self.blocks_of(disk, BlockKind::Data).collect();
        v.sort_by_key(|&i| self.blocks[i].target_off);
        v
    }

    /// Raw bytes a restore of `disk` will write (data blocks only).
    pub fn data_bytes(&self, disk: u16) -> u64 {
        self.blocks_of(disk, BlockKind::Data)
            .map(|i| self.blocks[i].raw_len)
            .sum()
    }
}

/// Open a container, validate it, and check the password.
///
/// With `load_index` the metadata blocks are also decoded into
/// `FileLayout::index`; without it only the block table is available, which
/// is enough to seek to any disk-metadata or data block. Nothing partial is
/// ever returned.
pub fn read_backup_file(path: &Path, password: &str, load_index: bool) -> Result<FileLayout> {
    let mut f = File::open(path)?;
    read_backup_from(&mut f, path, password, load_index)
}

pub fn read_backup_from<R: Read + Seek>(
    r: &mut R,
    path: &Path,
    password: &str,
    load_index: bool,
) -> Result<FileLayout> {
    let container_len = stream_len(r)?;
    let header_off = read_header_offset_and_magic(r)?;
    let (header, blocks) = Header::read_at(r, header_off, container_len)?;
    check_blocks(&header, &blocks, header_off)?;

    let cipher = match header.cipher {
        CipherId::None => {
            if !password.is_empty() {
                warn!(path = %path.display(), "container is not encrypted; ignoring password");
            }
            None
        }
        CipherId::XChaCha20 => {
            if password.is_empty() {
                return Err(ImgxError::Authentication);
            }
            let key = derive_key(password, &header.salt, header.kdf)?;
            check_password(&key, &header.verify_tag)?;
            Some(BlockCipher::new(key, header.iv_seed))
        }
    };

    let mut layout = FileLayout {
        path: path.to_path_buf(),
        magic: *MAGIC,
        header_off,
        container_len,
        header,
        blocks,
        cipher,
        index: None,
    };

    if load_index {
        let mut idx = MetadataIndex::default();
        for disk in 0..layout.disk_count() {
            let disk = disk as u16;
            idx.disks.push(read_disk_metadata(&layout, r, disk)?);
            idx.files.extend(read_all_file_metadata(&layout, r, disk)?);
        }
        debug!(
            disks = idx.disks.len(),
            files = idx.files.len(),
            "metadata index loaded"
        );
        layout.index = Some(idx);
    }

    info!(
        path = %path.display(),
        disks = layout.disk_count(),
        blocks = layout.blocks.len(),
        encrypted = layout.encrypted(),
        "container opened"
    );
    Ok(layout)
}

fn check_blocks(header: &Header, blocks: &[BlockDescriptor], header_off: u64) -> Result<()> {
    let disk_count = header.disk_count;
    if disk_count > u32::from(u16::MAX) + 1 {
        return Err(ImgxError::format(format!("implausible disk count {disk_count}")));
    }
    let mut meta_seen = vec![0u32; disk_count as usize];
    let mut prev_end = PREFIX_LEN;

    for (i, b) in blocks.iter().enumerate() {
        if b.offset < prev_end || b.end() > header_off {
            return Err(ImgxError::format(format!(
                "block {i} at offset {} overlaps another structure",
                b.offset
            )));
        }
        prev_end = b.end();
        if u32::from(b.disk) >= disk_count {
            return Err(ImgxError::format(format!(
                "block {i} refers to disk {} of {disk_count}",
                b.disk
            )));
        }
        if b.raw_len > MAX_BLOCK_RAW {
            return Err(ImgxError::format(format!(
                "block {i} declares {} raw bytes, limit is {MAX_BLOCK_RAW}",
                b.raw_len
            )));
        }
        if b.codec == CodecId::Store && b.stored_len != b.raw_len {
            return Err(ImgxError::format(format!(
                "stored block {i} has mismatched lengths"
            )));
        }
        if b.kind == BlockKind::DiskMetadata {
            meta_seen[b.disk as usize] += 1;
        }
    }
    if let Some(d) = meta_seen.iter().position(|&n| n != 1) {
        return Err(ImgxError::format(format!(
            "disk {d} needs exactly one disk-metadata block, found {}",
            meta_seen[d]
        )));
    }
    Ok(())
}
