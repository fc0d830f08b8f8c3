use crate::codec::{CodecId, encode_block};
use crate::container::block::{BLOCK_HEADER_LEN, BlockHeader};
use crate::container::blocktab::{BlockDescriptor, BlockKind, MAX_BLOCK_RAW};
use crate::container::disk::DiskLayout;
use crate::container::header::{Header, VERSION};
use crate::container::prefix::{PREFIX_LEN, Prefix};
use crate::crypto::cipher::{BlockCipher, CipherId, IV_SEED_LEN};
use crate::crypto::kdf::{KdfParams, SALT_LEN, derive_key, random_bytes, verification_tag};
use crate::error::{ImgxError, Result};
use crate::hash::crc32;
use crate::partition::parse_disk_layout;
use crate::util::fileio::{read_exact_at, stream_len};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, info};

/// Data blocks compressed in parallel per batch.
const BATCH_BLOCKS: usize = 64;

/// One disk image to capture.
#[derive(Clone, Debug)]
pub struct DiskSource {
    pub image: PathBuf,
    /// Use this layout instead of parsing the image's partition table.
    pub layout: Option<DiskLayout>,
    /// Opaque JSON documents stored as file-metadata blocks for this disk.
    pub file_metadata: Vec<String>,
}

impl DiskSource {
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            layout: None,
            file_metadata: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackupOptions {
    /// `None` or empty writes an unencrypted container.
    pub password: Option<String>,
    pub kdf: KdfParams,
    /// Raw bytes per data block.
    pub block_size: u32,
    /// Zstd level; 0 disables compression.
    pub level: i32,
    /// Only accept compression if it saves at least this fraction.
    pub min_gain: f32,
    /// When true, zero the creation timestamp for reproducible output.
    pub deterministic: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            password: None,
            kdf: KdfParams::default(),
            block_size: 64 * 1024,
            level: 3,
            min_gain: 0.05,
            deterministic: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub disks: u32,
    pub blocks: u64,
    pub data_blocks: u64,
    pub raw_bytes: u64,
    pub stored_bytes: u64,
    pub container_len: u64,
}

/// Small Write adapter that counts bytes written
struct CountingWriter<W: Write> {
    inner: W,
    n: u64,
}
impl<W: Write> CountingWriter<W> {
    fn new(inner: W, start: u64) -> Self {
        Self { inner, n: start }
    }
}
impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let k = self.inner.write(buf)?;
        self.n += k as u64;
        Ok(k)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A payload that has been checksummed and compressed but not yet placed.
struct Packed {
    kind: BlockKind,
    disk: u16,
    target_off: u64,
    raw_len: u64,
    checksum: u32,
    codec: CodecId,
    stored: Vec<u8>,
}

fn pack_payload(
    kind: BlockKind,
    disk: u16,
    target_off: u64,
    raw: &[u8],
    opts: &BackupOptions,
) -> Result<Packed> {
    if raw.len() as u64 > MAX_BLOCK_RAW {
        return Err(ImgxError::format(format!(
            "{kind} payload of {} bytes exceeds the block limit",
            raw.len()
        )));
    }
    let checksum = crc32::checksum(raw);
    let (codec, stored) = encode_block(raw, opts.level, opts.min_gain)?;
    Ok(Packed {
        kind,
        disk,
        target_off,
        raw_len: raw.len() as u64,
        checksum,
        codec,
        stored,
    })
}

struct BlockSink<W: Write> {
    out: CountingWriter<W>,
    cipher: Option<BlockCipher>,
    table: Vec<BlockDescriptor>,
    summary: WriteSummary,
}

impl<W: Write> BlockSink<W> {
    /// Place one block at the current end of the container. The IV depends on
    /// the final offset, so encryption happens here rather than while packing.
    fn append(&mut self, mut p: Packed) -> Result<()> {
        let offset = self.out.n;
        if let Some(c) = &self.cipher {
            c.apply(p.kind, offset, &mut p.stored);
        }
        let desc = BlockDescriptor {
            kind: p.kind,
            codec: p.codec,
            disk: p.disk,
            offset,
            stored_len: p.stored.len() as u64,
            target_off: p.target_off,
            raw_len: p.raw_len,
            checksum: p.checksum,
        };
        BlockHeader::for_descriptor(&desc).write_to(&mut self.out)?;
        self.out.write_all(&p.stored)?;
        debug_assert_eq!(self.out.n, offset + BLOCK_HEADER_LEN + desc.stored_len);

        self.summary.blocks += 1;
        self.summary.raw_bytes += desc.raw_len;
        self.summary.stored_bytes += desc.stored_len;
        if desc.kind == BlockKind::Data {
            self.summary.data_blocks += 1;
        }
        self.table.push(desc);
        Ok(())
    }
}

/// Capture `disks` into a new container at `out`.
///
/// Per disk the container holds its disk-metadata block, then its
/// file-metadata blocks, then data blocks in ascending target offset. The
/// header goes last and the prefix is patched to point at it, so an
/// interrupted write never looks like a valid container; the output is
/// built in a temp file next to `out` and renamed into place at the end.
pub fn write_backup(disks: &[DiskSource], out: &Path, opts: &BackupOptions) -> Result<WriteSummary> {
    if disks.is_empty() {
        return Err(ImgxError::format("no disks to back up"));
    }
    if disks.len() > usize::from(u16::MAX) + 1 {
        return Err(ImgxError::format("too many disks for one container"));
    }
    if opts.block_size == 0 || u64::from(opts.block_size) > MAX_BLOCK_RAW {
        return Err(ImgxError::format(format!(
            "block size must be between 1 and {MAX_BLOCK_RAW}"
        )));
    }

    let password = opts.password.as_deref().unwrap_or("");
    let (cipher_id, salt, iv_seed, verify_tag, cipher) = if password.is_empty() {
        (CipherId::None, [0u8; SALT_LEN], [0u8; IV_SEED_LEN], [0u8; 32], None)
    } else {
        let salt = random_bytes::<SALT_LEN>()?;
        let seed = random_bytes::<IV_SEED_LEN>()?;
        let key = derive_key(password, &salt, opts.kdf)?;
        let tag = verification_tag(&key);
        (
            CipherId::XChaCha20,
            salt,
            seed,
            tag,
            Some(BlockCipher::new(key, seed)),
        )
    };

    let created = if opts.deterministic {
        0
    } else {
        OffsetDateTime::now_utc().unix_timestamp()
    };

    let dir = match out.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = NamedTempFile::new_in(dir)?;

    let mut sink = {
        // owned handle, so the sink does not borrow `tmp` across `persist`
        let mut w = BufWriter::new(tmp.as_file().try_clone()?);
        // placeholder; the real header offset is patched in at the end
        Prefix { header_off: 0 }.write_to(&mut w)?;
        BlockSink {
            out: CountingWriter::new(w, PREFIX_LEN),
            cipher,
            table: Vec::new(),
            summary: WriteSummary::default(),
        }
    };

    for (n, src) in disks.iter().enumerate() {
        write_disk(&mut sink, n as u16, src, opts)?;
    }

    let header_off = sink.out.n;
    let header = Header {
        version: VERSION,
        cipher: cipher_id,
        kdf: opts.kdf,
        salt,
        iv_seed,
        verify_tag,
        created,
        disk_count: disks.len() as u32,
        block_count: sink.table.len() as u64,
    };
    header.write_to(&mut sink.out, &sink.table)?;
    let container_len = sink.out.n;
    let mut summary = sink.summary;
    summary.disks = disks.len() as u32;
    summary.container_len = container_len;

    let mut f = sink.out.inner.into_inner().map_err(|e| e.into_error())?;
    f.seek(SeekFrom::Start(0))?;
    Prefix { header_off }.write_to(&mut f)?;
    f.sync_all()?;
    drop(f);

    tmp.persist(out).map_err(|e| e.error)?;
    info!(
        out = %out.display(),
        disks = summary.disks,
        blocks = summary.blocks,
        raw = summary.raw_bytes,
        stored = summary.stored_bytes,
        encrypted = cipher_id == CipherId::XChaCha20,
        "backup written"
    );
    Ok(summary)
}

fn write_disk<W: Write>(
    sink: &mut BlockSink<W>,
    disk: u16,
    src: &DiskSource,
    opts: &BackupOptions,
) -> Result<()> {
    let mut img = File::open(&src.image)?;
    let image_len = stream_len(&mut img)?;
    let mut layout = match &src.layout {
        Some(l) => l.clone(),
        None => parse_disk_layout(&mut img, disk)?,
    };
    layout.disk_number = disk;
    layout.validate()?;
    if let Some(p) = layout.partitions.iter().find(|p| p.end() > image_len) {
        return Err(ImgxError::format(format!(
            "{}: partition {} ends at {}, image is {image_len} bytes",
            src.image.display(),
            p.index,
            p.end()
        )));
    }
    info!(
        disk,
        image = %src.image.display(),
        table = ?layout.table,
        partitions = layout.partitions.len(),
        "capturing disk"
    );

    let meta = layout.to_cbor()?;
    sink.append(pack_payload(BlockKind::DiskMetadata, disk, 0, &meta, opts)?)?;
    for json in &src.file_metadata {
        sink.append(pack_payload(
            BlockKind::FileMetadata,
            disk,
            0,
            json.as_bytes(),
            opts,
        )?)?;
    }

    let mut extents: Vec<(u64, u64)> = layout
        .partitions
        .iter()
        .filter(|p| p.length > 0)
        .map(|p| (p.offset, p.end()))
        .collect();
    extents.sort_unstable();

    let mut ranges = block_ranges(extents, u64::from(opts.block_size));

    loop {
        let batch: Vec<(u64, u64)> = ranges.by_ref().take(BATCH_BLOCKS).collect();
        if batch.is_empty() {
            break;
        }
        let mut raws = Vec::with_capacity(batch.len());
        for &(off, len) in &batch {
            let mut buf = vec![0u8; len as usize];
            read_exact_at(&mut img, off, &mut buf)?;
            raws.push((off, buf));
        }
        let packed = raws
            .par_iter() // In parallel, each block independent
            .map(|(off, raw)| pack_payload(BlockKind::Data, disk, *off, raw, opts))
            .collect::<Result<Vec<_>>>()?;
        for p in packed {
            sink.append(p)?;
        }
        debug!(disk, blocks = batch.len(), "data batch written");
    }
    Ok(())
}

/// `(offset, len)` of every data block over sorted extents, generated on
/// demand so a large disk never materializes its whole range list.
fn block_ranges(extents: Vec<(u64, u64)>, bs: u64) -> impl Iterator<Item = (u64, u64)> {
    extents.into_iter().flat_map(move |(start, end)| {
        (start..end)
            .step_by(bs as usize)
            .map(move |off| (off, bs.min(end - off)))
    })
}
