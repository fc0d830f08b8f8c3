//! Restore state machine: Init -> PartitionPrep -> BlockStream -> Finalize,
//! ending in Completed, Failed or Cancelled.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use thiserror::Error;
use tracing::{info, warn};

use super::pipeline::stream_blocks;
use super::progress::{CancelToken, Progress};
use crate::container::disk::{DiskId, DiskLayout};
use crate::error::{ImgxError, Result};
use crate::partition::{fresh_disk_id, stamp_disk_id};
use crate::read::metadata::read_disk_metadata;
use crate::read::reader::{FileLayout, read_backup_file};
use crate::util::fileio::{stream_len, write_all_at};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Init,
    PartitionPrep,
    BlockStream,
    Finalize,
    Completed,
    Failed,
    Cancelled,
}

impl RestoreState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RestoreState::Completed | RestoreState::Failed | RestoreState::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub disk_number: u16,
    /// Existing disk or image file at least as large as the source disk.
    pub target: PathBuf,
    /// Keep the source disk identifier instead of generating a fresh one.
    pub keep_disk_id: bool,
    pub cancel: Option<CancelToken>,
    /// 1 streams sequentially; 2 or more overlaps decrypt/verify of the next
    /// blocks with the current write.
    pub pipeline_depth: usize,
}

impl Default for RestoreRequest {
    fn default() -> Self {
        Self {
            disk_number: 0,
            target: PathBuf::new(),
            keep_disk_id: false,
            cancel: None,
            pipeline_depth: 2,
        }
    }
}

impl RestoreRequest {
    pub fn new(disk_number: u16, target: impl Into<PathBuf>) -> Self {
        Self {
            disk_number,
            target: target.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub disk_number: u16,
    /// Layout as staged on the target, including the identifier written.
    pub layout: DiskLayout,
    pub blocks_written: u64,
    pub bytes_written: u64,
}

/// A restore that ended in Failed or Cancelled.
#[derive(Error, Debug)]
#[error("restore of disk {disk_number} {state:?} during {during:?}: {error}")]
pub struct RestoreFailure {
    pub disk_number: u16,
    /// Failed or Cancelled.
    pub state: RestoreState,
    /// The step that was running when the restore stopped.
    pub during: RestoreState,
    #[source]
    pub error: ImgxError,
    /// End offset on the target of the last data block fully written. Every
    /// byte before it that belongs to a data block is correct.
    pub resume_offset: Option<u64>,
}

impl RestoreFailure {
    fn new(
        disk_number: u16,
        during: RestoreState,
        error: ImgxError,
        resume_offset: Option<u64>,
    ) -> Self {
        let state = match error {
            ImgxError::Cancelled => RestoreState::Cancelled,
            _ => RestoreState::Failed,
        };
        match state {
            RestoreState::Cancelled => {
                info!(disk = disk_number, ?during, ?resume_offset, "restore cancelled")
            }
            _ => warn!(disk = disk_number, ?during, ?resume_offset, %error, "restore failed"),
        }
        Self {
            disk_number,
            state,
            during,
            error,
            resume_offset,
        }
    }
}

/// Open the container at `file_path` and restore one disk to `target`.
pub fn restore_disk(
    file_path: &Path,
    password: &str,
    target: &Path,
    disk_number: u16,
    keep_disk_id: bool,
    progress: Option<&mut dyn FnMut(Progress)>,
) -> std::result::Result<RestoreReport, RestoreFailure> {
    let req = RestoreRequest {
        keep_disk_id,
        ..RestoreRequest::new(disk_number, target)
    };
    restore_request(file_path, password, &req, progress)
}

pub fn restore_request(
    file_path: &Path,
    password: &str,
    req: &RestoreRequest,
    progress: Option<&mut dyn FnMut(Progress)>,
) -> std::result::Result<RestoreReport, RestoreFailure> {
    let layout = read_backup_file(file_path, password, false)
        .map_err(|e| RestoreFailure::new(req.disk_number, RestoreState::Init, e, None))?;
    restore_from_layout(&layout, req, progress)
}

struct Prepared {
    disk: DiskLayout,
    blocks: Vec<usize>,
    target: File,
}

/// Everything that can be checked is checked here, before the first write.
fn prepare(layout: &FileLayout, req: &RestoreRequest) -> Result<Prepared> {
    let mut src = File::open(&layout.path)?;
    let disk = read_disk_metadata(layout, &mut src, req.disk_number)?;
    let blocks = layout.data_blocks(req.disk_number);
    check_extents(layout, &disk, &blocks)?;

    let mut target = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&req.target)?;
    let available = stream_len(&mut target)?;
    if available < disk.size {
        return Err(ImgxError::Capacity {
            required: disk.size,
            available,
        });
    }
    Ok(Prepared {
        disk,
        blocks,
        target,
    })
}

/// Data blocks must land after the boot area, inside the disk, without
/// overlapping each other. `blocks` is in ascending target order.
fn check_extents(layout: &FileLayout, disk: &DiskLayout, blocks: &[usize]) -> Result<()> {
    let mut prev_end = disk.track0.len() as u64;
    for &i in blocks {
        let b = &layout.blocks[i];
        let end = b.target_off.checked_add(b.raw_len);
        match end {
            Some(end) if b.target_off >= prev_end && end <= disk.size => prev_end = end,
            _ => {
                return Err(ImgxError::format(format!(
                    "data block {i} targets [{}, +{}) outside the free area of disk {} ({} bytes)",
                    b.target_off, b.raw_len, disk.disk_number, disk.size
                )));
            }
        }
    }
    Ok(())
}

/// Give the staged layout its final identifier and write the boot area.
fn stage_partitions(staged: &mut DiskLayout, keep_disk_id: bool, target: &mut File) -> Result<()> {
    if staged.track0.is_empty() {
        return Ok(());
    }
    if !keep_disk_id && staged.disk_id != DiskId::None {
        let id = fresh_disk_id(staged.disk_id)?;
        stamp_disk_id(&mut staged.track0, id, staged.sector_size)?;
        info!(disk = staged.disk_number, old = %staged.disk_id, new = %id, "new disk identifier");
        staged.disk_id = id;
    }
    write_all_at(target, 0, &staged.track0)?;
    target.sync_data()?;
    Ok(())
}

/// Run one restore against an already opened container.
///
/// `layout` is only read, so several disks of one container may be restored
/// concurrently from the same layout; each call opens its own handles.
pub fn restore_from_layout(
    layout: &FileLayout,
    req: &RestoreRequest,
    progress: Option<&mut dyn FnMut(Progress)>,
) -> std::result::Result<RestoreReport, RestoreFailure> {
    let disk_number = req.disk_number;
    let fail = |during, e, resume| RestoreFailure::new(disk_number, during, e, resume);

    info!(disk = disk_number, target = %req.target.display(), "restore: init");
    let Prepared {
        disk,
        blocks,
        mut target,
    } = prepare(layout, req).map_err(|e| fail(RestoreState::Init, e, None))?;

    info!(disk = disk_number, table = ?disk.table, "restore: partition prep");
    let mut staged = disk;
    staged.keep_disk_id = req.keep_disk_id;
    stage_partitions(&mut staged, req.keep_disk_id, &mut target)
        .map_err(|e| fail(RestoreState::PartitionPrep, e, None))?;

    info!(disk = disk_number, blocks = blocks.len(), "restore: streaming blocks");
    let (stats, res) = stream_blocks(
        layout,
        &blocks,
        &mut target,
        req.cancel.as_ref(),
        req.pipeline_depth,
        progress,
    );
    res.map_err(|e| fail(RestoreState::BlockStream, e, stats.last_end))?;

    target
        .sync_all()
        .map_err(|e| fail(RestoreState::Finalize, e.into(), stats.last_end))?;
    info!(
        disk = disk_number,
        blocks = stats.blocks,
        bytes = stats.bytes,
        "restore: completed"
    );
    Ok(RestoreReport {
        disk_number,
        layout: staged,
        blocks_written: stats.blocks,
        bytes_written: stats.bytes,
    })
}

pub type DiskProgressFn<'a> = dyn Fn(u16, Progress) + Sync + 'a;

/// Restore several disks of one container in parallel, one task per disk.
///
/// The container is opened and authenticated once; the outer error covers
/// that step and bad target lists. Each disk then succeeds or fails on its
/// own.
pub fn restore_disks(
    file_path: &Path,
    password: &str,
    targets: &[(u16, PathBuf)],
    keep_disk_id: bool,
    progress: Option<&DiskProgressFn<'_>>,
) -> Result<Vec<std::result::Result<RestoreReport, RestoreFailure>>> {
    let mut seen_disks = HashSet::new();
    let mut seen_targets = HashSet::new();
    for (disk, target) in targets {
        if !seen_disks.insert(*disk) || !seen_targets.insert(target) {
            return Err(ImgxError::format(format!(
                "disk {disk} or target {} listed twice",
                target.display()
            )));
        }
    }

    let layout = read_backup_file(file_path, password, false)?;
    Ok(targets
        .par_iter()
        .map(|(disk, target)| {
            let req = RestoreRequest {
                keep_disk_id,
                ..RestoreRequest::new(*disk, target.clone())
            };
            match progress {
                Some(f) => {
                    let mut cb = |p: Progress| f(*disk, p);
                    restore_from_layout(&layout, &req, Some(&mut cb))
                }
                None => restore_from_layout(&layout, &req, None),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecId;
    use crate::container::blocktab::{BlockDescriptor, BlockKind};
    use crate::container::disk::PartitionTableKind;
    use crate::container::header::{Header, VERSION};
    use crate::crypto::cipher::CipherId;
    use crate::crypto::kdf::KdfParams;

    fn data(target_off: u64, raw_len: u64) -> BlockDescriptor {
        BlockDescriptor {
            kind: BlockKind::Data,
            codec: CodecId::Store,
            disk: 0,
            offset: 16,
            stored_len: raw_len,
            target_off,
            raw_len,
            checksum: 0,
        }
    }

    fn layout_with(blocks: Vec<BlockDescriptor>) -> FileLayout {
        FileLayout {
            path: PathBuf::from("unused"),
            magic: *crate::container::prefix::MAGIC,
            header_off: 0,
            container_len: 0,
            header: Header {
                version: VERSION,
                cipher: CipherId::None,
                kdf: KdfParams::default(),
                salt: [0; 32],
                iv_seed: [0; 32],
                verify_tag: [0; 32],
                created: 0,
                disk_count: 1,
                block_count: blocks.len() as u64,
            },
            blocks,
            cipher: None,
            index: None,
        }
    }

    fn disk(size: u64, track0: usize) -> DiskLayout {
        DiskLayout {
            disk_number: 0,
            disk_id: DiskId::None,
            size,
            sector_size: 512,
            table: PartitionTableKind::None,
            partitions: Vec::new(),
            logical_partitions: Vec::new(),
            track0: vec![0; track0],
            keep_disk_id: true,
        }
    }

    #[test]
    fn extents_inside_disk_pass() {
        let l = layout_with(vec![data(512, 512), data(1024, 1024)]);
        check_extents(&l, &disk(2048, 512), &l.data_blocks(0)).unwrap();
    }

    #[test]
    fn extents_past_end_or_overlapping_fail() {
        let l = layout_with(vec![data(1024, 2048)]);
        assert!(check_extents(&l, &disk(2048, 0), &l.data_blocks(0)).is_err());

        let l = layout_with(vec![data(0, 1024), data(512, 1024)]);
        assert!(check_extents(&l, &disk(4096, 0), &l.data_blocks(0)).is_err());

        let l = layout_with(vec![data(0, 512)]);
        assert!(check_extents(&l, &disk(4096, 512), &l.data_blocks(0)).is_err());

        let l = layout_with(vec![data(u64::MAX, 2)]);
        assert!(check_extents(&l, &disk(4096, 0), &l.data_blocks(0)).is_err());
    }

    #[test]
    fn failure_state_follows_error() {
        let f = RestoreFailure::new(0, RestoreState::BlockStream, ImgxError::Cancelled, Some(10));
        assert_eq!(f.state, RestoreState::Cancelled);
        assert!(f.state.is_terminal());
        let f = RestoreFailure::new(0, RestoreState::Init, ImgxError::Authentication, None);
        assert_eq!(f.state, RestoreState::Failed);
        assert!(!f.during.is_terminal());
    }

    #[test]
    fn duplicate_targets_rejected() {
        let t = PathBuf::from("/dev/null");
        let r = restore_disks(
            Path::new("does-not-matter"),
            "",
            &[(0, t.clone()), (1, t)],
            true,
            None,
        );
        assert!(matches!(r, Err(ImgxError::Format(_))));
    }
}
