//! BlockStream: read, decrypt and verify data blocks on a producer thread
//! while the caller's thread writes them to the target in order.

use std::fs::File;
use std::io::{Seek, Write};
use std::sync::mpsc::sync_channel;
use std::thread;

use tracing::debug;

use super::progress::{CancelToken, Progress};
use crate::error::{ImgxError, Result};
use crate::read::metadata::read_block_payload;
use crate::read::reader::FileLayout;
use crate::util::fileio::write_all_at;

/// A verified data block ready to be written.
pub(crate) struct DataBlock {
    pub idx: usize,
    pub target_off: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StreamStats {
    pub blocks: u64,
    pub bytes: u64,
    /// End offset on the target of the last block fully written.
    pub last_end: Option<u64>,
}

fn load(layout: &FileLayout, idx: usize, src: &mut File) -> Result<DataBlock> {
    let bytes = read_block_payload(layout, idx, src)?;
    Ok(DataBlock {
        idx,
        target_off: layout.blocks[idx].target_off,
        bytes,
    })
}

struct Sink<'a, 'p, W: Write + Seek> {
    target: &'a mut W,
    cancel: Option<&'a CancelToken>,
    progress: Option<&'p mut dyn FnMut(Progress)>,
    total: u64,
    /// Blocks not yet written.
    remaining: usize,
    stats: StreamStats,
}

impl<W: Write + Seek> Sink<'_, '_, W> {
    fn report(&mut self) {
        if let Some(cb) = self.progress.as_mut() {
            cb(Progress {
                bytes_done: self.stats.bytes,
                total_bytes: self.total,
            });
        }
    }

    fn check_cancel(&self) -> Result<()> {
        match self.cancel {
            Some(c) if c.is_cancelled() => Err(ImgxError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Write one block; a block is either written whole or not at all as far
    /// as the stats are concerned. Cancellation is only honoured while blocks
    /// remain, so a finished stream always reaches Finalize.
    fn consume(&mut self, item: Result<DataBlock>) -> Result<()> {
        let block = item?;
        write_all_at(self.target, block.target_off, &block.bytes)?;
        let len = block.bytes.len() as u64;
        self.stats.blocks += 1;
        self.stats.bytes += len;
        self.stats.last_end = Some(block.target_off + len);
        self.remaining = self.remaining.saturating_sub(1);
        debug!(block = block.idx, target_off = block.target_off, len, "block written");
        self.report();
        if self.remaining == 0 {
            return Ok(());
        }
        self.check_cancel()
    }
}

/// Stream `blocks` (indices into `layout.blocks`, already in write order)
/// to `target`.
///
/// With `depth >= 2` a producer thread with its own container handle keeps
/// up to `depth - 1` verified blocks queued ahead of the writer. Returns the
/// stats even on failure so the caller can report where writing stopped.
pub(crate) fn stream_blocks<W: Write + Seek>(
    layout: &FileLayout,
    blocks: &[usize],
    target: &mut W,
    cancel: Option<&CancelToken>,
    depth: usize,
    progress: Option<&mut dyn FnMut(Progress)>,
) -> (StreamStats, Result<()>) {
    let total = blocks.iter().map(|&i| layout.blocks[i].raw_len).sum();
    let mut sink = Sink {
        target,
        cancel,
        progress,
        total,
        remaining: blocks.len(),
        stats: StreamStats::default(),
    };
    sink.report();
    if let Err(e) = sink.check_cancel() {
        return (sink.stats, Err(e));
    }

    let res = if depth < 2 {
        stream_sequential(layout, blocks, &mut sink)
    } else {
        stream_pipelined(layout, blocks, &mut sink, depth)
    };
    (sink.stats, res)
}

fn stream_sequential<W: Write + Seek>(
    layout: &FileLayout,
    blocks: &[usize],
    sink: &mut Sink<'_, '_, W>,
) -> Result<()> {
    let mut src = File::open(&layout.path)?;
    for &idx in blocks {
        sink.consume(load(layout, idx, &mut src))?;
    }
    Ok(())
}

fn stream_pipelined<W: Write + Seek>(
    layout: &FileLayout,
    blocks: &[usize],
    sink: &mut Sink<'_, '_, W>,
    depth: usize,
) -> Result<()> {
    thread::scope(|s| {
        let (tx, rx) = sync_channel::<Result<DataBlock>>(depth - 1);
        s.spawn(move || {
            let mut src = match File::open(&layout.path) {
                Ok(f) => f,
                Err(e) => {
                    let _ = tx.send(Err(e.into()));
                    return;
                }
            };
            for &idx in blocks {
                let item = load(layout, idx, &mut src);
                let failed = item.is_err();
                // a closed channel means the writer stopped
                if tx.send(item).is_err() || failed {
                    return;
                }
            }
        });

        // rx is dropped on early return, which unblocks the producer
        for item in rx.iter() {
            sink.consume(item)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::writer::{BackupOptions, DiskSource, write_backup};
    use crate::read::reader::read_backup_file;
    use std::io::{self, Cursor, SeekFrom};

    const BS: u64 = 4096;

    /// Four data blocks of a 16 KiB raw image.
    fn four_blocks(dir: &std::path::Path) -> (FileLayout, Vec<usize>, Vec<u8>) {
        let image: Vec<u8> = (0..4 * BS as usize).map(|i| (i % 247) as u8 | 1).collect();
        let img = dir.join("d.img");
        std::fs::write(&img, &image).unwrap();
        let out = dir.join("d.imgx");
        let opts = BackupOptions {
            block_size: BS as u32,
            level: 0,
            deterministic: true,
            ..Default::default()
        };
        write_backup(&[DiskSource::new(&img)], &out, &opts).unwrap();
        let layout = read_backup_file(&out, "", false).unwrap();
        let blocks = layout.data_blocks(0);
        assert_eq!(blocks.len(), 4);
        (layout, blocks, image)
    }

    /// Target whose `fail_at`-th write (0-based) fails.
    struct FailingTarget {
        inner: Cursor<Vec<u8>>,
        writes: usize,
        fail_at: usize,
    }

    impl Write for FailingTarget {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.writes;
            self.writes += 1;
            if n == self.fail_at {
                return Err(io::Error::other("device went away"));
            }
            self.inner.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FailingTarget {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn target_write_error_stops_at_last_whole_block() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, blocks, image) = four_blocks(dir.path());

        for depth in [1, 3] {
            let mut target = FailingTarget {
                inner: Cursor::new(Vec::new()),
                writes: 0,
                fail_at: 2,
            };
            let (stats, res) = stream_blocks(&layout, &blocks, &mut target, None, depth, None);
            assert!(matches!(res, Err(ImgxError::Io(_))), "depth {depth}: {res:?}");
            assert_eq!(stats.blocks, 2);
            assert_eq!(stats.last_end, Some(2 * BS));
            // nothing past the second block reached the target
            assert_eq!(target.inner.get_ref().as_slice(), &image[..2 * BS as usize]);
            assert_eq!(target.writes, 3);
        }
    }

    #[test]
    fn cancel_during_last_block_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let (layout, blocks, image) = four_blocks(dir.path());

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let mut on_progress = |p: Progress| {
            if p.bytes_done == 3 * BS {
                trigger.cancel();
            }
        };
        let mut target = Cursor::new(Vec::new());
        let (stats, res) = stream_blocks(
            &layout,
            &blocks,
            &mut target,
            Some(&cancel),
            1,
            Some(&mut on_progress),
        );
        // cancelled after block 3 of 4: stops at the boundary
        assert!(matches!(res, Err(ImgxError::Cancelled)));
        assert_eq!(stats.last_end, Some(3 * BS));

        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let mut on_progress = |p: Progress| {
            if p.bytes_done == p.total_bytes {
                trigger.cancel();
            }
        };
        let mut target = Cursor::new(Vec::new());
        let (stats, res) = stream_blocks(
            &layout,
            &blocks,
            &mut target,
            Some(&cancel),
            2,
            Some(&mut on_progress),
        );
        res.unwrap();
        assert_eq!(stats.blocks, 4);
        assert_eq!(target.into_inner(), image);
    }
}
