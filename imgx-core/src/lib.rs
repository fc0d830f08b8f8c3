#![forbid(unsafe_code)]

pub mod error;

pub mod util {
    pub mod fileio;
}

pub mod hash {
    pub mod crc32;
}

pub mod codec;

pub mod crypto {
    pub mod cipher;
    pub mod kdf;
}

pub mod container {
    pub mod block;
    pub mod blocktab;
    pub mod disk;
    pub mod header;
    pub mod prefix;
}

pub mod partition;

pub mod pack {
    pub mod writer;
}

pub mod read {
    pub mod metadata;
    pub mod reader;
    pub mod verify;
}

pub mod restore {
    pub mod engine;
    pub(crate) mod pipeline;
    pub mod progress;
}

pub mod domain;
pub mod list;
pub mod stats;

// Re-exports: stable API surface
pub use container::blocktab::{BlockDescriptor, BlockKind};
pub use container::disk::{DiskId, DiskLayout, PartitionEntry, PartitionTableKind, PartitionType};
pub use crypto::kdf::KdfParams;
pub use error::{ImgxError, Result};
pub use list::{describe, disks};
pub use pack::writer::{BackupOptions, DiskSource, WriteSummary, write_backup};
pub use read::metadata::{read_block, read_disk_metadata, read_file_metadata_data};
pub use read::reader::{FileLayout, read_backup_file};
pub use read::verify::{VerifyReport, verify_backup};
pub use restore::engine::{
    RestoreFailure, RestoreReport, RestoreRequest, RestoreState, restore_disk, restore_disks,
    restore_from_layout, restore_request,
};
pub use restore::progress::{CancelToken, Progress};
