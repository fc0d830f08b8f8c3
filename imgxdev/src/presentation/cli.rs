use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "imgxdev CLI: disk image backup and restore", long_about = None)]
pub struct Cli {
    /// Raise log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture one or more disk images into a container
    Backup {
        out: PathBuf,
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Encrypt with this password (XChaCha20, Argon2id key)
        #[arg(long, env = "IMGX_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Raw bytes per data block
        #[arg(long, default_value_t = 64 * 1024)]
        block_size: u32,

        /// zstd level; 0 stores blocks uncompressed
        #[arg(long, default_value_t = 3)]
        level: i32,

        /// min compression gain for zstd before falling back to STORE
        #[arg(long, default_value_t = 0.05)]
        min_gain: f32,

        /// Zero the creation timestamp
        #[arg(long)]
        deterministic: bool,

        /// Attach a JSON document to a disk as file metadata (repeatable)
        #[arg(long = "file-meta", value_name = "DISK=PATH")]
        file_meta: Vec<String>,

        /// Argon2 memory cost in KiB
        #[arg(long)]
        kdf_memory: Option<u32>,

        /// Argon2 iterations
        #[arg(long)]
        kdf_time: Option<u32>,
    },

    /// Show container header, disks and optionally the block table
    Info {
        container: PathBuf,
        #[arg(long, env = "IMGX_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Also print one line per block
        #[arg(long)]
        blocks: bool,
        /// Print summary and disks as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the file-metadata documents stored in a container
    Metadata {
        container: PathBuf,
        #[arg(long, env = "IMGX_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Only this disk
        #[arg(long)]
        disk: Option<u16>,
    },

    /// Decrypt, decompress and checksum every block without writing anything
    Verify {
        container: PathBuf,
        #[arg(long, env = "IMGX_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Restore one disk of a container onto a target disk or image file
    Restore {
        container: PathBuf,
        target: PathBuf,
        #[arg(long, default_value_t = 0)]
        disk: u16,
        #[arg(long, env = "IMGX_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Keep the source disk identifier instead of generating a new one
        #[arg(long)]
        keep_disk_id: bool,
        /// Blocks decoded ahead of the writer (1 = sequential)
        #[arg(long, default_value_t = 2)]
        pipeline_depth: usize,
        /// No progress output
        #[arg(long, short)]
        quiet: bool,
    },
}
