pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use clap::Parser;
use imgx_core::error::Result;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Backup {
            out,
            images,
            password,
            block_size,
            level,
            min_gain,
            deterministic,
            file_meta,
            kdf_memory,
            kdf_time,
        } => handlers::handle_backup(
            out,
            images,
            handlers::BackupArgs {
                password,
                block_size,
                level,
                min_gain,
                deterministic,
                file_meta,
                kdf_memory,
                kdf_time,
            },
        ),
        Commands::Info {
            container,
            password,
            blocks,
            json,
        } => handlers::handle_info(container, password, blocks, json),
        Commands::Metadata {
            container,
            password,
            disk,
        } => handlers::handle_metadata(container, password, disk),
        Commands::Verify {
            container,
            password,
        } => handlers::handle_verify(container, password),
        Commands::Restore {
            container,
            target,
            disk,
            password,
            keep_disk_id,
            pipeline_depth,
            quiet,
        } => handlers::handle_restore(
            container,
            target,
            disk,
            password,
            keep_disk_id,
            pipeline_depth,
            quiet,
        ),
    }
}
