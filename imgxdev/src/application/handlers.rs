use std::fs::File;
use std::path::PathBuf;

use imgx_core::error::{ImgxError, Result};
use imgx_core::stats::Stats;
use imgx_core::{
    BackupOptions, DiskSource, KdfParams, Progress, RestoreRequest, describe, disks,
    read_backup_file, restore_request, verify_backup, write_backup,
};

fn usage(msg: impl Into<String>) -> ImgxError {
    ImgxError::Format(msg.into())
}

fn json_err(e: serde_json::Error) -> ImgxError {
    ImgxError::Format(format!("json: {e}"))
}

fn password_or_empty(password: Option<String>) -> String {
    password.unwrap_or_default()
}

pub struct BackupArgs {
    pub password: Option<String>,
    pub block_size: u32,
    pub level: i32,
    pub min_gain: f32,
    pub deterministic: bool,
    pub file_meta: Vec<String>,
    pub kdf_memory: Option<u32>,
    pub kdf_time: Option<u32>,
}

/// `DISK=PATH` specs to per-disk JSON documents. Each file must hold valid
/// JSON; it is stored verbatim.
fn load_file_meta(specs: &[String], disk_count: usize) -> Result<Vec<Vec<String>>> {
    let mut per_disk = vec![Vec::new(); disk_count];
    for spec in specs {
        let (disk, path) = spec
            .split_once('=')
            .ok_or_else(|| usage(format!("--file-meta expects DISK=PATH, got {spec:?}")))?;
        let disk: usize = disk
            .parse()
            .map_err(|_| usage(format!("--file-meta: bad disk number {disk:?}")))?;
        if disk >= disk_count {
            return Err(usage(format!(
                "--file-meta: disk {disk} given, only {disk_count} image(s)"
            )));
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str::<serde_json::Value>(&text)
            .map_err(|e| usage(format!("{path}: not a JSON document: {e}")))?;
        per_disk[disk].push(text);
    }
    Ok(per_disk)
}

pub fn handle_backup(out: PathBuf, images: Vec<PathBuf>, args: BackupArgs) -> Result<()> {
    let mut kdf = KdfParams::default();
    if let Some(m) = args.kdf_memory {
        kdf.m_cost = m;
    }
    if let Some(t) = args.kdf_time {
        kdf.t_cost = t;
    }
    let metas = load_file_meta(&args.file_meta, images.len())?;
    let sources: Vec<DiskSource> = images
        .into_iter()
        .zip(metas)
        .map(|(image, file_metadata)| DiskSource {
            file_metadata,
            ..DiskSource::new(image)
        })
        .collect();
    let opts = BackupOptions {
        password: args.password.filter(|p| !p.is_empty()),
        kdf,
        block_size: args.block_size,
        level: args.level,
        min_gain: args.min_gain,
        deterministic: args.deterministic,
    };
    let s = write_backup(&sources, &out, &opts)?;
    eprintln!(
        "backup: wrote {} ({} disk(s), {} blocks, {} -> {} bytes)",
        out.display(),
        s.disks,
        s.blocks,
        s.raw_bytes,
        s.stored_bytes
    );
    Ok(())
}

pub fn handle_info(
    container: PathBuf,
    password: Option<String>,
    blocks: bool,
    json: bool,
) -> Result<()> {
    let layout = read_backup_file(&container, &password_or_empty(password), false)?;
    let stats = Stats::of(&layout);
    let mut f = File::open(&container)?;
    let rows = disks(&layout, &mut f)?;

    if json {
        let doc = serde_json::json!({
            "stats": serde_json::to_value(&stats).map_err(json_err)?,
            "disks": serde_json::to_value(&rows).map_err(json_err)?,
        });
        println!("{}", serde_json::to_string_pretty(&doc).map_err(json_err)?);
        return Ok(());
    }

    println!("container: {}", container.display());
    println!(
        "version {}  disks {}  blocks {} ({} metadata, {} data)  encrypted {}",
        stats.version,
        stats.disks,
        stats.blocks,
        stats.metadata_blocks,
        stats.data_blocks,
        if stats.encrypted { "yes" } else { "no" }
    );
    println!(
        "raw {} bytes  stored {} bytes  ratio {:.3}  created {}",
        stats.raw_bytes, stats.stored_bytes, stats.compression_ratio, stats.created
    );
    for d in &rows {
        println!(
            "disk {}: {:?} id={} size={} boot={} data_blocks={} data_bytes={} file_meta={}",
            d.disk_number,
            d.table,
            d.disk_id,
            d.size,
            d.boot_area,
            d.data_blocks,
            d.data_bytes,
            d.file_metadata_blocks
        );
        for p in d.partitions.iter().chain(&d.logical_partitions) {
            let label = if p.parent.is_some() { "logical" } else { "part" };
            println!(
                "  {label:<7} {:<3} off={:<12} len={:<12} type={:?}{}",
                p.index,
                p.offset,
                p.length,
                p.part_type,
                p.name
                    .as_deref()
                    .map(|n| format!(" name={n}"))
                    .unwrap_or_default()
            );
        }
    }

    if blocks {
        for r in describe(&layout) {
            let target = r
                .target_off
                .map(|t| format!(" target={t}"))
                .unwrap_or_default();
            println!(
                "#{:<6} {:<14} disk={} codec={:?} off={} c={} u={} crc={:08x}{} end={:.1}%",
                r.ordinal,
                r.kind.to_string(),
                r.disk,
                r.codec,
                r.offset,
                r.stored_len,
                r.raw_len,
                r.checksum,
                target,
                r.pct_end
            );
        }
    }
    Ok(())
}

pub fn handle_metadata(container: PathBuf, password: Option<String>, disk: Option<u16>) -> Result<()> {
    let layout = read_backup_file(&container, &password_or_empty(password), true)?;
    let Some(index) = &layout.index else {
        return Ok(());
    };
    for fm in index.files.iter().filter(|f| disk.is_none_or(|d| d == f.disk)) {
        println!("# disk {} block {}", fm.disk, fm.block);
        match serde_json::from_str::<serde_json::Value>(&fm.json) {
            Ok(v) => println!("{}", serde_json::to_string_pretty(&v).map_err(json_err)?),
            Err(_) => println!("{}", fm.json),
        }
    }
    Ok(())
}

pub fn handle_verify(container: PathBuf, password: Option<String>) -> Result<()> {
    let r = verify_backup(&container, &password_or_empty(password))?;
    eprintln!(
        "verify: OK ({} disk(s), {} blocks, {} bytes)",
        r.disks, r.blocks, r.raw_bytes
    );
    Ok(())
}

pub fn handle_restore(
    container: PathBuf,
    target: PathBuf,
    disk: u16,
    password: Option<String>,
    keep_disk_id: bool,
    pipeline_depth: usize,
    quiet: bool,
) -> Result<()> {
    let req = RestoreRequest {
        keep_disk_id,
        pipeline_depth,
        ..RestoreRequest::new(disk, &target)
    };
    let mut last_pct = u32::MAX;
    let mut show = |p: Progress| {
        let pct = p.percent() as u32;
        if pct != last_pct {
            last_pct = pct;
            eprint!(
                "\rrestore: {pct:>3}% ({}/{} bytes)",
                p.bytes_done, p.total_bytes
            );
        }
    };
    let progress: Option<&mut dyn FnMut(Progress)> = if quiet { None } else { Some(&mut show) };

    let res = restore_request(&container, &password_or_empty(password), &req, progress);
    if !quiet {
        eprintln!();
    }
    match res {
        Ok(r) => {
            eprintln!(
                "restore: disk {} -> {} ({} blocks, {} bytes, id {})",
                r.disk_number,
                target.display(),
                r.blocks_written,
                r.bytes_written,
                r.layout.disk_id
            );
            Ok(())
        }
        Err(f) => {
            match f.resume_offset {
                Some(off) => eprintln!(
                    "restore: {:?} during {:?}; data blocks are intact up to offset {off}",
                    f.state, f.during
                ),
                None => eprintln!("restore: {:?} during {:?}", f.state, f.during),
            }
            Err(f.error)
        }
    }
}
