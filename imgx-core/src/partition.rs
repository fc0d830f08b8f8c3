//! Partition-table handling for whole-disk images: MBR/GPT discovery on the
//! backup side, disk-identifier stamping on the restore side.

use std::collections::HashSet;
use std::io::{Read, Seek};

use tracing::debug;

use crate::container::disk::{
    DiskId, DiskLayout, PartitionEntry, PartitionTableKind, PartitionType,
};
use crate::crypto::kdf::random_bytes;
use crate::error::{ImgxError, Result};
use crate::hash::crc32::checksum;
use crate::util::fileio::{le32, le64, read_exact_at, read_vec_at, stream_len};

pub const SECTOR_SIZE: u32 = 512;
/// Upper bound for the boot area kept in a disk-metadata block.
pub const TRACK0_MAX: u64 = 1 << 20;

const MBR_SIG_AT: usize = 510;
const MBR_DISK_ID_AT: usize = 440;
const MBR_TABLE_AT: usize = 446;
const MBR_ENTRY_LEN: usize = 16;
const GPT_PROTECTIVE: u8 = 0xEE;
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_HEADER_MIN: usize = 92;
const GPT_MAX_ENTRIES: u32 = 1024;
/// Stops a corrupt or cyclic EBR chain.
const MAX_LOGICAL: usize = 64;

/// Read the partition table of a raw disk image and describe what a backup
/// must capture. An image without an MBR signature becomes one raw region
/// spanning the whole disk.
pub fn parse_disk_layout<R: Read + Seek>(r: &mut R, disk_number: u16) -> Result<DiskLayout> {
    let size = stream_len(r)?;
    let raw = |size| DiskLayout {
        disk_number,
        disk_id: DiskId::None,
        size,
        sector_size: SECTOR_SIZE,
        table: PartitionTableKind::None,
        partitions: vec![PartitionEntry {
            index: 0,
            offset: 0,
            length: size,
            part_type: PartitionType::Raw,
            fs_id: None,
            name: None,
            parent: None,
        }],
        logical_partitions: Vec::new(),
        track0: Vec::new(),
        keep_disk_id: true,
    };

    if size < SECTOR_SIZE as u64 {
        return Ok(raw(size));
    }
    let mut mbr = [0u8; SECTOR_SIZE as usize];
    read_exact_at(r, 0, &mut mbr)?;
    if mbr[MBR_SIG_AT] != 0x55 || mbr[MBR_SIG_AT + 1] != 0xAA {
        debug!(disk = disk_number, "no MBR signature, capturing raw disk");
        return Ok(raw(size));
    }

    let mbr_entries = parse_mbr_entries(&mbr);
    let mut logical_partitions = Vec::new();
    let (table, disk_id, mut partitions) =
        if mbr_entries.iter().any(|e| e.part_type == PartitionType::Mbr(GPT_PROTECTIVE)) {
            let (guid, parts) = parse_gpt(r, size)?;
            (PartitionTableKind::Gpt, DiskId::Gpt(guid), parts)
        } else {
            // only one extended container is valid per MBR
            if let Some(ext) = mbr_entries.iter().find(|e| is_extended(e.part_type)) {
                logical_partitions = parse_ebr_chain(r, ext, size)?;
            }
            (
                PartitionTableKind::Mbr,
                DiskId::Mbr(le32(&mbr[MBR_DISK_ID_AT..])),
                mbr_entries,
            )
        };

    partitions.retain(|p| p.length > 0 && p.offset < size);
    for p in &mut partitions {
        // clip entries that claim more than the image holds
        p.length = p.length.min(size - p.offset);
    }
    partitions.sort_by_key(|p| p.offset);

    let first = partitions.first().map(|p| p.offset).unwrap_or(size);
    let track0_len = first.min(TRACK0_MAX).min(size);
    let track0 = read_vec_at(r, 0, track0_len)?;
    // a table whose first partition starts past TRACK0_MAX leaves a gap that
    // is simply not captured

    let layout = DiskLayout {
        disk_number,
        disk_id,
        size,
        sector_size: SECTOR_SIZE,
        table,
        partitions,
        logical_partitions,
        track0,
        keep_disk_id: true,
    };
    layout.validate()?;
    Ok(layout)
}

fn parse_mbr_entries(mbr: &[u8; SECTOR_SIZE as usize]) -> Vec<PartitionEntry> {
    let mut out = Vec::new();
    for i in 0..4 {
        let e = &mbr[MBR_TABLE_AT + i * MBR_ENTRY_LEN..MBR_TABLE_AT + (i + 1) * MBR_ENTRY_LEN];
        let part_type = e[4];
        let start_lba = le32(&e[8..12]) as u64;
        let sectors = le32(&e[12..16]) as u64;
        if part_type == 0 || sectors == 0 {
            continue;
        }
        out.push(PartitionEntry {
            index: i as u32,
            offset: start_lba * SECTOR_SIZE as u64,
            length: sectors * SECTOR_SIZE as u64,
            part_type: PartitionType::Mbr(part_type),
            fs_id: None,
            name: None,
            parent: None,
        });
    }
    out
}

fn is_extended(t: PartitionType) -> bool {
    matches!(t, PartitionType::Mbr(0x05 | 0x0F | 0x85))
}

/// Walk the EBR chain of an extended container. Each EBR uses two slots:
/// the logical partition (start relative to this EBR) and the link to the
/// next EBR (start relative to the container). Logical partitions that do
/// not fit inside the container are dropped.
fn parse_ebr_chain<R: Read + Seek>(
    r: &mut R,
    container: &PartitionEntry,
    size: u64,
) -> Result<Vec<PartitionEntry>> {
    let sector = SECTOR_SIZE as u64;
    let base_lba = container.offset / sector;
    let container_end = container.end().min(size);
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut ebr_lba = base_lba;

    while out.len() < MAX_LOGICAL && seen.insert(ebr_lba) {
        let at = ebr_lba * sector;
        if at + sector > container_end {
            break;
        }
        let mut ebr = [0u8; SECTOR_SIZE as usize];
        read_exact_at(r, at, &mut ebr)?;
        if ebr[MBR_SIG_AT] != 0x55 || ebr[MBR_SIG_AT + 1] != 0xAA {
            break;
        }
        let slot = |n: usize| {
            let e = &ebr[MBR_TABLE_AT + n * MBR_ENTRY_LEN..MBR_TABLE_AT + (n + 1) * MBR_ENTRY_LEN];
            (e[4], le32(&e[8..12]) as u64, le32(&e[12..16]) as u64)
        };

        let (part_type, rel_start, sectors) = slot(0);
        if part_type != 0 && sectors != 0 {
            let entry = PartitionEntry {
                index: 4 + out.len() as u32,
                offset: (ebr_lba + rel_start) * sector,
                length: sectors * sector,
                part_type: PartitionType::Mbr(part_type),
                fs_id: None,
                name: None,
                parent: Some(container.index),
            };
            if entry.offset >= container.offset && entry.end() <= container_end {
                out.push(entry);
            } else {
                debug!(offset = entry.offset, "logical partition outside its container, skipped");
            }
        }

        let (link_type, link_start, _) = slot(1);
        if link_type == 0 || link_start == 0 {
            break;
        }
        ebr_lba = base_lba + link_start;
    }
    Ok(out)
}

fn parse_gpt<R: Read + Seek>(r: &mut R, size: u64) -> Result<([u8; 16], Vec<PartitionEntry>)> {
    let sector = SECTOR_SIZE as u64;
    let hdr = read_vec_at(r, sector, sector.min(size.saturating_sub(sector)))?;
    if hdr.len() < GPT_HEADER_MIN || &hdr[..8] != GPT_SIGNATURE {
        return Err(ImgxError::format("protective MBR without a GPT header"));
    }
    let header_size = le32(&hdr[12..16]) as usize;
    if !(GPT_HEADER_MIN..=hdr.len()).contains(&header_size) {
        return Err(ImgxError::format(format!("bad GPT header size {header_size}")));
    }
    let mut scratch = hdr[..header_size].to_vec();
    scratch[16..20].fill(0);
    if checksum(&scratch) != le32(&hdr[16..20]) {
        return Err(ImgxError::format("GPT header checksum mismatch"));
    }

    let mut guid = [0u8; 16];
    guid.copy_from_slice(&hdr[56..72]);
    let entries_lba = le64(&hdr[72..80]);
    let count = le32(&hdr[80..84]);
    let entry_len = le32(&hdr[84..88]) as u64;
    if count > GPT_MAX_ENTRIES || entry_len < 128 {
        return Err(ImgxError::format("implausible GPT entry array"));
    }
    let array_at = entries_lba
        .checked_mul(sector)
        .ok_or_else(|| ImgxError::format("GPT entry array offset overflows"))?;
    let array = read_vec_at(r, array_at, count as u64 * entry_len)?;

    let mut out = Vec::new();
    for (i, e) in array.chunks_exact(entry_len as usize).enumerate() {
        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&e[0..16]);
        if type_guid == [0u8; 16] {
            continue;
        }
        let first = le64(&e[32..40]);
        let last = le64(&e[40..48]);
        if last < first {
            continue;
        }
        let name: Vec<u16> = e[56..128]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&c| c != 0)
            .collect();
        let extent = first.checked_mul(sector).and_then(|offset| {
            let length = (last - first).checked_add(1)?.checked_mul(sector)?;
            offset.checked_add(length).map(|_| (offset, length))
        });
        let Some((offset, length)) = extent else {
            return Err(ImgxError::format(format!(
                "GPT entry {i} spans LBA {first}..={last}, beyond any disk"
            )));
        };
        out.push(PartitionEntry {
            index: i as u32,
            offset,
            length,
            part_type: PartitionType::Gpt(type_guid),
            fs_id: None,
            name: Some(String::from_utf16_lossy(&name)).filter(|s| !s.is_empty()),
            parent: None,
        });
    }
    Ok((guid, out))
}

/// Generate a new identifier of the same family as `current`.
pub fn fresh_disk_id(current: DiskId) -> Result<DiskId> {
    match current {
        DiskId::None => Ok(DiskId::None),
        DiskId::Mbr(old) => loop {
            let sig = u32::from_le_bytes(random_bytes::<4>()?);
            if sig != 0 && sig != old {
                return Ok(DiskId::Mbr(sig));
            }
        },
        DiskId::Gpt(_) => Ok(DiskId::Gpt(uuid::Uuid::new_v4().to_bytes_le())),
    }
}

/// Write `id` into the boot area, fixing up the GPT header CRC.
pub fn stamp_disk_id(track0: &mut [u8], id: DiskId, sector_size: u32) -> Result<()> {
    match id {
        DiskId::None => Ok(()),
        DiskId::Mbr(sig) => {
            if track0.len() < SECTOR_SIZE as usize {
                return Err(ImgxError::format("boot area too small for an MBR"));
            }
            track0[MBR_DISK_ID_AT..MBR_DISK_ID_AT + 4].copy_from_slice(&sig.to_le_bytes());
            Ok(())
        }
        DiskId::Gpt(guid) => {
            let at = sector_size as usize;
            if track0.len() < at + GPT_HEADER_MIN || &track0[at..at + 8] != GPT_SIGNATURE {
                return Err(ImgxError::format("boot area has no GPT header"));
            }
            let header_size = le32(&track0[at + 12..]) as usize;
            if header_size < GPT_HEADER_MIN || at + header_size > track0.len() {
                return Err(ImgxError::format(format!("bad GPT header size {header_size}")));
            }
            let hdr = &mut track0[at..at + header_size];
            hdr[56..72].copy_from_slice(&guid);
            hdr[16..20].fill(0);
            let crc = checksum(hdr);
            hdr[16..20].copy_from_slice(&crc.to_le_bytes());
            Ok(())
        }
    }
}
