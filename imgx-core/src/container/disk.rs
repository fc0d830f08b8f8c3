use serde::{Deserialize, Serialize};

use crate::error::{ImgxError, Result};

/// Identity stamped into the partition table of a disk.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskId {
    None,
    /// MBR disk signature (bytes 440..444).
    Mbr(u32),
    /// GPT disk GUID, on-disk (mixed-endian) byte order.
    Gpt([u8; 16]),
}

impl std::fmt::Display for DiskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskId::None => f.write_str("-"),
            DiskId::Mbr(sig) => write!(f, "{sig:08X}"),
            DiskId::Gpt(d) => write!(
                f,
                "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{}",
                d[3],
                d[2],
                d[1],
                d[0],
                d[5],
                d[4],
                d[7],
                d[6],
                d[8],
                d[9],
                hex::encode_upper(&d[10..16])
            ),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTableKind {
    None,
    Mbr,
    Gpt,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    /// Whole-disk region with no partition table.
    Raw,
    Mbr(u8),
    Gpt([u8; 16]),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub index: u32,
    /// Byte offset on the disk.
    pub offset: u64,
    pub length: u64,
    pub part_type: PartitionType,
    pub fs_id: Option<String>,
    pub name: Option<String>,
    /// Index of the extended container holding this logical partition.
    #[serde(default)]
    pub parent: Option<u32>,
}

impl PartitionEntry {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// Decoded disk-metadata block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub disk_number: u16,
    pub disk_id: DiskId,
    /// Source disk size in bytes; a restore target must be at least this big.
    pub size: u64,
    pub sector_size: u32,
    pub table: PartitionTableKind,
    pub partitions: Vec<PartitionEntry>,
    /// Logical partitions found by walking the EBR chain of an extended
    /// container. Their bytes are captured through the container entry.
    #[serde(default)]
    pub logical_partitions: Vec<PartitionEntry>,
    /// Disk bytes from 0 up to the first partition (boot code, partition
    /// tables). Written before any data block on restore.
    pub track0: Vec<u8>,
    pub keep_disk_id: bool,
}

impl DiskLayout {
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| ImgxError::format(format!("disk layout encode: {e}")))?;
        Ok(buf)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| ImgxError::format(format!("disk layout decode: {e}")))
    }

    /// Partitions must sit inside the disk and must not overlap the boot
    /// area; logical partitions must sit inside their container.
    pub fn validate(&self) -> Result<()> {
        let boot_end = self.track0.len() as u64;
        if boot_end > self.size {
            return Err(ImgxError::format(format!(
                "disk {}: boot area larger than the disk",
                self.disk_number
            )));
        }
        for p in &self.partitions {
            if p.end() > self.size || p.offset < boot_end {
                return Err(ImgxError::format(format!(
                    "disk {}: partition {} [{}, {}) outside the usable disk",
                    self.disk_number,
                    p.index,
                    p.offset,
                    p.end()
                )));
            }
        }
        for l in &self.logical_partitions {
            let inside = l.parent.and_then(|i| self.partitions.iter().find(|p| p.index == i));
            if !inside.is_some_and(|c| l.offset >= c.offset && l.end() <= c.end()) {
                return Err(ImgxError::format(format!(
                    "disk {}: logical partition {} [{}, {}) outside its container",
                    self.disk_number,
                    l.index,
                    l.offset,
                    l.end()
                )));
            }
        }
        Ok(())
    }
}
