//! Volume access
//!
//! `ExfatReader` owns the image handle and knows the volume geometry once
//! `parse` has read the boot sector. Everything that touches the cluster heap
//! goes through it: FAT lookups, directory reads and the bounded streaming of
//! file data into a sink.
use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::boot::{self, BootSector, BOOT_CHECKSUM_SECTORS};
use crate::entry::{self, DirectoryEntry};
use crate::error::{Error, Result};

pub const FAT_END_OF_CHAIN: u32 = 0xFFFF_FFFF;
pub const FAT_BAD_CLUSTER: u32 = 0xFFFF_FFF7;

/// First data cluster; cluster numbers 0 and 1 do not address the heap.
pub const FIRST_DATA_CLUSTER: u32 = 2;

pub struct ExfatReader<R> {
    source: R,
    boot_sector: Option<BootSector>,
}

impl<R: Read + Seek> ExfatReader<R> {
    pub fn new(source: R) -> ExfatReader<R> {
        ExfatReader {
            source,
            boot_sector: None,
        }
    }

    /// Reads and validates the boot sector. Must be called before anything else.
    pub fn parse(&mut self) -> Result<()> {
        self.source.seek(SeekFrom::Start(0))?;
        let boot_sector = BootSector::new(&mut self.source)?;
        tracing::debug!(
            "exFAT {} volume: {} clusters of {} bytes, FAT at sector {}, heap at sector {}, root at cluster {}",
            boot_sector.revision(),
            boot_sector.cluster_count,
            boot_sector.cluster_size(),
            boot_sector.fat_offset,
            boot_sector.cluster_heap_offset,
            boot_sector.first_cluster_of_root_directory
        );
        self.boot_sector = Some(boot_sector);
        Ok(())
    }

    pub fn boot_sector(&self) -> Result<&BootSector> {
        self.boot_sector.as_ref().ok_or_else(|| {
            Error::InvalidBootSector("volume has not been parsed".to_string())
        })
    }

    pub fn sector_size(&self) -> Result<u64> {
        Ok(self.boot_sector()?.sector_size())
    }

    pub fn cluster_size(&self) -> Result<u64> {
        Ok(self.boot_sector()?.cluster_size())
    }

    pub fn is_valid_cluster(&self, cluster: u32) -> Result<bool> {
        let count = self.boot_sector()?.cluster_count;
        Ok(cluster >= FIRST_DATA_CLUSTER && cluster - FIRST_DATA_CLUSTER < count)
    }

    /// Absolute byte offset of a cluster in the image.
    pub fn cluster_offset(&self, cluster: u32) -> Result<u64> {
        if !self.is_valid_cluster(cluster)? {
            return Err(Error::InvalidCluster(cluster));
        }
        let boot = self.boot_sector()?;
        let heap = boot.cluster_heap_offset as u64 * boot.sector_size();
        Ok(heap + (cluster - FIRST_DATA_CLUSTER) as u64 * boot.cluster_size())
    }

    /// Raw FAT entry for `cluster`, read from the active FAT.
    pub fn fat_entry(&mut self, cluster: u32) -> Result<u32> {
        let boot = self.boot_sector()?;
        let fat_start = (boot.fat_offset as u64
            + boot.active_fat() as u64 * boot.fat_length as u64)
            * boot.sector_size();
        let fat_bytes = boot.fat_length as u64 * boot.sector_size();
        let offset = cluster as u64 * 4;
        if offset + 4 > fat_bytes {
            return Err(Error::InvalidCluster(cluster));
        }

        self.source.seek(SeekFrom::Start(fat_start + offset))?;
        Ok(self.source.read_u32::<LittleEndian>()?)
    }

    /// Follows the FAT from `cluster`. `None` means the chain ends here.
    pub fn next_cluster(&mut self, cluster: u32) -> Result<Option<u32>> {
        match self.fat_entry(cluster)? {
            FAT_END_OF_CHAIN => Ok(None),
            FAT_BAD_CLUSTER => Err(Error::BadCluster(cluster)),
            next => {
                if self.is_valid_cluster(next)? {
                    Ok(Some(next))
                } else {
                    Err(Error::InvalidCluster(next))
                }
            }
        }
    }

    /// Compares the stored boot region checksum (sector 11) with one computed
    /// over sectors 0..=10.
    pub fn verify_boot_checksum(&mut self) -> Result<bool> {
        let sector_size = self.sector_size()? as usize;
        let mut region = vec![0u8; sector_size * (BOOT_CHECKSUM_SECTORS + 1)];
        self.source.seek(SeekFrom::Start(0))?;
        self.source.read_exact(&mut region)?;

        let computed = boot::boot_checksum(&region, sector_size);
        let stored = &region[sector_size * BOOT_CHECKSUM_SECTORS..];
        Ok(stored
            .chunks_exact(4)
            .all(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) == computed))
    }

    /// Streams `size` bytes of the chain starting at `first_cluster` into
    /// `sink` and returns how many clusters and sectors were visited.
    ///
    /// With `use_fat` the chain is followed through the FAT; otherwise the
    /// allocation is contiguous and the next cluster is simply `cluster + 1`.
    /// Only `size` bytes are written even when the last cluster holds more.
    pub fn write_from_cluster_chain<W: Write + ?Sized>(
        &mut self,
        first_cluster: u32,
        size: u64,
        use_fat: bool,
        sink: &mut W,
    ) -> Result<(u64, u64)> {
        if size == 0 {
            return Ok((0, 0));
        }

        let cluster_size = self.cluster_size()?;
        let sector_size = self.sector_size()?;
        let max_clusters = self.boot_sector()?.cluster_count as u64;

        let mut cluster = first_cluster;
        let mut remaining = size;
        let mut clusters_read = 0u64;
        let mut sectors_read = 0u64;

        loop {
            if clusters_read >= max_clusters {
                return Err(Error::ChainLoop(first_cluster));
            }

            let offset = self.cluster_offset(cluster)?;
            let chunk = remaining.min(cluster_size);
            tracing::trace!("cluster {} at offset {:#x}: {} bytes", cluster, offset, chunk);

            self.source.seek(SeekFrom::Start(offset))?;
            let copied = io::copy(&mut (&mut self.source).take(chunk), sink)?;
            if copied != chunk {
                return Err(Error::ChainTooShort {
                    expected: size,
                    read: size - remaining + copied,
                });
            }

            clusters_read += 1;
            sectors_read += chunk.div_ceil(sector_size);
            remaining -= chunk;
            if remaining == 0 {
                break;
            }

            cluster = if use_fat {
                match self.next_cluster(cluster)? {
                    Some(next) => next,
                    None => {
                        return Err(Error::ChainTooShort {
                            expected: size,
                            read: size - remaining,
                        })
                    }
                }
            } else {
                cluster.checked_add(1).ok_or(Error::InvalidCluster(cluster))?
            };
        }

        tracing::debug!(
            "read {} bytes from cluster chain at {} ({} clusters, {} sectors, fat: {})",
            size,
            first_cluster,
            clusters_read,
            sectors_read,
            use_fat
        );
        Ok((clusters_read, sectors_read))
    }

    /// Reads a FAT chain to its end, whatever its length.
    fn read_whole_chain(&mut self, first_cluster: u32) -> Result<Vec<u8>> {
        let cluster_size = self.cluster_size()?;
        let max_clusters = self.boot_sector()?.cluster_count as u64;
        let mut data = Vec::new();
        let mut cluster = first_cluster;
        let mut visited = 0u64;

        loop {
            if visited >= max_clusters {
                return Err(Error::ChainLoop(first_cluster));
            }
            self.write_from_cluster_chain(cluster, cluster_size, false, &mut data)?;
            visited += 1;
            match self.next_cluster(cluster)? {
                Some(next) => cluster = next,
                None => break,
            }
        }
        Ok(data)
    }

    /// Reads and parses one directory.
    ///
    /// The root directory has no stream extension describing it, so its size
    /// is unknown (`None`) and its chain is always followed through the FAT.
    pub fn read_directory(
        &mut self,
        first_cluster: u32,
        size: Option<u64>,
        use_fat: bool,
    ) -> Result<Vec<DirectoryEntry>> {
        let data = match size {
            Some(0) => Vec::new(),
            Some(size) => {
                let heap_size = self.boot_sector()?.cluster_count as u64 * self.cluster_size()?;
                if size > heap_size {
                    return Err(Error::InvalidEntrySet(format!(
                        "directory at cluster {} claims {} bytes, the cluster heap holds {}",
                        first_cluster, size, heap_size
                    )));
                }
                let mut data = Vec::new();
                self.write_from_cluster_chain(first_cluster, size, use_fat, &mut data)?;
                data
            }
            None => self.read_whole_chain(first_cluster)?,
        };
        entry::parse_directory(&data)
    }

    pub fn into_inner(self) -> R {
        self.source
    }
}
