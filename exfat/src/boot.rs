//! Boot Sector
//! -----------
//!
//! The first sector of an exFAT volume describes the geometry of everything
//! else: where the FAT lives, where the cluster heap starts, how big sectors
//! and clusters are and which cluster holds the root directory.
//!
//! ```ascii
//!     [3 bytes:jump_boot]              EB 76 90
//!     [8 bytes:file_system_name]       "EXFAT   "
//!     [53 bytes:must_be_zero]
//!     [UInt64:partition_offset]
//!     [UInt64:volume_length]           /* in sectors */
//!     [UInt32:fat_offset]              /* in sectors */
//!     [UInt32:fat_length]              /* in sectors */
//!     [UInt32:cluster_heap_offset]     /* in sectors */
//!     [UInt32:cluster_count]
//!     [UInt32:first_cluster_of_root_directory]
//!     [UInt32:volume_serial_number]
//!     [UInt16:file_system_revision]
//!     [UInt16:volume_flags]
//!     [UInt8:bytes_per_sector_shift]
//!     [UInt8:sectors_per_cluster_shift]
//!     [UInt8:number_of_fats]
//!     [UInt8:drive_select]
//!     [UInt8:percent_in_use]
//!     [7 bytes:reserved]
//!     [390 bytes:boot_code]
//!     [UInt16:boot_signature]          AA55
//! ```
//!
//! All integers are little endian.
use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const FILE_SYSTEM_NAME: &[u8; 8] = b"EXFAT   ";
pub const BOOT_SIGNATURE: u16 = 0xAA55;

/// Sectors 0..=10 of the boot region are covered by the checksum stored in sector 11.
pub const BOOT_CHECKSUM_SECTORS: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    pub jump_boot: [u8; 3],
    pub file_system_name: [u8; 8],
    pub partition_offset: u64,
    pub volume_length: u64,
    pub fat_offset: u32,
    pub fat_length: u32,
    pub cluster_heap_offset: u32,
    pub cluster_count: u32,
    pub first_cluster_of_root_directory: u32,
    pub volume_serial_number: u32,
    pub file_system_revision: u16,
    pub volume_flags: u16,
    pub bytes_per_sector_shift: u8,
    pub sectors_per_cluster_shift: u8,
    pub number_of_fats: u8,
    pub drive_select: u8,
    pub percent_in_use: u8,
    pub boot_signature: u16,
}

impl BootSector {
    pub fn new<R: Read>(mut reader: R) -> Result<BootSector> {
        let mut jump_boot = [0u8; 3];
        reader.read_exact(&mut jump_boot)?;
        let mut file_system_name = [0u8; 8];
        reader.read_exact(&mut file_system_name)?;
        if &file_system_name != FILE_SYSTEM_NAME {
            return Err(Error::InvalidSignature);
        }

        let mut must_be_zero = [0u8; 53];
        reader.read_exact(&mut must_be_zero)?;
        if must_be_zero.iter().any(|&b| b != 0) {
            return Err(Error::InvalidBootSector(
                "MustBeZero region is not zeroed".to_string(),
            ));
        }

        let partition_offset = reader.read_u64::<LittleEndian>()?;
        let volume_length = reader.read_u64::<LittleEndian>()?;
        let fat_offset = reader.read_u32::<LittleEndian>()?;
        let fat_length = reader.read_u32::<LittleEndian>()?;
        let cluster_heap_offset = reader.read_u32::<LittleEndian>()?;
        let cluster_count = reader.read_u32::<LittleEndian>()?;
        let first_cluster_of_root_directory = reader.read_u32::<LittleEndian>()?;
        let volume_serial_number = reader.read_u32::<LittleEndian>()?;
        let file_system_revision = reader.read_u16::<LittleEndian>()?;
        let volume_flags = reader.read_u16::<LittleEndian>()?;
        let bytes_per_sector_shift = reader.read_u8()?;
        let sectors_per_cluster_shift = reader.read_u8()?;
        let number_of_fats = reader.read_u8()?;
        let drive_select = reader.read_u8()?;
        let percent_in_use = reader.read_u8()?;

        let mut skip = [0u8; 7 + 390];
        reader.read_exact(&mut skip)?;
        let boot_signature = reader.read_u16::<LittleEndian>()?;

        let boot_sector = BootSector {
            jump_boot,
            file_system_name,
            partition_offset,
            volume_length,
            fat_offset,
            fat_length,
            cluster_heap_offset,
            cluster_count,
            first_cluster_of_root_directory,
            volume_serial_number,
            file_system_revision,
            volume_flags,
            bytes_per_sector_shift,
            sectors_per_cluster_shift,
            number_of_fats,
            drive_select,
            percent_in_use,
            boot_signature,
        };
        boot_sector.validate()?;
        Ok(boot_sector)
    }

    fn validate(&self) -> Result<()> {
        if self.boot_signature != BOOT_SIGNATURE {
            return Err(Error::InvalidBootSector(format!(
                "boot signature is {:#06x}",
                self.boot_signature
            )));
        }
        if !(9..=12).contains(&self.bytes_per_sector_shift) {
            return Err(Error::InvalidBootSector(format!(
                "BytesPerSectorShift {} is outside 9..=12",
                self.bytes_per_sector_shift
            )));
        }
        if self.sectors_per_cluster_shift > 25 - self.bytes_per_sector_shift {
            return Err(Error::InvalidBootSector(format!(
                "SectorsPerClusterShift {} makes clusters larger than 32MB",
                self.sectors_per_cluster_shift
            )));
        }
        if self.number_of_fats != 1 && self.number_of_fats != 2 {
            return Err(Error::InvalidBootSector(format!(
                "NumberOfFats is {}",
                self.number_of_fats
            )));
        }
        if self.cluster_count == 0 {
            return Err(Error::InvalidBootSector("ClusterCount is zero".to_string()));
        }
        let root = self.first_cluster_of_root_directory;
        if root < 2 || root - 2 >= self.cluster_count {
            return Err(Error::InvalidBootSector(format!(
                "root directory cluster {} is outside the cluster heap",
                root
            )));
        }
        Ok(())
    }

    pub fn sector_size(&self) -> u64 {
        1u64 << self.bytes_per_sector_shift
    }

    pub fn sectors_per_cluster(&self) -> u64 {
        1u64 << self.sectors_per_cluster_shift
    }

    pub fn cluster_size(&self) -> u64 {
        self.sector_size() << self.sectors_per_cluster_shift
    }

    /// Index of the FAT in use when the volume carries two (TexFAT).
    pub fn active_fat(&self) -> u8 {
        if self.number_of_fats == 2 && self.volume_flags & 0x0001 != 0 {
            1
        } else {
            0
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.volume_flags & 0x0002 != 0
    }

    /// "major.minor", e.g. "1.00"
    pub fn revision(&self) -> String {
        format!(
            "{}.{:02}",
            self.file_system_revision >> 8,
            self.file_system_revision & 0xff
        )
    }
}

/// Checksum over the first eleven sectors of a boot region, skipping
/// VolumeFlags (bytes 106 and 107) and PercentInUse (byte 112).
pub fn boot_checksum(sectors: &[u8], sector_size: usize) -> u32 {
    let len = sector_size * BOOT_CHECKSUM_SECTORS;
    let mut checksum: u32 = 0;
    for (index, &byte) in sectors.iter().take(len).enumerate() {
        if index == 106 || index == 107 || index == 112 {
            continue;
        }
        checksum = checksum.rotate_right(1).wrapping_add(byte as u32);
    }
    checksum
}
