//! Directory Entries
//! -----------------
//!
//! A directory is a flat run of 32-byte records. The first byte of each record
//! is its entry type; bit 7 says whether the record is in use. A type of
//! `0x00` marks the end of the directory.
//!
//! Files and directories are described by an *entry set*: one primary File
//! entry followed by `secondary_count` secondary entries, of which the first
//! must be a Stream Extension and the following ones File Name entries.
//!
//! ```ascii
//!     File (0x85)
//!     [UInt8:entry_type]
//!     [UInt8:secondary_count]
//!     [UInt16:set_checksum]
//!     [UInt16:file_attributes]
//!     [UInt16:reserved1]
//!     [UInt32:create_timestamp]
//!     [UInt32:last_modified_timestamp]
//!     [UInt32:last_accessed_timestamp]
//!     [UInt8:create_10ms_increment]
//!     [UInt8:last_modified_10ms_increment]
//!     [UInt8:create_utc_offset]
//!     [UInt8:last_modified_utc_offset]
//!     [UInt8:last_accessed_utc_offset]
//!     [7 bytes:reserved2]
//!
//!     Stream Extension (0xC0)
//!     [UInt8:entry_type]
//!     [UInt8:general_secondary_flags]  /* bit 0 AllocationPossible, bit 1 NoFatChain */
//!     [UInt8:reserved1]
//!     [UInt8:name_length]
//!     [UInt16:name_hash]
//!     [UInt16:reserved2]
//!     [UInt64:valid_data_length]
//!     [UInt32:reserved3]
//!     [UInt32:first_cluster]
//!     [UInt64:data_length]
//!
//!     File Name (0xC1)
//!     [UInt8:entry_type]
//!     [UInt8:general_secondary_flags]
//!     [15 x UInt16:file_name]          /* UTF-16LE */
//! ```
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::error::{Error, Result};

pub const ENTRY_SIZE: usize = 32;

pub const TYPE_END_OF_DIRECTORY: u8 = 0x00;
pub const TYPE_ALLOCATION_BITMAP: u8 = 0x81;
pub const TYPE_UPCASE_TABLE: u8 = 0x82;
pub const TYPE_VOLUME_LABEL: u8 = 0x83;
pub const TYPE_FILE: u8 = 0x85;
pub const TYPE_VOLUME_GUID: u8 = 0xA0;
pub const TYPE_STREAM_EXTENSION: u8 = 0xC0;
pub const TYPE_FILE_NAME: u8 = 0xC1;

/// Characters carried by a single File Name entry.
pub const NAME_CHARS_PER_ENTRY: usize = 15;
pub const MAX_NAME_LENGTH: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileAttributes(pub u16);

impl FileAttributes {
    pub const READ_ONLY: u16 = 0x0001;
    pub const HIDDEN: u16 = 0x0002;
    pub const SYSTEM: u16 = 0x0004;
    pub const DIRECTORY: u16 = 0x0010;
    pub const ARCHIVE: u16 = 0x0020;

    pub fn is_directory(&self) -> bool {
        self.0 & Self::DIRECTORY != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.0 & Self::READ_ONLY != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.0 & Self::HIDDEN != 0
    }

    pub fn is_system(&self) -> bool {
        self.0 & Self::SYSTEM != 0
    }

    pub fn is_archive(&self) -> bool {
        self.0 & Self::ARCHIVE != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeneralSecondaryFlags(pub u8);

impl GeneralSecondaryFlags {
    pub const ALLOCATION_POSSIBLE: u8 = 0x01;
    pub const NO_FAT_CHAIN: u8 = 0x02;

    pub fn allocation_possible(&self) -> bool {
        self.0 & Self::ALLOCATION_POSSIBLE != 0
    }

    /// When set, the allocation is contiguous and the FAT entries for it are
    /// not meaningful.
    pub fn no_fat_chain(&self) -> bool {
        self.0 & Self::NO_FAT_CHAIN != 0
    }
}

/// exFAT 32-bit timestamp: double seconds, minute, hour, day, month, year since 1980.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub raw: u32,
    pub increment_10ms: u8,
}

impl Timestamp {
    pub fn to_datetime(&self) -> Option<NaiveDateTime> {
        let raw = self.raw;
        let seconds = (raw & 0x1f) * 2;
        let minute = (raw >> 5) & 0x3f;
        let hour = (raw >> 11) & 0x1f;
        let day = (raw >> 16) & 0x1f;
        let month = (raw >> 21) & 0x0f;
        let year = 1980 + (raw >> 25) as i32;

        let datetime = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, seconds)?;
        Some(datetime + Duration::milliseconds(self.increment_10ms as i64 * 10))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.to_datetime() {
            Some(datetime) => write!(f, "{}", datetime.format("%Y-%m-%d %H:%M:%S")),
            None => write!(f, "-"),
        }
    }
}

/// Primary File entry (0x85)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub secondary_count: u8,
    pub set_checksum: u16,
    pub file_attributes: FileAttributes,
    pub create: Timestamp,
    pub last_modified: Timestamp,
    pub last_accessed: Timestamp,
}

impl FileEntry {
    fn new(raw: &[u8; ENTRY_SIZE]) -> Result<FileEntry> {
        let mut reader = Cursor::new(&raw[1..]);
        let secondary_count = reader.read_u8()?;
        let set_checksum = reader.read_u16::<LittleEndian>()?;
        let file_attributes = FileAttributes(reader.read_u16::<LittleEndian>()?);
        let _reserved1 = reader.read_u16::<LittleEndian>()?;
        let create_raw = reader.read_u32::<LittleEndian>()?;
        let modified_raw = reader.read_u32::<LittleEndian>()?;
        let accessed_raw = reader.read_u32::<LittleEndian>()?;
        let create_10ms = reader.read_u8()?;
        let modified_10ms = reader.read_u8()?;

        Ok(FileEntry {
            secondary_count,
            set_checksum,
            file_attributes,
            create: Timestamp {
                raw: create_raw,
                increment_10ms: create_10ms,
            },
            last_modified: Timestamp {
                raw: modified_raw,
                increment_10ms: modified_10ms,
            },
            last_accessed: Timestamp {
                raw: accessed_raw,
                increment_10ms: 0,
            },
        })
    }
}

/// Stream Extension entry (0xC0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamExtensionEntry {
    pub general_secondary_flags: GeneralSecondaryFlags,
    pub name_length: u8,
    pub name_hash: u16,
    pub valid_data_length: u64,
    pub first_cluster: u32,
    pub data_length: u64,
}

impl StreamExtensionEntry {
    fn new(raw: &[u8; ENTRY_SIZE]) -> Result<StreamExtensionEntry> {
        let mut reader = Cursor::new(&raw[1..]);
        let general_secondary_flags = GeneralSecondaryFlags(reader.read_u8()?);
        let _reserved1 = reader.read_u8()?;
        let name_length = reader.read_u8()?;
        let name_hash = reader.read_u16::<LittleEndian>()?;
        let _reserved2 = reader.read_u16::<LittleEndian>()?;
        let valid_data_length = reader.read_u64::<LittleEndian>()?;
        let _reserved3 = reader.read_u32::<LittleEndian>()?;
        let first_cluster = reader.read_u32::<LittleEndian>()?;
        let data_length = reader.read_u64::<LittleEndian>()?;

        if valid_data_length > data_length {
            return Err(Error::InvalidEntrySet(format!(
                "ValidDataLength {} exceeds DataLength {}",
                valid_data_length, data_length
            )));
        }

        Ok(StreamExtensionEntry {
            general_secondary_flags,
            name_length,
            name_hash,
            valid_data_length,
            first_cluster,
            data_length,
        })
    }
}

/// Allocation Bitmap (0x81) and Up-case Table (0x82) entries share this layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterRegionEntry {
    pub flags: u8,
    pub table_checksum: u32,
    pub first_cluster: u32,
    pub data_length: u64,
}

impl ClusterRegionEntry {
    fn new(raw: &[u8; ENTRY_SIZE]) -> Result<ClusterRegionEntry> {
        let mut reader = Cursor::new(&raw[1..]);
        let flags = reader.read_u8()?;
        let mut reserved = [0u8; 2];
        reader.read_exact(&mut reserved)?;
        let table_checksum = reader.read_u32::<LittleEndian>()?;
        let mut reserved = [0u8; 12];
        reader.read_exact(&mut reserved)?;
        let first_cluster = reader.read_u32::<LittleEndian>()?;
        let data_length = reader.read_u64::<LittleEndian>()?;
        Ok(ClusterRegionEntry {
            flags,
            table_checksum,
            first_cluster,
            data_length,
        })
    }
}

/// A file or directory described by a complete, checksummed entry set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntrySet {
    pub name: String,
    pub file: FileEntry,
    pub stream: StreamExtensionEntry,
}

/// One logical record of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEntry {
    AllocationBitmap(ClusterRegionEntry),
    UpcaseTable(ClusterRegionEntry),
    VolumeLabel(String),
    File(FileEntrySet),
}

/// Rotate-right accumulator over an entry set, skipping the SetChecksum field.
pub fn entry_set_checksum(entries: &[u8]) -> u16 {
    let mut checksum: u16 = 0;
    for (index, &byte) in entries.iter().enumerate() {
        if index == 2 || index == 3 {
            continue;
        }
        checksum = checksum.rotate_right(1).wrapping_add(byte as u16);
    }
    checksum
}

fn decode_utf16(units: &[u16]) -> Result<String> {
    String::from_utf16(units)
        .map_err(|_| Error::InvalidFileName(String::from_utf16_lossy(units)))
}

fn record(data: &[u8], index: usize) -> Option<&[u8; ENTRY_SIZE]> {
    let start = index * ENTRY_SIZE;
    data.get(start..start + ENTRY_SIZE)
        .and_then(|slice| slice.try_into().ok())
}

/// Parses the raw contents of a directory into logical records.
///
/// Parsing stops at the first end-of-directory marker or at the end of `data`.
/// Unused entries and benign records (volume GUID, vendor entries) are skipped.
pub fn parse_directory(data: &[u8]) -> Result<Vec<DirectoryEntry>> {
    let mut entries = Vec::new();
    let mut index = 0;

    while let Some(raw) = record(data, index) {
        let entry_type = raw[0];
        if entry_type == TYPE_END_OF_DIRECTORY {
            break;
        }
        if entry_type & 0x80 == 0 {
            index += 1;
            continue;
        }

        match entry_type {
            TYPE_ALLOCATION_BITMAP => {
                entries.push(DirectoryEntry::AllocationBitmap(ClusterRegionEntry::new(raw)?));
                index += 1;
            }
            TYPE_UPCASE_TABLE => {
                entries.push(DirectoryEntry::UpcaseTable(ClusterRegionEntry::new(raw)?));
                index += 1;
            }
            TYPE_VOLUME_LABEL => {
                let count = (raw[1] as usize).min(11);
                let units: Vec<u16> = raw[2..2 + count * 2]
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                entries.push(DirectoryEntry::VolumeLabel(decode_utf16(&units)?));
                index += 1;
            }
            TYPE_FILE => {
                let set = parse_file_entry_set(data, index)?;
                index += 1 + set.file.secondary_count as usize;
                entries.push(DirectoryEntry::File(set));
            }
            _ => {
                tracing::trace!("skipping directory entry type {:#04x} at index {}", entry_type, index);
                index += 1;
            }
        }
    }

    Ok(entries)
}

fn parse_file_entry_set(data: &[u8], index: usize) -> Result<FileEntrySet> {
    let primary = record(data, index)
        .ok_or_else(|| Error::InvalidEntrySet("missing file entry".to_string()))?;
    let file = FileEntry::new(primary)?;

    let secondary_count = file.secondary_count as usize;
    if secondary_count < 2 {
        return Err(Error::InvalidEntrySet(format!(
            "file entry has {} secondary entries",
            secondary_count
        )));
    }

    let start = index * ENTRY_SIZE;
    let end = start + (1 + secondary_count) * ENTRY_SIZE;
    let set_bytes = data.get(start..end).ok_or_else(|| {
        Error::InvalidEntrySet("entry set runs past the end of the directory".to_string())
    })?;

    let actual = entry_set_checksum(set_bytes);
    if actual != file.set_checksum {
        return Err(Error::EntrySetChecksum {
            expected: file.set_checksum,
            actual,
        });
    }

    let stream_raw = record(data, index + 1)
        .filter(|raw| raw[0] == TYPE_STREAM_EXTENSION)
        .ok_or_else(|| Error::InvalidEntrySet("file entry is not followed by a stream extension".to_string()))?;
    let stream = StreamExtensionEntry::new(stream_raw)?;

    let name_length = stream.name_length as usize;
    if name_length == 0 {
        return Err(Error::InvalidEntrySet("empty file name".to_string()));
    }
    let name_entries = name_length.div_ceil(NAME_CHARS_PER_ENTRY);
    if name_entries > secondary_count - 1 {
        return Err(Error::InvalidEntrySet(format!(
            "name of {} characters needs {} name entries, set has {}",
            name_length,
            name_entries,
            secondary_count - 1
        )));
    }

    let mut units = Vec::with_capacity(name_length);
    for offset in 0..name_entries {
        let raw = record(data, index + 2 + offset)
            .filter(|raw| raw[0] == TYPE_FILE_NAME)
            .ok_or_else(|| Error::InvalidEntrySet("missing file name entry".to_string()))?;
        for pair in raw[2..].chunks_exact(2) {
            if units.len() == name_length {
                break;
            }
            units.push(u16::from_le_bytes([pair[0], pair[1]]));
        }
    }

    Ok(FileEntrySet {
        name: decode_utf16(&units)?,
        file,
        stream,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_set(name: &str, attributes: u16, flags: u8, first_cluster: u32, length: u64) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let name_entries = units.len().div_ceil(NAME_CHARS_PER_ENTRY);
        let mut set = vec![0u8; (2 + name_entries) * ENTRY_SIZE];

        set[0] = TYPE_FILE;
        set[1] = (1 + name_entries) as u8;
        set[4..6].copy_from_slice(&attributes.to_le_bytes());
        // 2024-03-15 12:30:10
        let stamp: u32 = (44 << 25) | (3 << 21) | (15 << 16) | (12 << 11) | (30 << 5) | 5;
        set[12..16].copy_from_slice(&stamp.to_le_bytes());
        set[21] = 150;

        let stream = &mut set[32..64];
        stream[0] = TYPE_STREAM_EXTENSION;
        stream[1] = flags;
        stream[3] = units.len() as u8;
        stream[8..16].copy_from_slice(&length.to_le_bytes());
        stream[20..24].copy_from_slice(&first_cluster.to_le_bytes());
        stream[24..32].copy_from_slice(&length.to_le_bytes());

        for (chunk_index, chunk) in units.chunks(NAME_CHARS_PER_ENTRY).enumerate() {
            let start = (2 + chunk_index) * ENTRY_SIZE;
            set[start] = TYPE_FILE_NAME;
            for (i, unit) in chunk.iter().enumerate() {
                set[start + 2 + i * 2..start + 4 + i * 2].copy_from_slice(&unit.to_le_bytes());
            }
        }

        let checksum = entry_set_checksum(&set);
        set[2..4].copy_from_slice(&checksum.to_le_bytes());
        set
    }

    #[test]
    fn test_parse_file_entry_set() {
        let data = file_set("readme.txt", FileAttributes::ARCHIVE, 0x03, 7, 42);
        let entries = parse_directory(&data).unwrap();
        assert_eq!(entries.len(), 1);

        match &entries[0] {
            DirectoryEntry::File(set) => {
                assert_eq!(set.name, "readme.txt");
                assert!(!set.file.file_attributes.is_directory());
                assert!(set.stream.general_secondary_flags.no_fat_chain());
                assert_eq!(set.stream.first_cluster, 7);
                assert_eq!(set.stream.valid_data_length, 42);
                let modified = set.file.last_modified.to_datetime().unwrap();
                assert_eq!(
                    modified.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                    "2024-03-15 12:30:11.500"
                );
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_long_name_spans_entries() {
        let name = "a name that is definitely longer than fifteen characters.bin";
        let data = file_set(name, FileAttributes::DIRECTORY, 0x01, 9, 0);
        let entries = parse_directory(&data).unwrap();
        match &entries[0] {
            DirectoryEntry::File(set) => {
                assert_eq!(set.name, name);
                assert!(set.file.file_attributes.is_directory());
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut data = file_set("x.bin", 0, 0x01, 5, 10);
        data[40] ^= 0xff;
        assert!(matches!(
            parse_directory(&data),
            Err(Error::EntrySetChecksum { .. })
        ));
    }

    #[test]
    fn test_stops_at_end_of_directory() {
        let mut data = file_set("a", 0, 0x01, 5, 1);
        data.extend_from_slice(&[0u8; ENTRY_SIZE]);
        data.extend_from_slice(&file_set("b", 0, 0x01, 6, 1));
        let entries = parse_directory(&data).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_skips_deleted_entries() {
        let mut deleted = file_set("gone", 0, 0x01, 5, 1);
        for chunk in deleted.chunks_mut(ENTRY_SIZE) {
            chunk[0] &= 0x7f;
        }
        deleted.extend_from_slice(&file_set("kept", 0, 0x01, 6, 1));
        let entries = parse_directory(&deleted).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(&entries[0], DirectoryEntry::File(set) if set.name == "kept"));
    }

    #[test]
    fn test_volume_label() {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[0] = TYPE_VOLUME_LABEL;
        raw[1] = 4;
        for (i, unit) in "DISK".encode_utf16().enumerate() {
            raw[2 + i * 2..4 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        let entries = parse_directory(&raw).unwrap();
        assert_eq!(entries, vec![DirectoryEntry::VolumeLabel("DISK".to_string())]);
    }

    #[test]
    fn test_truncated_set() {
        let data = file_set("truncated", 0, 0x01, 5, 1);
        assert!(matches!(
            parse_directory(&data[..64]),
            Err(Error::InvalidEntrySet(_))
        ));
    }

    #[test]
    fn test_invalid_timestamp() {
        let stamp = Timestamp {
            raw: 0,
            increment_10ms: 0,
        };
        assert!(stamp.to_datetime().is_none());
        assert_eq!(stamp.to_string(), "-");
    }
}
