//! In-memory exFAT image builder for tests.
//!
//! Produces small but well-formed volumes: a checksummed boot region (plus its
//! backup), a single FAT, an allocation bitmap, an up-case table and a root
//! directory holding whatever files and directories were added.
//!
//! Three file layouts are available so both kinds of cluster chains get
//! exercised:
//!
//! - `file`: FAT chain over consecutive clusters
//! - `fragmented_file`: FAT chain with an unallocated gap cluster between data clusters
//! - `contiguous_file`: NoFatChain, FAT entries left empty
//!
//! Slack after the last byte of a file is filled with `SLACK_BYTE` and gap
//! clusters with `GAP_BYTE`, so reading too far or following the wrong link
//! shows up as wrong content.

use crate::boot::{self, BOOT_CHECKSUM_SECTORS, BOOT_SIGNATURE, FILE_SYSTEM_NAME};
use crate::entry::{
    self, FileAttributes, GeneralSecondaryFlags, ENTRY_SIZE, NAME_CHARS_PER_ENTRY,
    TYPE_ALLOCATION_BITMAP, TYPE_FILE, TYPE_FILE_NAME, TYPE_STREAM_EXTENSION,
    TYPE_UPCASE_TABLE, TYPE_VOLUME_LABEL,
};
use crate::reader::{FAT_END_OF_CHAIN, FIRST_DATA_CLUSTER};

pub const SLACK_BYTE: u8 = 0xEE;
pub const GAP_BYTE: u8 = 0xDD;

const BYTES_PER_SECTOR_SHIFT: u8 = 9;
const BOOT_REGION_SECTORS: u32 = 12;

/// 2024-03-15 12:30:10
const FIXED_TIMESTAMP: u32 = (44 << 25) | (3 << 21) | (15 << 16) | (12 << 11) | (30 << 5) | 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Chained,
    Fragmented,
    Contiguous,
}

#[derive(Debug, Clone)]
enum Child {
    Dir(DirSpec),
    File {
        name: String,
        data: Vec<u8>,
        layout: Layout,
    },
}

#[derive(Debug, Clone, Default)]
struct DirSpec {
    name: String,
    children: Vec<Child>,
}

impl DirSpec {
    fn subdir(&mut self, name: &str) -> &mut DirSpec {
        let position = self
            .children
            .iter()
            .position(|child| matches!(child, Child::Dir(dir) if dir.name == name));
        let index = match position {
            Some(index) => index,
            None => {
                self.children.push(Child::Dir(DirSpec {
                    name: name.to_string(),
                    children: Vec::new(),
                }));
                self.children.len() - 1
            }
        };
        match &mut self.children[index] {
            Child::Dir(dir) => dir,
            Child::File { .. } => unreachable!("position only matches directories"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    sectors_per_cluster_shift: u8,
    cluster_count: u32,
    volume_serial_number: u32,
    label: Option<String>,
    root: DirSpec,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        ImageBuilder::new()
    }
}

impl ImageBuilder {
    pub fn new() -> ImageBuilder {
        ImageBuilder {
            sectors_per_cluster_shift: 1,
            cluster_count: 256,
            volume_serial_number: 0x1234_ABCD,
            label: None,
            root: DirSpec::default(),
        }
    }

    pub fn sectors_per_cluster_shift(mut self, shift: u8) -> Self {
        self.sectors_per_cluster_shift = shift;
        self
    }

    pub fn cluster_count(mut self, count: u32) -> Self {
        self.cluster_count = count;
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn cluster_size(&self) -> u64 {
        1u64 << (BYTES_PER_SECTOR_SHIFT + self.sectors_per_cluster_shift)
    }

    /// Adds a directory; missing parents are created as well.
    pub fn dir(mut self, path: &str) -> Self {
        let mut dir = &mut self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            dir = dir.subdir(segment);
        }
        self
    }

    pub fn file(self, path: &str, data: &[u8]) -> Self {
        self.add_file(path, data, Layout::Chained)
    }

    pub fn fragmented_file(self, path: &str, data: &[u8]) -> Self {
        self.add_file(path, data, Layout::Fragmented)
    }

    pub fn contiguous_file(self, path: &str, data: &[u8]) -> Self {
        self.add_file(path, data, Layout::Contiguous)
    }

    fn add_file(mut self, path: &str, data: &[u8], layout: Layout) -> Self {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (name, parents) = segments
            .split_last()
            .expect("file path must have at least one segment");
        let mut dir = &mut self.root;
        for segment in parents {
            dir = dir.subdir(segment);
        }
        dir.children.push(Child::File {
            name: name.to_string(),
            data: data.to_vec(),
            layout,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let sector_size = 1u64 << BYTES_PER_SECTOR_SHIFT;
        let cluster_size = self.cluster_size();
        let fat_offset = BOOT_REGION_SECTORS * 2;
        let fat_length = ((self.cluster_count as u64 + 2) * 4).div_ceil(sector_size) as u32;
        let cluster_heap_offset = fat_offset + fat_length;
        let volume_length = cluster_heap_offset as u64
            + ((self.cluster_count as u64) << self.sectors_per_cluster_shift);

        let mut volume = Volume {
            image: vec![0u8; (volume_length * sector_size) as usize],
            fat: vec![0u32; self.cluster_count as usize + 2],
            allocated: vec![false; self.cluster_count as usize + 2],
            next_free: FIRST_DATA_CLUSTER,
            heap_start: cluster_heap_offset as u64 * sector_size,
            cluster_size,
            cluster_count: self.cluster_count,
        };
        volume.fat[0] = 0xFFFF_FFF8;
        volume.fat[1] = FAT_END_OF_CHAIN;

        let bitmap_length = (self.cluster_count as u64).div_ceil(8);
        let bitmap_cluster = volume.allocate_chain(bitmap_length.div_ceil(cluster_size).max(1) as u32, false);

        let upcase: Vec<u8> = (0u16..128)
            .map(|c| (c as u8).to_ascii_uppercase() as u16)
            .flat_map(|c| c.to_le_bytes())
            .collect();
        let upcase_cluster = volume.write_stream(&upcase, Layout::Chained);
        let upcase_checksum = upcase
            .iter()
            .fold(0u32, |sum, &b| sum.rotate_right(1).wrapping_add(b as u32));

        let mut root_entries = Vec::new();
        if let Some(label) = &self.label {
            let mut raw = [0u8; ENTRY_SIZE];
            raw[0] = TYPE_VOLUME_LABEL;
            let units: Vec<u16> = label.encode_utf16().take(11).collect();
            raw[1] = units.len() as u8;
            for (i, unit) in units.iter().enumerate() {
                raw[2 + i * 2..4 + i * 2].copy_from_slice(&unit.to_le_bytes());
            }
            root_entries.extend_from_slice(&raw);
        }
        root_entries.extend_from_slice(&region_entry(TYPE_ALLOCATION_BITMAP, 0, bitmap_cluster, bitmap_length));
        root_entries.extend_from_slice(&region_entry(
            TYPE_UPCASE_TABLE,
            upcase_checksum,
            upcase_cluster,
            upcase.len() as u64,
        ));
        for child in &self.root.children {
            root_entries.extend_from_slice(&volume.place(child));
        }
        let root_cluster = volume.write_directory(&root_entries);

        let mut bitmap = vec![0u8; bitmap_length as usize];
        for cluster in FIRST_DATA_CLUSTER..self.cluster_count + FIRST_DATA_CLUSTER {
            if volume.allocated[cluster as usize] {
                let bit = (cluster - FIRST_DATA_CLUSTER) as usize;
                bitmap[bit / 8] |= 1 << (bit % 8);
            }
        }
        let bitmap_offset = volume.offset(bitmap_cluster);
        volume.image[bitmap_offset..bitmap_offset + bitmap.len()].copy_from_slice(&bitmap);

        let fat_start = (fat_offset as u64 * sector_size) as usize;
        for (index, value) in volume.fat.iter().enumerate() {
            let at = fat_start + index * 4;
            volume.image[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }

        let used = volume.allocated.iter().filter(|&&a| a).count() as u64;
        let percent_in_use = (used * 100 / self.cluster_count as u64) as u8;

        let mut sector = vec![0u8; sector_size as usize];
        sector[0..3].copy_from_slice(&[0xEB, 0x76, 0x90]);
        sector[3..11].copy_from_slice(FILE_SYSTEM_NAME);
        sector[72..80].copy_from_slice(&volume_length.to_le_bytes());
        sector[80..84].copy_from_slice(&fat_offset.to_le_bytes());
        sector[84..88].copy_from_slice(&fat_length.to_le_bytes());
        sector[88..92].copy_from_slice(&cluster_heap_offset.to_le_bytes());
        sector[92..96].copy_from_slice(&self.cluster_count.to_le_bytes());
        sector[96..100].copy_from_slice(&root_cluster.to_le_bytes());
        sector[100..104].copy_from_slice(&self.volume_serial_number.to_le_bytes());
        sector[104..106].copy_from_slice(&0x0100u16.to_le_bytes());
        sector[108] = BYTES_PER_SECTOR_SHIFT;
        sector[109] = self.sectors_per_cluster_shift;
        sector[110] = 1;
        sector[111] = 0x80;
        sector[112] = percent_in_use;
        sector[510..512].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());

        let region_length = (BOOT_REGION_SECTORS as u64 * sector_size) as usize;
        let mut region = vec![0u8; region_length];
        region[..sector.len()].copy_from_slice(&sector);
        // Extended boot sectors 1..=8 end with their own signature.
        for index in 1..=8 {
            let end = (index + 1) * sector_size as usize;
            region[end - 4..end].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
        }
        let checksum = boot::boot_checksum(&region, sector_size as usize);
        let checksum_start = BOOT_CHECKSUM_SECTORS * sector_size as usize;
        for chunk in region[checksum_start..].chunks_exact_mut(4) {
            chunk.copy_from_slice(&checksum.to_le_bytes());
        }

        volume.image[..region_length].copy_from_slice(&region);
        volume.image[region_length..region_length * 2].copy_from_slice(&region);
        volume.image
    }
}

struct Volume {
    image: Vec<u8>,
    fat: Vec<u32>,
    allocated: Vec<bool>,
    next_free: u32,
    heap_start: u64,
    cluster_size: u64,
    cluster_count: u32,
}

impl Volume {
    fn offset(&self, cluster: u32) -> usize {
        (self.heap_start + (cluster - FIRST_DATA_CLUSTER) as u64 * self.cluster_size) as usize
    }

    fn take_cluster(&mut self) -> u32 {
        let cluster = self.next_free;
        assert!(
            cluster < self.cluster_count + FIRST_DATA_CLUSTER,
            "test image ran out of clusters"
        );
        self.next_free += 1;
        self.allocated[cluster as usize] = true;
        cluster
    }

    fn allocate_chain(&mut self, count: u32, with_gaps: bool) -> u32 {
        let mut clusters = Vec::with_capacity(count as usize);
        for index in 0..count {
            if with_gaps && index > 0 {
                let gap = self.next_free;
                assert!(gap < self.cluster_count + FIRST_DATA_CLUSTER, "test image ran out of clusters");
                self.next_free += 1;
                let offset = self.offset(gap);
                let size = self.cluster_size as usize;
                self.image[offset..offset + size].fill(GAP_BYTE);
            }
            clusters.push(self.take_cluster());
        }
        for pair in clusters.windows(2) {
            self.fat[pair[0] as usize] = pair[1];
        }
        if let Some(&last) = clusters.last() {
            self.fat[last as usize] = FAT_END_OF_CHAIN;
        }
        clusters[0]
    }

    fn chain(&self, first: u32) -> Vec<u32> {
        let mut clusters = vec![first];
        let mut cluster = first;
        while self.fat[cluster as usize] != FAT_END_OF_CHAIN {
            cluster = self.fat[cluster as usize];
            clusters.push(cluster);
        }
        clusters
    }

    /// Writes `data` into freshly allocated clusters and returns the first one.
    fn write_stream(&mut self, data: &[u8], layout: Layout) -> u32 {
        let count = (data.len() as u64).div_ceil(self.cluster_size).max(1) as u32;
        let first = self.allocate_chain(count, layout == Layout::Fragmented);
        let clusters = if layout == Layout::Contiguous {
            let clusters: Vec<u32> = (first..first + count).collect();
            for &cluster in &clusters {
                self.fat[cluster as usize] = 0;
            }
            clusters
        } else {
            self.chain(first)
        };

        let size = self.cluster_size as usize;
        for (index, &cluster) in clusters.iter().enumerate() {
            let offset = self.offset(cluster);
            let start = index * size;
            let end = data.len().min(start + size);
            let written = end.saturating_sub(start);
            if written > 0 {
                self.image[offset..offset + written].copy_from_slice(&data[start..end]);
            }
            self.image[offset + written..offset + size].fill(SLACK_BYTE);
        }
        first
    }

    fn write_directory(&mut self, entries: &[u8]) -> u32 {
        let count = (entries.len() as u64).div_ceil(self.cluster_size).max(1) as u32;
        let first = self.allocate_chain(count, false);
        let offset = self.offset(first);
        self.image[offset..offset + entries.len()].copy_from_slice(entries);
        first
    }

    /// Lays out a child (recursively for directories) and returns its entry set.
    fn place(&mut self, child: &Child) -> Vec<u8> {
        match child {
            Child::File { name, data, layout } => {
                if data.is_empty() {
                    return file_entry_set(name, FileAttributes::ARCHIVE, GeneralSecondaryFlags::ALLOCATION_POSSIBLE, 0, 0, 0);
                }
                let first = self.write_stream(data, *layout);
                let mut flags = GeneralSecondaryFlags::ALLOCATION_POSSIBLE;
                if *layout == Layout::Contiguous {
                    flags |= GeneralSecondaryFlags::NO_FAT_CHAIN;
                }
                file_entry_set(name, FileAttributes::ARCHIVE, flags, first, data.len() as u64, data.len() as u64)
            }
            Child::Dir(dir) => {
                let mut entries = Vec::new();
                for grandchild in &dir.children {
                    entries.extend_from_slice(&self.place(grandchild));
                }
                let first = self.write_directory(&entries);
                let clusters = (entries.len() as u64).div_ceil(self.cluster_size).max(1);
                let length = clusters * self.cluster_size;
                file_entry_set(
                    &dir.name,
                    FileAttributes::DIRECTORY,
                    GeneralSecondaryFlags::ALLOCATION_POSSIBLE,
                    first,
                    length,
                    length,
                )
            }
        }
    }
}

fn region_entry(entry_type: u8, table_checksum: u32, first_cluster: u32, length: u64) -> [u8; ENTRY_SIZE] {
    let mut raw = [0u8; ENTRY_SIZE];
    raw[0] = entry_type;
    raw[4..8].copy_from_slice(&table_checksum.to_le_bytes());
    raw[20..24].copy_from_slice(&first_cluster.to_le_bytes());
    raw[24..32].copy_from_slice(&length.to_le_bytes());
    raw
}

fn name_hash(units: &[u16]) -> u16 {
    let mut hash: u16 = 0;
    for unit in units {
        let upper = if *unit < 128 {
            (*unit as u8).to_ascii_uppercase() as u16
        } else {
            *unit
        };
        for byte in upper.to_le_bytes() {
            hash = hash.rotate_right(1).wrapping_add(byte as u16);
        }
    }
    hash
}

fn file_entry_set(
    name: &str,
    attributes: u16,
    flags: u8,
    first_cluster: u32,
    valid_data_length: u64,
    data_length: u64,
) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let name_entries = units.len().div_ceil(NAME_CHARS_PER_ENTRY);
    let mut set = vec![0u8; (2 + name_entries) * ENTRY_SIZE];

    set[0] = TYPE_FILE;
    set[1] = (1 + name_entries) as u8;
    set[4..6].copy_from_slice(&attributes.to_le_bytes());
    for at in [8, 12, 16] {
        set[at..at + 4].copy_from_slice(&FIXED_TIMESTAMP.to_le_bytes());
    }

    set[32] = TYPE_STREAM_EXTENSION;
    set[33] = flags;
    set[35] = units.len() as u8;
    set[36..38].copy_from_slice(&name_hash(&units).to_le_bytes());
    set[40..48].copy_from_slice(&valid_data_length.to_le_bytes());
    set[52..56].copy_from_slice(&first_cluster.to_le_bytes());
    set[56..64].copy_from_slice(&data_length.to_le_bytes());

    for (chunk_index, chunk) in units.chunks(NAME_CHARS_PER_ENTRY).enumerate() {
        let start = (2 + chunk_index) * ENTRY_SIZE;
        set[start] = TYPE_FILE_NAME;
        for (i, unit) in chunk.iter().enumerate() {
            set[start + 2 + i * 2..start + 4 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
    }

    let checksum = entry::entry_set_checksum(&set);
    set[2..4].copy_from_slice(&checksum.to_le_bytes());
    set
}
