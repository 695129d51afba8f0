//! Trees, Nodes and Paths
//! ----------------------
//!
//! `Tree` walks the directory structure of a parsed volume starting at the
//! root directory and keeps every file and directory as a `Node`.
//!
//! `Tree::list` flattens the result into `PathEntry` values: a root-relative,
//! `/`-separated path paired with its node. This is the enumeration consumers
//! iterate over; it is produced once and never mutated afterwards.
use std::collections::HashSet;
use std::io::{Read, Seek};

use serde_derive::Serialize;

use crate::entry::{
    ClusterRegionEntry, DirectoryEntry, FileAttributes, FileEntrySet, GeneralSecondaryFlags,
    Timestamp,
};
use crate::error::{Error, Result};
use crate::reader::ExfatReader;

/// Deepest directory nesting `Tree::load` accepts.
pub const MAX_DIRECTORY_DEPTH: usize = 1024;

/// A file or directory of the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub file_attributes: FileAttributes,
    pub general_secondary_flags: GeneralSecondaryFlags,
    pub first_cluster: u32,
    /// Bytes of meaningful data; what gets extracted.
    pub valid_data_length: u64,
    /// Bytes allocated to the stream.
    pub data_length: u64,
    pub created: Timestamp,
    pub last_modified: Timestamp,
    pub last_accessed: Timestamp,
    pub children: Vec<Node>,
}

impl Node {
    pub fn is_directory(&self) -> bool {
        self.file_attributes.is_directory()
    }

    /// Whether the allocation is a FAT chain rather than a contiguous run.
    pub fn uses_fat_chain(&self) -> bool {
        !self.general_secondary_flags.no_fat_chain()
    }

    fn from_entry_set(set: FileEntrySet) -> Node {
        Node {
            name: set.name,
            file_attributes: set.file.file_attributes,
            general_secondary_flags: set.stream.general_secondary_flags,
            first_cluster: set.stream.first_cluster,
            valid_data_length: set.stream.valid_data_length,
            data_length: set.stream.data_length,
            created: set.file.create,
            last_modified: set.file.last_modified,
            last_accessed: set.file.last_accessed,
            children: Vec::new(),
        }
    }

    /// Same node without its children; what `PathEntry` carries.
    fn detached(&self) -> Node {
        Node {
            name: self.name.clone(),
            file_attributes: self.file_attributes,
            general_secondary_flags: self.general_secondary_flags,
            first_cluster: self.first_cluster,
            valid_data_length: self.valid_data_length,
            data_length: self.data_length,
            created: self.created,
            last_modified: self.last_modified,
            last_accessed: self.last_accessed,
            children: Vec::new(),
        }
    }
}

/// A root-relative path and the node found there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub path: String,
    pub node: Node,
}

/// Flat description of a `PathEntry`, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    pub first_cluster: u32,
    pub fat_chain: bool,
    pub modified: Option<chrono::NaiveDateTime>,
}

impl From<&PathEntry> for EntrySummary {
    fn from(entry: &PathEntry) -> Self {
        EntrySummary {
            path: entry.path.clone(),
            is_directory: entry.node.is_directory(),
            size: entry.node.valid_data_length,
            first_cluster: entry.node.first_cluster,
            fat_chain: entry.node.uses_fat_chain(),
            modified: entry.node.last_modified.to_datetime(),
        }
    }
}

pub struct Tree<'a, R> {
    reader: &'a mut ExfatReader<R>,
    root: Vec<Node>,
    volume_label: Option<String>,
    allocation_bitmap: Option<ClusterRegionEntry>,
    upcase_table: Option<ClusterRegionEntry>,
    loaded: bool,
}

impl<'a, R: Read + Seek> Tree<'a, R> {
    pub fn new(reader: &'a mut ExfatReader<R>) -> Tree<'a, R> {
        Tree {
            reader,
            root: Vec::new(),
            volume_label: None,
            allocation_bitmap: None,
            upcase_table: None,
            loaded: false,
        }
    }

    /// Reads the root directory and, recursively, every directory below it.
    pub fn load(&mut self) -> Result<()> {
        let root_cluster = self.reader.boot_sector()?.first_cluster_of_root_directory;
        let mut visited = HashSet::new();
        visited.insert(root_cluster);

        let entries = self.reader.read_directory(root_cluster, None, true)?;
        let mut root = Vec::new();
        for entry in entries {
            match entry {
                DirectoryEntry::VolumeLabel(label) => self.volume_label = Some(label),
                DirectoryEntry::AllocationBitmap(region) => {
                    // The second bitmap only exists on TexFAT volumes.
                    if self.allocation_bitmap.is_none() {
                        self.allocation_bitmap = Some(region);
                    }
                }
                DirectoryEntry::UpcaseTable(region) => self.upcase_table = Some(region),
                DirectoryEntry::File(set) => root.push(Node::from_entry_set(set)),
            }
        }

        for node in root.iter_mut() {
            check_name(&node.name)?;
            if node.is_directory() {
                load_children(self.reader, node, &mut visited, 1)?;
            }
        }

        tracing::debug!("loaded tree with {} top-level entries", root.len());
        self.root = root;
        self.loaded = true;
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn root(&self) -> &[Node] {
        &self.root
    }

    pub fn volume_label(&self) -> Option<&str> {
        self.volume_label.as_deref()
    }

    pub fn allocation_bitmap(&self) -> Option<&ClusterRegionEntry> {
        self.allocation_bitmap.as_ref()
    }

    pub fn upcase_table(&self) -> Option<&ClusterRegionEntry> {
        self.upcase_table.as_ref()
    }

    /// Every file and directory in the tree, pre-order, in on-disk order.
    pub fn list(&self) -> Vec<PathEntry> {
        let mut entries = Vec::new();
        for node in &self.root {
            collect(node, "", &mut entries);
        }
        entries
    }
}

fn collect(node: &Node, parent: &str, entries: &mut Vec<PathEntry>) {
    let path = if parent.is_empty() {
        node.name.clone()
    } else {
        format!("{}/{}", parent, node.name)
    };
    entries.push(PathEntry {
        path: path.clone(),
        node: node.detached(),
    });
    for child in &node.children {
        collect(child, &path, entries);
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(Error::InvalidFileName(name.to_string()));
    }
    Ok(())
}

fn load_children<R: Read + Seek>(
    reader: &mut ExfatReader<R>,
    node: &mut Node,
    visited: &mut HashSet<u32>,
    depth: usize,
) -> Result<()> {
    if depth > MAX_DIRECTORY_DEPTH {
        return Err(Error::DirectoryTooDeep(MAX_DIRECTORY_DEPTH));
    }
    if node.data_length == 0 {
        return Ok(());
    }
    if !visited.insert(node.first_cluster) {
        return Err(Error::DirectoryLoop(node.first_cluster));
    }

    tracing::trace!("loading directory {:?} at cluster {} (depth {})", node.name, node.first_cluster, depth);
    let entries = reader.read_directory(
        node.first_cluster,
        Some(node.data_length),
        node.uses_fat_chain(),
    )?;

    for entry in entries {
        match entry {
            DirectoryEntry::File(set) => {
                let mut child = Node::from_entry_set(set);
                check_name(&child.name)?;
                if child.is_directory() {
                    load_children(reader, &mut child, visited, depth + 1)?;
                }
                node.children.push(child);
            }
            other => {
                tracing::debug!("ignoring {:?} outside the root directory", other);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ImageBuilder;
    use std::io::Cursor;

    fn load(image: Vec<u8>) -> Vec<PathEntry> {
        let mut reader = ExfatReader::new(Cursor::new(image));
        reader.parse().unwrap();
        let mut tree = Tree::new(&mut reader);
        tree.load().unwrap();
        tree.list()
    }

    #[test]
    fn test_list_paths() {
        let image = ImageBuilder::new()
            .dir("docs")
            .file("docs/readme.txt", b"hello")
            .dir("docs/nested")
            .file("docs/nested/deep.bin", &[1, 2, 3])
            .file("top.txt", b"")
            .build();

        let paths: Vec<String> = load(image).into_iter().map(|entry| entry.path).collect();
        assert_eq!(
            paths,
            vec![
                "docs",
                "docs/readme.txt",
                "docs/nested",
                "docs/nested/deep.bin",
                "top.txt",
            ]
        );
    }

    #[test]
    fn test_nodes_carry_stream_metadata() {
        let image = ImageBuilder::new()
            .fragmented_file("chained.bin", &[7u8; 3000])
            .contiguous_file("flat.bin", &[9u8; 10])
            .build();
        let entries = load(image);

        let chained = entries.iter().find(|e| e.path == "chained.bin").unwrap();
        assert!(chained.node.uses_fat_chain());
        assert_eq!(chained.node.valid_data_length, 3000);
        assert!(chained.node.children.is_empty());

        let flat = entries.iter().find(|e| e.path == "flat.bin").unwrap();
        assert!(!flat.node.uses_fat_chain());
        assert_eq!(flat.node.valid_data_length, 10);
    }

    #[test]
    fn test_volume_metadata() {
        let image = ImageBuilder::new().label("CAMERA").build();
        let mut reader = ExfatReader::new(Cursor::new(image));
        reader.parse().unwrap();
        let mut tree = Tree::new(&mut reader);
        tree.load().unwrap();

        assert!(tree.is_loaded());
        assert_eq!(tree.volume_label(), Some("CAMERA"));
        assert!(tree.allocation_bitmap().is_some());
        assert!(tree.upcase_table().is_some());
        assert!(tree.list().is_empty());
    }

    #[test]
    fn test_rejects_dot_dot() {
        let image = ImageBuilder::new().file("..", b"escape").build();
        let mut reader = ExfatReader::new(Cursor::new(image));
        reader.parse().unwrap();
        let mut tree = Tree::new(&mut reader);
        assert!(matches!(tree.load(), Err(Error::InvalidFileName(_))));
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("ok.txt").is_ok());
        assert!(check_name("a/b").is_err());
        assert!(check_name("a\\b").is_err());
        assert!(check_name(".").is_err());
        assert!(check_name("").is_err());
    }

    #[test]
    fn test_summary() {
        let image = ImageBuilder::new().file("a.txt", b"abc").build();
        let entries = load(image);
        let summary = EntrySummary::from(&entries[0]);
        assert_eq!(summary.path, "a.txt");
        assert!(!summary.is_directory);
        assert_eq!(summary.size, 3);
        assert!(summary.modified.is_some());

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["path"], "a.txt");
        assert_eq!(json["fat_chain"], true);
        assert_eq!(json["modified"], "2024-03-15T12:30:10");
    }
}
