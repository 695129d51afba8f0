//! Extraction
//!
//! Turns the flat `(path, node)` enumeration of a volume into directories and
//! files below an output root. Entries are processed one at a time in the
//! order given. Nothing assumes a parent comes before its children: every
//! entry creates whatever ancestors it needs.
//!
//! The first failure ends the run. Entries after it are never touched, so an
//! interrupted extraction is visibly incomplete.
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};

use exfat::reader::ExfatReader;
use exfat::tree::PathEntry;
use tracing::{debug, info};

use crate::error::{ExtractionError, Result, StreamFailure};
use crate::utils;

/// Source of file content: streams `length` bytes of a cluster chain into `sink`.
pub trait StreamFile {
    fn stream_file(
        &mut self,
        first_cluster: u32,
        length: u64,
        use_fat: bool,
        sink: &mut dyn Write,
    ) -> exfat::Result<(u64, u64)>;
}

impl<R: Read + Seek> StreamFile for ExfatReader<R> {
    fn stream_file(
        &mut self,
        first_cluster: u32,
        length: u64,
        use_fat: bool,
        sink: &mut dyn Write,
    ) -> exfat::Result<(u64, u64)> {
        self.write_from_cluster_chain(first_cluster, length, use_fat, sink)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Mode of created directories (Unix only).
    pub dir_mode: u32,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions { dir_mode: 0o755 }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionStats {
    pub dirs_created: usize,
    pub files_extracted: usize,
    pub bytes_written: u64,
    pub clusters_read: u64,
    pub sectors_read: u64,
}

/// Extracts every entry into `output_root`.
pub fn extract<S: StreamFile + ?Sized>(
    streamer: &mut S,
    entries: &[PathEntry],
    output_root: &Path,
    options: &ExtractOptions,
) -> std::result::Result<ExtractionStats, ExtractionError> {
    let root = std::path::absolute(output_root).map_err(|source| ExtractionError::PathResolution {
        path: output_root.to_path_buf(),
        source,
    })?;
    debug!("output root: {}", root.display());

    let mut stats = ExtractionStats::default();
    create_dir(&root, options, &mut stats)?;

    for entry in entries {
        extract_entry(streamer, entry, &root, options, &mut stats)?;
    }
    Ok(stats)
}

/// Opens `image`, loads its tree and extracts all of it into `output_root`.
pub fn extract_image(image: &Path, output_root: &Path, options: &ExtractOptions) -> Result<ExtractionStats> {
    let mut reader = utils::open_volume(image)?;
    let (entries, _label) = utils::load_entries(&mut reader)?;
    info!("{} entries found in {}", entries.len(), image.display());
    Ok(extract(&mut reader, &entries, output_root, options)?)
}

fn extract_entry<S: StreamFile + ?Sized>(
    streamer: &mut S,
    entry: &PathEntry,
    root: &Path,
    options: &ExtractOptions,
    stats: &mut ExtractionStats,
) -> std::result::Result<(), ExtractionError> {
    let target = target_path(root, &entry.path)?;
    let is_directory = entry.node.is_directory();

    let dir_to_create = if is_directory {
        target.as_path()
    } else {
        // target_path always has at least one segment below root
        target.parent().unwrap_or(root)
    };
    info!("Create: {}", display_relative(dir_to_create, root));
    debug!("Dst: {}", dir_to_create.display());
    create_dir(dir_to_create, options, stats)?;

    if is_directory {
        return Ok(());
    }

    info!("Extract: {}", entry.path);
    debug!("Dst: {}", target.display());
    let file = File::create(&target).map_err(|source| ExtractionError::Sink {
        path: target.clone(),
        source,
    })?;
    let mut sink = CountingWriter::new(BufWriter::new(file));

    let expected = entry.node.valid_data_length;
    let (clusters, sectors) = streamer
        .stream_file(
            entry.node.first_cluster,
            expected,
            entry.node.uses_fat_chain(),
            &mut sink,
        )
        .map_err(|source| ExtractionError::Stream {
            path: target.clone(),
            source: StreamFailure::Volume(source),
        })?;

    if sink.written != expected {
        return Err(ExtractionError::Stream {
            path: target,
            source: StreamFailure::ShortStream {
                expected,
                written: sink.written,
            },
        });
    }

    let file = sink
        .inner
        .into_inner()
        .map_err(|err| ExtractionError::Sink {
            path: target.clone(),
            source: err.into_error(),
        })?;
    file.sync_all().map_err(|source| ExtractionError::Sink {
        path: target.clone(),
        source,
    })?;

    info!("({} bytes written.)", expected);
    stats.files_extracted += 1;
    stats.bytes_written += expected;
    stats.clusters_read += clusters;
    stats.sectors_read += sectors;
    Ok(())
}

/// Joins a `/`-separated relative path onto `root`, one plain segment at a time.
pub fn target_path(root: &Path, relative: &str) -> std::result::Result<PathBuf, ExtractionError> {
    let invalid = |reason: &str| ExtractionError::PathResolution {
        path: PathBuf::from(relative),
        source: io::Error::new(io::ErrorKind::InvalidInput, reason.to_string()),
    };

    let mut target = root.to_path_buf();
    let mut segments = 0;
    for segment in relative.split('/').filter(|segment| !segment.is_empty()) {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => target.push(name),
            _ => return Err(invalid("path segment is not a plain name")),
        }
        segments += 1;
    }

    if segments == 0 {
        return Err(invalid("empty path"));
    }
    Ok(target)
}

fn create_dir(
    path: &Path,
    options: &ExtractOptions,
    stats: &mut ExtractionStats,
) -> std::result::Result<(), ExtractionError> {
    if path.is_dir() {
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(options.dir_mode);
    }
    #[cfg(not(unix))]
    let _ = options.dir_mode;

    builder
        .create(path)
        .map_err(|source| ExtractionError::DirectoryCreation {
            path: path.to_path_buf(),
            source,
        })?;
    stats.dirs_created += 1;
    Ok(())
}

fn display_relative(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(relative) if relative.as_os_str().is_empty() => ".".to_string(),
        Ok(relative) => relative.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}

/// Counts what passes through so the byte total can be checked against the
/// declared length.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        CountingWriter { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exfat::entry::{FileAttributes, GeneralSecondaryFlags, Timestamp};
    use exfat::tree::Node;
    use std::collections::HashMap;

    /// In-memory volume: content per first cluster, optionally longer than the
    /// declared length to stand in for cluster slack.
    #[derive(Default)]
    struct FakeVolume {
        content: HashMap<u32, Vec<u8>>,
        fail_at: Option<u32>,
        short_by: u64,
        calls: Vec<(u32, u64, bool)>,
    }

    impl StreamFile for FakeVolume {
        fn stream_file(
            &mut self,
            first_cluster: u32,
            length: u64,
            use_fat: bool,
            sink: &mut dyn Write,
        ) -> exfat::Result<(u64, u64)> {
            self.calls.push((first_cluster, length, use_fat));
            if self.fail_at == Some(first_cluster) {
                return Err(exfat::Error::BadCluster(first_cluster));
            }
            let data = self.content.get(&first_cluster).cloned().unwrap_or_default();
            let take = (length - self.short_by.min(length)) as usize;
            sink.write_all(&data[..take])?;
            Ok((length.div_ceil(1024), length.div_ceil(512)))
        }
    }

    fn node(directory: bool, first_cluster: u32, length: u64, use_fat: bool) -> Node {
        let attributes = if directory {
            FileAttributes::DIRECTORY
        } else {
            FileAttributes::ARCHIVE
        };
        let mut flags = GeneralSecondaryFlags::ALLOCATION_POSSIBLE;
        if !use_fat {
            flags |= GeneralSecondaryFlags::NO_FAT_CHAIN;
        }
        Node {
            name: String::new(),
            file_attributes: FileAttributes(attributes),
            general_secondary_flags: GeneralSecondaryFlags(flags),
            first_cluster,
            valid_data_length: length,
            data_length: length,
            created: Timestamp::default(),
            last_modified: Timestamp::default(),
            last_accessed: Timestamp::default(),
            children: Vec::new(),
        }
    }

    fn dir(path: &str) -> PathEntry {
        PathEntry {
            path: path.to_string(),
            node: node(true, 0, 0, true),
        }
    }

    fn file(path: &str, first_cluster: u32, length: u64) -> PathEntry {
        PathEntry {
            path: path.to_string(),
            node: node(false, first_cluster, length, true),
        }
    }

    #[test]
    fn test_docs_and_empty_file() {
        let out = tempfile::tempdir().unwrap();
        let readme: Vec<u8> = (0..64u8).collect();
        let mut volume = FakeVolume::default();
        volume.content.insert(10, readme.clone());

        let entries = vec![
            dir("docs"),
            file("docs/readme.txt", 10, 42),
            file("image.bin", 0, 0),
        ];
        let stats = extract(&mut volume, &entries, out.path(), &ExtractOptions::default()).unwrap();

        assert!(out.path().join("docs").is_dir());
        assert_eq!(fs::read(out.path().join("docs/readme.txt")).unwrap(), &readme[..42]);
        assert_eq!(fs::read(out.path().join("image.bin")).unwrap().len(), 0);
        assert_eq!(stats.files_extracted, 2);
        assert_eq!(stats.bytes_written, 42);
        assert_eq!(stats.clusters_read, 1);
        assert_eq!(stats.sectors_read, 1);
    }

    #[test]
    fn test_children_before_parents() {
        let out = tempfile::tempdir().unwrap();
        let mut volume = FakeVolume::default();
        volume.content.insert(3, b"deep".to_vec());

        let entries = vec![file("a/b/c/deep.txt", 3, 4), dir("a/b"), dir("a")];
        extract(&mut volume, &entries, out.path(), &ExtractOptions::default()).unwrap();
        assert_eq!(fs::read(out.path().join("a/b/c/deep.txt")).unwrap(), b"deep");
    }

    #[test]
    fn test_directory_creation_is_idempotent() {
        let out = tempfile::tempdir().unwrap();
        let mut volume = FakeVolume::default();
        volume.content.insert(4, b"one".to_vec());
        volume.content.insert(5, b"two".to_vec());

        let entries = vec![
            dir("shared"),
            file("shared/1.txt", 4, 3),
            file("shared/2.txt", 5, 3),
            dir("shared"),
        ];
        let stats = extract(&mut volume, &entries, out.path(), &ExtractOptions::default()).unwrap();
        assert_eq!(stats.dirs_created, 1);
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 1);
        assert_eq!(fs::read_dir(out.path().join("shared")).unwrap().count(), 2);
    }

    #[test]
    fn test_fail_fast() {
        let out = tempfile::tempdir().unwrap();
        let mut volume = FakeVolume::default();
        volume.content.insert(1, b"first".to_vec());
        volume.content.insert(3, b"third".to_vec());
        volume.fail_at = Some(2);

        let entries = vec![
            file("1.txt", 1, 5),
            file("2.txt", 2, 6),
            file("3.txt", 3, 5),
            dir("later"),
        ];
        let err = extract(&mut volume, &entries, out.path(), &ExtractOptions::default()).unwrap_err();

        match &err {
            ExtractionError::Stream {
                source: StreamFailure::Volume(exfat::Error::BadCluster(2)),
                ..
            } => {}
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.path().ends_with("2.txt"));
        assert!(out.path().join("1.txt").exists());
        assert!(!out.path().join("3.txt").exists());
        assert!(!out.path().join("later").exists());
        assert_eq!(volume.calls.len(), 2);
    }

    #[test]
    fn test_overwrites_longer_file() {
        let out = tempfile::tempdir().unwrap();
        fs::write(out.path().join("note.txt"), b"a much longer previous version").unwrap();

        let mut volume = FakeVolume::default();
        volume.content.insert(7, b"new".to_vec());
        extract(&mut volume, &[file("note.txt", 7, 3)], out.path(), &ExtractOptions::default()).unwrap();
        assert_eq!(fs::read(out.path().join("note.txt")).unwrap(), b"new");
    }

    #[test]
    fn test_short_stream_is_an_error() {
        let out = tempfile::tempdir().unwrap();
        let mut volume = FakeVolume {
            short_by: 2,
            ..Default::default()
        };
        volume.content.insert(8, b"12345".to_vec());

        let err = extract(&mut volume, &[file("short.bin", 8, 5)], out.path(), &ExtractOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::Stream {
                source: StreamFailure::ShortStream { expected: 5, written: 3 },
                ..
            }
        ));
    }

    #[test]
    fn test_passes_chain_kind_through() {
        let out = tempfile::tempdir().unwrap();
        let mut volume = FakeVolume::default();
        volume.content.insert(20, vec![1; 8]);
        volume.content.insert(30, vec![2; 8]);

        let entries = vec![
            PathEntry {
                path: "fat.bin".to_string(),
                node: node(false, 20, 8, true),
            },
            PathEntry {
                path: "flat.bin".to_string(),
                node: node(false, 30, 8, false),
            },
        ];
        extract(&mut volume, &entries, out.path(), &ExtractOptions::default()).unwrap();
        assert_eq!(volume.calls, vec![(20, 8, true), (30, 8, false)]);
    }

    #[test]
    fn test_refuses_escaping_paths() {
        let out = tempfile::tempdir().unwrap();
        let root = out.path().join("root");
        let mut volume = FakeVolume::default();
        volume.content.insert(1, b"x".to_vec());

        for bad in ["../escape.txt", "a/../../escape.txt", "./x", ""] {
            let err = extract(&mut volume, &[file(bad, 1, 1)], &root, &ExtractOptions::default()).unwrap_err();
            assert!(
                matches!(err, ExtractionError::PathResolution { .. }),
                "{:?} gave {:?}",
                bad,
                err
            );
        }
        assert!(!out.path().join("escape.txt").exists());
        assert!(volume.calls.is_empty());
    }

    #[test]
    fn test_target_path() {
        let root = Path::new("/out");
        assert_eq!(target_path(root, "a/b.txt").unwrap(), PathBuf::from("/out/a/b.txt"));
        assert_eq!(target_path(root, "/a//b.txt").unwrap(), PathBuf::from("/out/a/b.txt"));
        assert!(target_path(root, "..").is_err());
    }

    #[test]
    fn test_file_where_directory_exists() {
        let out = tempfile::tempdir().unwrap();
        fs::create_dir(out.path().join("taken")).unwrap();
        let mut volume = FakeVolume::default();
        volume.content.insert(1, b"x".to_vec());

        let err = extract(&mut volume, &[file("taken", 1, 1)], out.path(), &ExtractOptions::default()).unwrap_err();
        assert!(matches!(err, ExtractionError::Sink { .. }));
    }

    #[test]
    fn test_directory_where_file_exists() {
        let out = tempfile::tempdir().unwrap();
        fs::write(out.path().join("taken"), b"file").unwrap();
        let mut volume = FakeVolume::default();

        let err = extract(&mut volume, &[dir("taken/sub")], out.path(), &ExtractOptions::default()).unwrap_err();
        assert!(matches!(err, ExtractionError::DirectoryCreation { .. }));
    }

    #[test]
    fn test_creates_missing_output_root() {
        let out = tempfile::tempdir().unwrap();
        let root = out.path().join("not/yet/there");
        let mut volume = FakeVolume::default();

        let stats = extract(&mut volume, &[], &root, &ExtractOptions::default()).unwrap();
        assert!(root.is_dir());
        assert_eq!(stats.dirs_created, 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unwritable_sink_fails_on_close() {
        let out = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/dev/full", out.path().join("full.bin")).unwrap();
        let mut volume = FakeVolume::default();
        volume.content.insert(3, vec![1u8; 100]);

        let err = extract(&mut volume, &[file("full.bin", 3, 100)], out.path(), &ExtractOptions::default())
            .unwrap_err();
        match err {
            ExtractionError::Sink { path, .. } => assert!(path.ends_with("full.bin")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_mode() {
        use std::os::unix::fs::PermissionsExt;

        let out = tempfile::tempdir().unwrap();
        let mut volume = FakeVolume::default();
        let options = ExtractOptions { dir_mode: 0o700 };
        extract(&mut volume, &[dir("private")], out.path(), &options).unwrap();

        let mode = fs::metadata(out.path().join("private")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
