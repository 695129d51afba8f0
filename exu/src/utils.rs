use std::error::Error as _;
use std::fs::File;
use std::io::{BufReader, IsTerminal, Result as IoResult};
use std::path::Path;

use exfat::reader::ExfatReader;
use exfat::tree::{PathEntry, Tree};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

pub type ImageReader = ExfatReader<BufReader<File>>;

pub fn get_file_reader(filename: &Path) -> IoResult<BufReader<File>> {
    let file = File::open(filename)?;
    Ok(BufReader::new(file))
}

/// Opens an image and parses its boot sector.
pub fn open_volume(path: &Path) -> Result<ImageReader> {
    let file = get_file_reader(path).map_err(|source| Error::OpenError {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = ExfatReader::new(file);
    reader.parse()?;
    Ok(reader)
}

/// Loads the directory tree; returns every entry and the volume label.
pub fn load_entries(reader: &mut ImageReader) -> Result<(Vec<PathEntry>, Option<String>)> {
    let mut tree = Tree::new(reader);
    tree.load()?;
    Ok((tree.list(), tree.volume_label().map(str::to_string)))
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--debug`.
pub fn initialize_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

pub fn initialize_logging_from_args(matches: &clap::ArgMatches) {
    initialize_logging(matches.is_present("debug"));
}

/// Prints an error and its causes to stderr.
pub fn report(err: &Error) {
    eprintln!("Error: {}", err);
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {}", cause);
        source = cause.source();
    }
}
