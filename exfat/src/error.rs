use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("not an exFAT volume: file system name is not \"EXFAT   \"")]
    InvalidSignature,

    #[error("invalid boot sector: {0}")]
    InvalidBootSector(String),

    #[error("cluster {0} is outside the cluster heap")]
    InvalidCluster(u32),

    #[error("cluster {0} is marked bad in the FAT")]
    BadCluster(u32),

    #[error("cluster chain ended after {read} of {expected} bytes")]
    ChainTooShort { expected: u64, read: u64 },

    #[error("cluster chain starting at {0} visits more clusters than the volume has")]
    ChainLoop(u32),

    #[error("entry set checksum mismatch: expected {expected:#06x}, computed {actual:#06x}")]
    EntrySetChecksum { expected: u16, actual: u16 },

    #[error("invalid directory entry set: {0}")]
    InvalidEntrySet(String),

    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("directory at cluster {0} is reachable more than once")]
    DirectoryLoop(u32),

    #[error("directories nested deeper than {0} levels")]
    DirectoryTooDeep(usize),
}
