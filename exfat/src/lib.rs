//! exFAT
//! -----
//!
//! Read-only access to exFAT filesystem images.
//!
//! An image is opened with `ExfatReader`, whose `parse` reads and validates
//! the boot sector. `Tree` then walks the directory structure from the root
//! directory and `Tree::list` flattens it into `(path, node)` pairs. File data
//! is pulled out of the cluster heap with
//! `ExfatReader::write_from_cluster_chain`, which follows either a FAT chain or
//! a contiguous run of clusters and writes exactly the requested number of
//! bytes into any `std::io::Write`.
//!
//! ```no_run
//! use std::fs::File;
//! use exfat::reader::ExfatReader;
//! use exfat::tree::Tree;
//!
//! let mut reader = ExfatReader::new(File::open("sdcard.img").unwrap());
//! reader.parse().unwrap();
//!
//! let entries = {
//!     let mut tree = Tree::new(&mut reader);
//!     tree.load().unwrap();
//!     tree.list()
//! };
//!
//! for entry in entries.iter().filter(|e| !e.node.is_directory()) {
//!     let mut content = Vec::new();
//!     reader
//!         .write_from_cluster_chain(
//!             entry.node.first_cluster,
//!             entry.node.valid_data_length,
//!             entry.node.uses_fat_chain(),
//!             &mut content,
//!         )
//!         .unwrap();
//!     println!("{}: {} bytes", entry.path, content.len());
//! }
//! ```
extern crate byteorder;
extern crate chrono;
extern crate serde;
extern crate serde_derive;

pub mod boot;
pub mod entry;
pub mod error;
pub mod reader;
pub mod tree;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{Error, Result};
pub use reader::ExfatReader;
pub use tree::{Node, PathEntry, Tree};
