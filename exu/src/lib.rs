extern crate chrono;
extern crate clap;
extern crate exfat;
extern crate serde_json;

pub mod cli;
pub mod error;
pub mod extract;
pub mod listing;
pub mod utils;
