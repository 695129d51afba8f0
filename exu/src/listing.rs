//! Read-only views of an image: the entry listing and the volume summary.
use std::io::Write;
use std::path::Path;

use chrono::NaiveDateTime;
use exfat::boot::BootSector;
use exfat::tree::{EntrySummary, PathEntry};

use crate::error::Result;
use crate::utils;

pub fn list(image: &Path, json: bool) -> Result<()> {
    let mut reader = utils::open_volume(image)?;
    let (entries, _label) = utils::load_entries(&mut reader)?;
    let stdout = std::io::stdout();
    write_listing(&mut stdout.lock(), &entries, json)
}

pub fn write_listing<W: Write>(out: &mut W, entries: &[PathEntry], json: bool) -> Result<()> {
    let summaries: Vec<EntrySummary> = entries.iter().map(EntrySummary::from).collect();
    if json {
        serde_json::to_writer_pretty(&mut *out, &summaries)?;
        writeln!(out)?;
        return Ok(());
    }

    for summary in &summaries {
        writeln!(
            out,
            "{:<4} {:>12} {:<19} {}",
            if summary.is_directory { "dir" } else { "file" },
            summary.size,
            format_modified(summary.modified),
            summary.path
        )?;
    }
    writeln!(out, "{} entries", summaries.len())?;
    Ok(())
}

fn format_modified(modified: Option<NaiveDateTime>) -> String {
    modified.map_or_else(|| "-".to_string(), |m| m.format("%Y-%m-%d %H:%M:%S").to_string())
}

pub fn info(image: &Path) -> Result<()> {
    let mut reader = utils::open_volume(image)?;
    let checksum_ok = reader.verify_boot_checksum()?;
    let boot = reader.boot_sector()?.clone();
    let (entries, label) = utils::load_entries(&mut reader)?;

    let stdout = std::io::stdout();
    write_info(&mut stdout.lock(), &boot, label.as_deref(), checksum_ok, entries.len())
}

pub fn write_info<W: Write>(
    out: &mut W,
    boot: &BootSector,
    label: Option<&str>,
    checksum_ok: bool,
    entry_count: usize,
) -> Result<()> {
    writeln!(out, "Volume Label: {}", label.unwrap_or("(none)"))?;
    writeln!(out, "Serial Number: {:08X}", boot.volume_serial_number)?;
    writeln!(out, "Revision: {}", boot.revision())?;
    writeln!(out, "Bytes Per Sector: {}", boot.sector_size())?;
    writeln!(out, "Sectors Per Cluster: {}", boot.sectors_per_cluster())?;
    writeln!(out, "Cluster Size: {} bytes", boot.cluster_size())?;
    writeln!(out, "Cluster Count: {}", boot.cluster_count)?;
    writeln!(out, "Volume Length: {} sectors", boot.volume_length)?;
    writeln!(out, "FAT: sector {} ({} sectors, {} FATs)", boot.fat_offset, boot.fat_length, boot.number_of_fats)?;
    writeln!(out, "Cluster Heap: sector {}", boot.cluster_heap_offset)?;
    writeln!(out, "Root Directory: cluster {}", boot.first_cluster_of_root_directory)?;
    writeln!(out, "Percent In Use: {}%", boot.percent_in_use)?;
    writeln!(out, "Dirty: {}", boot.is_dirty())?;
    writeln!(out, "Boot Checksum: {}", if checksum_ok { "ok" } else { "MISMATCH" })?;
    writeln!(out, "Entries: {}", entry_count)?;
    Ok(())
}
