extern crate exu;

use std::path::Path;

use exu::error::{Error, Result};
use exu::extract::{extract_image, ExtractOptions};

fn run(matches: &clap::ArgMatches) -> Result<()> {
    let image_str = matches
        .value_of("filesystem")
        .ok_or_else(|| Error::CliInputError("Filesystem image is required.".to_string()))?;
    let image = Path::new(image_str);

    match matches.subcommand() {
        ("extract", Some(cmd)) => {
            let output = cmd
                .value_of("output")
                .ok_or_else(|| Error::CliInputError("Output directory is required.".to_string()))?;
            let stats = extract_image(image, Path::new(output), &ExtractOptions::default())?;
            println!(
                "Extracted {} files ({} bytes), created {} directories into {} ({} clusters, {} sectors read)",
                stats.files_extracted,
                stats.bytes_written,
                stats.dirs_created,
                output,
                stats.clusters_read,
                stats.sectors_read
            );
        }
        ("list", Some(cmd)) => exu::listing::list(image, cmd.is_present("json"))?,
        ("info", Some(_)) => exu::listing::info(image)?,
        _ => {
            return Err(Error::CliInputError(
                "Unknown subcommand. Use --help for details.".to_string(),
            ))
        }
    }
    Ok(())
}

fn main() {
    let matches = exu::cli::parse_flags();

    exu::utils::initialize_logging_from_args(&matches);

    if let Err(err) = run(&matches) {
        exu::utils::report(&err);
        std::process::exit(1);
    }
}
