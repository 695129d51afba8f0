use clap;

pub fn build_cli<'a, 'b>() -> clap::App<'a, 'b> {
    clap::App::new("exu")
        .version(clap::crate_version!())
        .author(clap::crate_authors!())
        .about("Extract files from an exFAT filesystem image")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .arg(
            clap::Arg::from_usage("-d --debug 'Enable debug output'")
                .global(true)
        )
        .arg(clap::Arg::from_usage(
            "-f, --filesystem <filesystem> 'Path to the exFAT filesystem image'",
        ))
        .subcommand(
            clap::SubCommand::with_name("extract")
                .about("Extract every file and directory of the image")
                .arg(clap::Arg::from_usage("-o, --output <output> 'Output directory to extract files to'").required(true)),
        )
        .subcommand(
            clap::SubCommand::with_name("list")
                .about("List every file and directory of the image")
                .arg(clap::Arg::from_usage("--json 'Print the listing as JSON'")),
        )
        .subcommand(
            clap::SubCommand::with_name("info")
                .about("Show volume geometry and boot sector details"),
        )
}

pub fn parse_flags<'a>() -> clap::ArgMatches<'a> {
    build_cli().get_matches()
}
