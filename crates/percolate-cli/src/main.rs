use clap::{value_parser, Arg, ArgMatches, Command, ValueHint};
use percolate_cli::input::{RescoreInput, RetentionInput};
use percolate_cli::runner::{Rescorer, RetentionRunner};
use std::io::Write;

fn parameters() -> Arg {
    Arg::new("parameters")
        .required(true)
        .value_parser(clap::builder::NonEmptyStringValueParser::new())
        .help("Path to configuration parameters (JSON file)")
        .value_hint(ValueHint::FilePath)
}

fn threads() -> Arg {
    Arg::new("threads")
        .long("threads")
        .value_parser(value_parser!(u16).range(1..))
        .help("Number of worker threads (default = # of CPUs)")
        .value_hint(ValueHint::Other)
}

fn path(name: &'static str, help: &'static str, hint: ValueHint) -> Arg {
    Arg::new(name)
        .long(name)
        .value_parser(clap::builder::NonEmptyStringValueParser::new())
        .help(help)
        .value_hint(hint)
}

fn configure_pool(threads: usize) -> anyhow::Result<()> {
    log::trace!("using {} worker threads", threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()?;
    Ok(())
}

fn rescore(matches: &ArgMatches) -> anyhow::Result<()> {
    let settings = RescoreInput::from_arguments(matches)?.build()?;
    configure_pool(settings.threads)?;
    Rescorer::new(settings)?.run()
}

fn retention(matches: &ArgMatches) -> anyhow::Result<()> {
    let settings = RetentionInput::from_arguments(matches)?.build()?;
    configure_pool(settings.threads)?;
    RetentionRunner::new(settings)?.run()
}

fn main() -> anyhow::Result<()> {
    // Bare messages, so report lines keep their column layout
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Error)
        .parse_env(env_logger::Env::default().filter_or("PERCOLATE_LOG", "error,percolate=info"))
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    let matches = Command::new("percolate")
        .version(clap::crate_version!())
        .about("Semi-supervised re-ranking of peptide-spectrum matches")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("rescore")
                .about("Train a linear scoring function and estimate q-values")
                .arg(parameters())
                .arg(
                    path(
                        "output_directory",
                        "Path where results will be written. Overrides the directory \
                         specified in the configuration file.",
                        ValueHint::DirPath,
                    )
                    .short('o'),
                )
                .arg(path(
                    "pin",
                    "Path to a percolator-input file. Overrides the input listed in the \
                     configuration file.",
                    ValueHint::FilePath,
                ))
                .arg(threads()),
        )
        .subcommand(
            Command::new("retention")
                .about("Train, select or apply a retention time model")
                .arg(parameters())
                .arg(path(
                    "train",
                    "Peptides with observed retention times. Overrides the configuration file.",
                    ValueHint::FilePath,
                ))
                .arg(path(
                    "test",
                    "Peptides to predict. Overrides the configuration file.",
                    ValueHint::FilePath,
                ))
                .arg(
                    path(
                        "output",
                        "Path where predictions will be written. Overrides the configuration file.",
                        ValueHint::FilePath,
                    )
                    .short('o'),
                )
                .arg(threads()),
        )
        .help_template(
            "{usage-heading} {usage}\n\n\
             {about-with-newline}\n\
             Version {version}\n\n\
             {all-args}{after-help}",
        )
        .get_matches();

    match matches.subcommand() {
        Some(("rescore", sub)) => rescore(sub),
        Some(("retention", sub)) => retention(sub),
        _ => unreachable!("subcommand_required"),
    }
}
