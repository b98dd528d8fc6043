use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use keyflush_core::config::{Settings, SourceConfig};
use keyflush_core::generator::GeneratorConfig;
use keyflush_core::sink::SinkType;

pub(super) fn root_cli() -> Command {
    Command::new("keyflush")
        .about("Groups time ordered access logs of several servers into one file per user")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_run_subcommand())
        .subcommand(add_generate_subcommand())
        .subcommand(add_report_subcommand())
}

fn add_run_subcommand() -> Command {
    Command::new("run")
        .about("Reads every source folder and writes the records of each user to the repository")
        .arg(
            Arg::new("sources")
                .help("Source folders, one per server. Defaults to KEYFLUSH_SOURCES")
                .value_parser(value_parser!(PathBuf))
                .num_args(0..)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("repository")
                .long("repository")
                .short('r')
                .help("Directory the per user files are written to")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("sink")
                .long("sink")
                .help("file, file:<dir>, log or blackhole")
                .conflicts_with("repository"),
        )
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .help("Lines read from a source at once")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("flush-every")
                .long("flush-every")
                .help("Ingested batches between flushes, 0 flushes only at the end")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("flush-interval-ms")
                .long("flush-interval-ms")
                .help("Also flush periodically")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("prefix")
                .long("prefix")
                .help("Log file name prefix"),
        )
        .arg(
            Arg::new("suffix")
                .long("suffix")
                .help("Log file name suffix"),
        )
}

fn add_generate_subcommand() -> Command {
    Command::new("generate")
        .about("Generates synthetic access logs for a few servers")
        .arg(
            Arg::new("root")
                .long("root")
                .help("Folder the server folders are created in")
                .default_value(".")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("servers")
                .long("servers")
                .default_value("4")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("files")
                .long("files")
                .help("Log files per server")
                .default_value("10")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("entries")
                .long("entries")
                .help("Lines per log file")
                .default_value("100")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("users")
                .long("users")
                .default_value("10")
                .value_parser(value_parser!(usize)),
        )
}

fn add_report_subcommand() -> Command {
    Command::new("report")
        .about("Prints the first and last time every user was seen in the given folders")
        .arg(
            Arg::new("folders")
                .required(true)
                .num_args(1..)
                .action(ArgAction::Append)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("One JSON object per line")
                .action(ArgAction::SetTrue),
        )
}

/// Applies the flags of `run` on top of the loaded settings.
pub(super) fn apply_run_args(
    settings: &mut Settings,
    args: &ArgMatches,
) -> keyflush_core::Result<()> {
    if let Some(sources) = args.get_many::<PathBuf>("sources") {
        settings.sources = sources.map(SourceConfig::from_path).collect();
    }
    if let Some(repository) = args.get_one::<PathBuf>("repository") {
        settings.sink = SinkType::File {
            repository: repository.clone(),
        };
    }
    if let Some(sink) = args.get_one::<String>("sink") {
        settings.sink = sink.parse()?;
    }
    if let Some(batch_size) = args.get_one::<usize>("batch-size") {
        settings.read_batch_size = *batch_size;
    }
    if let Some(flush_every) = args.get_one::<usize>("flush-every") {
        settings.flush_every = *flush_every;
    }
    if let Some(interval) = args.get_one::<u64>("flush-interval-ms") {
        settings.flush_interval_ms = Some(*interval);
    }
    if let Some(prefix) = args.get_one::<String>("prefix") {
        settings.file_prefix = prefix.clone();
    }
    if let Some(suffix) = args.get_one::<String>("suffix") {
        settings.file_suffix = suffix.clone();
    }
    Ok(())
}

pub(super) fn generator_config(args: &ArgMatches) -> GeneratorConfig {
    let mut config = GeneratorConfig::default();
    if let Some(root) = args.get_one::<PathBuf>("root") {
        config.root = root.clone();
    }
    if let Some(servers) = args.get_one::<usize>("servers") {
        config.servers = *servers;
    }
    if let Some(files) = args.get_one::<usize>("files") {
        config.files = *files;
    }
    if let Some(entries) = args.get_one::<usize>("entries") {
        config.entries = *entries;
    }
    if let Some(users) = args.get_one::<usize>("users") {
        config.users = *users;
    }
    config
}
