mod analyser;
mod plugins;
mod ui;

use analyser::capture::CaptureParser;
use analyser::{conn_type, idle, rtt};
use clap::{ArgAction, Parser};
use log::LevelFilter;
use plugins::AnalyserPipeline;
use std::collections::BTreeSet;
use std::fs::File;
use std::process;
use ui::{output, Palette};

/// Exit code for an input or decoder failure.
const EXIT_INPUT_ERROR: i32 = 1;
/// Exit code for an argument error (also used by clap itself).
const EXIT_ARGUMENT_ERROR: i32 = 2;

/// sshscope analyses the SSH conversations of a capture file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// pcap/pcapng file to read from
    #[arg(short = 'r', value_name = "file.pcap")]
    file: String,

    /// Procede only these conversations (e.g.: 2,4-6 keeps the second,
    /// fourth, fifth and sixth conversations); implies -S
    #[arg(short = 'n', value_name = "nb", value_parser = parse_numbers)]
    conversations: Option<BTreeSet<usize>>,

    /// Keep conversations which do not look like ssh (slower)
    #[arg(short = 'a', long = "all", action = ArgAction::SetTrue)]
    all: bool,

    /// Specify the tshark binary to call
    #[arg(long = "tshark", value_name = "cmd")]
    tshark: Option<String>,

    /// Show only a one-line summary of each conversation (faster)
    #[arg(short = 's', long = "summary", action = ArgAction::SetTrue, conflicts_with = "full")]
    summary: bool,

    /// Show the full report of each conversation (slower)
    #[arg(short = 'S', long = "no-summary", action = ArgAction::SetTrue)]
    full: bool,

    /// Disable colors in the output
    #[arg(long = "no-colors", action = ArgAction::SetTrue)]
    no_colors: bool,

    /// Disable all extension analysers
    #[arg(long = "no-plugins", action = ArgAction::SetTrue)]
    no_plugins: bool,

    /// List the extension analysers and exit
    #[arg(long = "list-plugins", action = ArgAction::SetTrue)]
    list_plugins: bool,

    /// Print the reports as JSON instead of text
    #[arg(long = "json", action = ArgAction::SetTrue)]
    json: bool,

    /// Print logging messages; multiple -v options increase the verbosity,
    /// maximum is 4
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Store logs in a file instead of standard error
    #[arg(long = "logfile", value_name = "file")]
    logfile: Option<String>,
}

/// Parses a conversation-number set such as `2,4-6`.
fn parse_numbers(txt: &str) -> Result<BTreeSet<usize>, String> {
    let mut numbers = BTreeSet::new();
    for part in txt.split(',') {
        let edges: Vec<&str> = part.split('-').collect();
        match edges.as_slice() {
            [single] => {
                numbers.insert(single.parse().map_err(|_| "not a valid argument")?);
            }
            [low, high] => {
                let low: usize = low.parse().map_err(|_| "not a valid argument")?;
                let high: usize = high.parse().map_err(|_| "not a valid argument")?;
                numbers.extend(low..=high);
            }
            _ => return Err("not a valid argument".to_string()),
        }
    }
    Ok(numbers)
}

/// Maps the -v count to a level and installs the logger, optionally
/// targeting a file. Without -v, logging stays disabled.
fn init_logging(verbose: u8, logfile: Option<&str>) -> Result<(), String> {
    if verbose == 0 {
        return Ok(());
    }
    let level = match verbose {
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    if let Some(path) = logfile {
        let file = File::create(path).map_err(|err| format!("--logfile: {err}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn list_plugins() {
    let pipeline = AnalyserPipeline::standard();
    let descriptions = pipeline.descriptions();
    match descriptions.len() {
        0 => println!("No analyser detected."),
        1 => println!("One analyser detected:"),
        n => println!("{n} analysers detected:"),
    }
    for (name, description) in descriptions {
        println!("\n{name}\n  {description}");
    }
}

fn main() {
    let args = Args::parse();

    if args.verbose > 4 {
        eprintln!("sshscope: error: --verbose: maximum of verbosity is 4");
        process::exit(EXIT_ARGUMENT_ERROR);
    }
    if let Err(message) = init_logging(args.verbose, args.logfile.as_deref()) {
        eprintln!("sshscope: error: {message}");
        process::exit(EXIT_ARGUMENT_ERROR);
    }
    log::info!("Logging set");

    if args.list_plugins {
        list_plugins();
        return;
    }

    let palette = if args.no_colors {
        log::info!("Colors disabled");
        Palette::plain()
    } else {
        Palette::colored()
    };

    match &args.conversations {
        Some(numbers) => log::info!(
            "Conversations to be considered: {}",
            numbers
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        None => log::info!("Conversations to be considered: all"),
    }

    // The expensive datagram pass only runs for the full report.
    let compute_datagrams = (args.conversations.is_some() && !args.summary) || args.full;
    log::info!(
        "Datagrams are {}to be computed",
        if compute_datagrams { "" } else { "not " }
    );

    log::info!("Capture parsing...");
    let parser = CaptureParser::new(compute_datagrams, args.tshark.as_deref());
    let mut connections =
        match parser.parse(&args.file, args.conversations.as_ref(), !args.all) {
            Ok(connections) => connections,
            Err(err) => {
                log::error!("{err}");
                eprintln!("{err}");
                process::exit(EXIT_INPUT_ERROR);
            }
        };

    if compute_datagrams {
        log::info!("RTT computations...");
        for connection in &mut connections {
            rtt::compute(connection);
        }

        log::info!("Idle time computations...");
        for connection in &mut connections {
            if let Err(err) = idle::compute(connection) {
                log::warn!("Idle analysis of connection {}: {err}", connection.nb);
            }
        }

        log::info!("Connection type evaluations...");
        for connection in &mut connections {
            match conn_type::compute(connection) {
                Ok(()) => {}
                Err(err) if err.is_soft() => {
                    log::warn!("Type analysis of connection {}: {err}", connection.nb);
                }
                Err(err) => log::error!(
                    "Type analysis of connection {} crash: {}, {err}",
                    connection.nb,
                    err.kind()
                ),
            }
        }
    }

    let mut pipeline = if compute_datagrams && !args.no_plugins {
        log::info!("Loading analysers...");
        Some(AnalyserPipeline::standard())
    } else {
        log::info!("Extension analysers disabled");
        None
    };

    log::info!("Printing connections...");
    for index in 0..connections.len() {
        let analyser_fields = match pipeline.as_mut() {
            Some(pipeline) => pipeline.analyse_connection(&mut connections[index]),
            None => Vec::new(),
        };
        if args.json {
            continue; // reports are collected below
        }
        if compute_datagrams {
            output::print_full(&connections[index], &analyser_fields, &palette);
        } else {
            output::print_summary(&connections[index], &palette);
        }
    }

    if let Some(pipeline) = pipeline.as_mut() {
        log::info!("Analyse links between connections");
        for block in pipeline.analyse_set(&mut connections) {
            if !args.json {
                output::print_inter_result(&block);
            }
        }
    }

    if args.json {
        match output::data_as_json(&connections) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                log::error!("Failed to serialise the reports: {err}");
                eprintln!("failed to serialise the reports: {err}");
                process::exit(EXIT_INPUT_ERROR);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numbers() {
        let numbers = parse_numbers("2,4-6").unwrap();
        assert_eq!(vec![2, 4, 5, 6], numbers.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_parse_numbers_single() {
        let numbers = parse_numbers("7").unwrap();
        assert_eq!(vec![7], numbers.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_parse_numbers_rejects_garbage() {
        assert!(parse_numbers("2,x").is_err());
        assert!(parse_numbers("1-2-3").is_err());
        assert!(parse_numbers("").is_err());
    }

    #[test]
    fn test_summary_conflicts_with_full() {
        use clap::CommandFactory;
        let result = Args::command().try_get_matches_from(["sshscope", "-r", "x.pcap", "-s", "-S"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["sshscope", "-r", "x.pcap"]);
        assert!(!args.summary);
        assert!(!args.full);
        assert!(!args.all);
        assert_eq!(None, args.conversations);
        assert_eq!(0, args.verbose);
    }
}
