use clap::{value_parser, Arg, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar};
use indicatif_log_bridge::LogWrapper;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::time::Duration;

use liblinac_delivery::config::Config;
use liblinac_delivery::listener_status::ListenerState;
use liblinac_delivery::process::{process_extract, process_listen};

fn load_config(config_path: &Path) -> Option<Config> {
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    match Config::read_config_file(config_path) {
        Ok(config) => {
            log::info!("Config successfully loaded.");
            Some(config)
        }
        Err(e) => {
            log::error!("{e}");
            None
        }
    }
}

fn run_extract(config: Config, args: &ArgMatches, pb_manager: &MultiProgress) -> bool {
    let (Some(source), Some(path)) = (
        args.get_one::<String>("source").cloned(),
        args.get_one::<String>("file").map(PathBuf::from),
    ) else {
        log::error!("extract needs a source kind and a file");
        return false;
    };
    let angles: Option<Vec<f64>> = args
        .get_many::<f64>("gantry")
        .map(|values| values.copied().collect());
    log::info!(
        "Output Path: {}",
        config
            .output_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default()
    );

    let pb = pb_manager.add(ProgressBar::new_spinner());
    pb.set_message(format!("Extracting {}", path.to_string_lossy()));
    let handle =
        std::thread::spawn(move || process_extract(&config, &source, &path, angles.as_deref()));

    let success = loop {
        std::thread::sleep(Duration::from_millis(200));
        pb.tick();
        if handle.is_finished() {
            match handle.join() {
                Ok(Ok(written)) => {
                    for path in written.iter() {
                        log::info!("Wrote {}", path.to_string_lossy());
                    }
                    break true;
                }
                Ok(Err(e)) => log::error!("Extraction failed with error: {e}"),
                Err(_) => log::error!("Failed to join extraction task!"),
            }
            break false;
        }
    };
    pb.finish_and_clear();
    success
}

fn run_listen(config: Config, args: &ArgMatches, pb_manager: &MultiProgress) -> bool {
    let (Some(ip), Some(dir)) = (
        args.get_one::<String>("ip").cloned(),
        args.get_one::<String>("directory").map(PathBuf::from),
    ) else {
        log::error!("listen needs an ip and a directory");
        return false;
    };
    let max_flushes = args.get_one::<u64>("flushes").copied();

    let pb = pb_manager.add(ProgressBar::new_spinner());
    pb.set_message(format!("Connecting to {ip}"));
    let (tx, rx) = channel();
    let handle = std::thread::spawn(move || process_listen(&config, &ip, &dir, &tx, max_flushes));

    let success = loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(status) => {
                let state = match status.state {
                    ListenerState::Connecting => "connecting",
                    ListenerState::Connected => "connected",
                    ListenerState::Flushed => "recording",
                    ListenerState::Reconnecting => "reconnecting",
                };
                pb.set_message(format!(
                    "{} {state}: {} files, {}",
                    status.ip,
                    status.flushes,
                    human_bytes::human_bytes(status.bytes_written as f64)
                ));
            }
            Err(_) => (),
        }
        pb.tick();

        if handle.is_finished() {
            match handle.join() {
                Ok(Ok(())) => break true,
                Ok(Err(e)) => log::error!("Listening failed with error: {e}"),
                Err(_) => log::error!("Failed to join listening task!"),
            }
            break false;
        }
    };
    pb.finish();
    success
}

fn main() {
    // Create a cli
    let matches = Command::new("linac_delivery_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("extract")
                .about("Extract a delivery and write its meterset map")
                .arg(
                    Arg::new("source")
                        .required(true)
                        .help("Kind of record: monaco, trf, icom or dicom"),
                )
                .arg(Arg::new("file").required(true).help("Record to extract"))
                .arg(
                    Arg::new("gantry")
                        .short('g')
                        .long("gantry")
                        .num_args(1..)
                        .value_parser(value_parser!(f64))
                        .help("Write one map per gantry angle"),
                ),
        )
        .subcommand(
            Command::new("listen")
                .about("Record the iCom stream of a linac")
                .arg(Arg::new("ip").required(true).help("Linac address"))
                .arg(
                    Arg::new("directory")
                        .required(true)
                        .help("Directory to record into"),
                )
                .arg(
                    Arg::new("flushes")
                        .short('n')
                        .long("flushes")
                        .value_parser(value_parser!(u64))
                        .help("Stop after this many files"),
                ),
        )
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .global(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        std::process::exit(1);
    }

    let Some(config_path) = matches.get_one::<String>("path").map(PathBuf::from) else {
        log::error!("A configuration path is required (-p/--path)");
        std::process::exit(1);
    };

    let success = match matches.subcommand() {
        Some(("new", _)) => {
            log::info!(
                "Making a template config at {}...",
                config_path.to_string_lossy()
            );
            match Config::default().write_config_file(&config_path) {
                Ok(()) => true,
                Err(e) => {
                    log::error!("{e}");
                    false
                }
            }
        }
        Some(("extract", args)) => match load_config(&config_path) {
            Some(config) => run_extract(config, args, &pb_manager),
            None => false,
        },
        Some(("listen", args)) => match load_config(&config_path) {
            Some(config) => run_listen(config, args, &pb_manager),
            None => false,
        },
        _ => {
            log::error!("Unknown subcommand, see --help");
            false
        }
    };

    if !success {
        std::process::exit(1);
    }
    log::info!("Done.");
}
