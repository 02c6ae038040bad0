//! # guider_ctl
//!
//! Command line access to the guider equipment registries and camera option
//! table: list and select equipment, post selection requests, edit options,
//! watch changes, or run a small demo server that owns the segments.
//!
//! # Usage
//!
//! ```bash
//! # Demo server publishing two cameras, one mount and an option
//! guider_ctl serve --camera "ZWO ASI120" --camera Simulator --mount EQMOD --option bitdepth=12
//!
//! # From another terminal
//! guider_ctl list
//! guider_ctl --class mount request 0
//! guider_ctl set-option bitdepth 16
//! guider_ctl --json monitor --option bitdepth
//! ```

#![deny(warnings)]

mod commands;

use clap::{Parser, Subcommand};
use guider_common::config::{ConfigLoader, GuiderConfig, LogLevel};
use guider_common::consts::INVALID_INDEX;
use guider_common::shm::names::{EquipmentClass, ShmNames};
use std::path::PathBuf;

/// Guider equipment registry tool
#[derive(Parser, Debug)]
#[command(name = "guider_ctl")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Inspect, drive and serve the guider equipment registries")]
#[command(long_about = None)]
struct Args {
    /// Equipment class the command applies to
    #[arg(long, global = true, default_value = "camera")]
    class: EquipmentClass,

    /// Namespace prefix of segment and semaphore names (overrides --config)
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Print the published list and the selection
    List,
    /// Print the selected index and name
    Selected,
    /// Select an item directly
    Select {
        /// Index into the published list
        index: u32,
    },
    /// Clear the selection
    Deselect,
    /// Ask the server to select an item ("none" to deselect)
    Request {
        /// Index into the published list, or "none"
        #[arg(value_parser = parse_index)]
        index: u32,
    },
    /// Print camera sub-instances
    Instances,
    /// Print every camera option
    Options,
    /// Set a camera option as a client
    SetOption {
        /// Option name
        name: String,
        /// New value
        #[arg(allow_negative_numbers = true)]
        value: i32,
        /// Lower bound to store with the value
        #[arg(long, requires = "max", allow_negative_numbers = true)]
        min: Option<i32>,
        /// Upper bound to store with the value
        #[arg(long, requires = "min", allow_negative_numbers = true)]
        max: Option<i32>,
    },
    /// Print changes until Ctrl+C
    Monitor {
        /// Sample counters on one thread instead of waiting on events
        #[arg(long)]
        poll: bool,
        /// Camera option to watch (repeatable)
        #[arg(long = "option", value_name = "NAME")]
        options: Vec<String>,
    },
    /// Own the segments, publish the given equipment and apply client
    /// requests until Ctrl+C
    Serve {
        /// Camera name to publish (repeatable)
        #[arg(long = "camera", value_name = "NAME")]
        cameras: Vec<String>,
        /// Mount name to publish (repeatable)
        #[arg(long = "mount", value_name = "NAME")]
        mounts: Vec<String>,
        /// Camera option to publish as NAME=VALUE (repeatable)
        #[arg(long = "option", value_name = "NAME=VALUE", value_parser = parse_option)]
        options: Vec<(String, i32)>,
        /// Keep the segments when exiting
        #[arg(long)]
        keep: bool,
    },
}

fn parse_index(s: &str) -> Result<u32, String> {
    if s.eq_ignore_ascii_case("none") {
        return Ok(INVALID_INDEX);
    }
    s.parse::<u32>()
        .map_err(|e| format!("expected an index or 'none': {e}"))
}

fn parse_option(s: &str) -> Result<(String, i32), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    let value = value
        .trim()
        .parse::<i32>()
        .map_err(|e| format!("invalid value for '{name}': {e}"))?;
    Ok((name.trim().to_string(), value))
}

/// Resolved settings of one invocation.
struct Context {
    config: GuiderConfig,
    names: ShmNames,
    class: EquipmentClass,
    json: bool,
}

fn resolve_config(args: &Args) -> Result<GuiderConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => GuiderConfig::load(path)?,
        None => GuiderConfig::default(),
    };
    if let Some(namespace) = &args.namespace {
        config.shm.namespace = namespace.clone();
    }
    config.validate()?;
    Ok(config)
}

fn log_level(args: &Args, config: &GuiderConfig) -> LogLevel {
    match args.verbose {
        0 if args.config.is_some() => config.shared.log_level,
        0 => LogLevel::Warn,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

/// Span tagging every log line of this invocation with the configured
/// service name.
fn service_span(config: &GuiderConfig) -> tracing::Span {
    tracing::info_span!("guider_ctl", service = %config.shared.service_name)
}

fn main() {
    if let Err(e) = run() {
        eprintln!("guider_ctl: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = resolve_config(&args)?;
    guider_shm::init_tracing(log_level(&args, &config), args.log_json);
    let _service = service_span(&config).entered();

    let ctx = Context {
        names: config.shm.names(),
        config,
        class: args.class,
        json: args.json,
    };

    match args.command {
        Command::List => commands::list(&ctx),
        Command::Selected => commands::selected(&ctx),
        Command::Select { index } => commands::select(&ctx, index),
        Command::Deselect => commands::select(&ctx, INVALID_INDEX),
        Command::Request { index } => commands::request(&ctx, index),
        Command::Instances => commands::instances(&ctx),
        Command::Options => commands::options(&ctx),
        Command::SetOption {
            name,
            value,
            min,
            max,
        } => commands::set_option(&ctx, &name, value, min.zip(max)),
        Command::Monitor { poll, options } => commands::monitor(&ctx, poll, &options),
        Command::Serve {
            cameras,
            mounts,
            options,
            keep,
        } => commands::serve(&ctx, &cameras, &mounts, &options, keep),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_request_none() {
        let args = Args::try_parse_from(["guider_ctl", "--class", "mount", "request", "none"])
            .expect("valid arguments");
        assert_eq!(args.class, EquipmentClass::Mount);
        assert_eq!(
            args.command,
            Command::Request {
                index: INVALID_INDEX
            }
        );
    }

    #[test]
    fn test_parse_serve_options() {
        let args = Args::try_parse_from([
            "guider_ctl",
            "serve",
            "--camera",
            "Simulator",
            "--option",
            "bitdepth=12",
            "--option",
            "gain = -3",
        ])
        .expect("valid arguments");
        let Command::Serve { cameras, options, .. } = args.command else {
            panic!("expected serve");
        };
        assert_eq!(cameras, vec!["Simulator"]);
        assert_eq!(
            options,
            vec![("bitdepth".to_string(), 12), ("gain".to_string(), -3)]
        );
    }

    #[test]
    fn test_set_option_bounds_come_in_pairs() {
        assert!(Args::try_parse_from(["guider_ctl", "set-option", "gain", "5", "--min", "0"]).is_err());
        assert!(
            Args::try_parse_from(["guider_ctl", "set-option", "gain", "5", "--min", "0", "--max", "9"])
                .is_ok()
        );
    }

    #[test]
    fn test_bad_option_syntax_rejected() {
        assert!(parse_option("bitdepth").is_err());
        assert!(parse_option("bitdepth=high").is_err());
    }

    #[test]
    fn test_namespace_flag_overrides_config() {
        let mut file = NamedTempFile::new().expect("temp file");
        writeln!(file, "[shm]\nnamespace = \"fromfile\"").expect("write");

        let path = file.path().to_string_lossy().to_string();
        let args = Args::try_parse_from(["guider_ctl", "--config", &path, "-n", "lab2", "list"])
            .expect("valid arguments");
        let config = resolve_config(&args).expect("config");
        assert_eq!(config.shm.namespace, "lab2");

        let args = Args::try_parse_from(["guider_ctl", "--config", &path, "list"])
            .expect("valid arguments");
        assert_eq!(resolve_config(&args).expect("config").shm.namespace, "fromfile");
    }

    #[test]
    fn test_invalid_namespace_rejected() {
        let args = Args::try_parse_from(["guider_ctl", "-n", "bad/name", "list"])
            .expect("valid arguments");
        assert!(resolve_config(&args).is_err());
    }

    #[test]
    fn test_service_name_tags_logs() {
        let file = NamedTempFile::new().expect("temp file");
        let writer = std::sync::Mutex::new(file.reopen().expect("reopen"));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .finish();

        let mut config = GuiderConfig::default();
        config.shared.service_name = "guider-lab".to_string();
        tracing::subscriber::with_default(subscriber, || {
            let _service = service_span(&config).entered();
            tracing::info!("attached");
        });

        let logged = std::fs::read_to_string(file.path()).expect("read log");
        assert!(logged.contains("service=guider-lab"), "{logged}");
    }

    #[test]
    fn test_verbosity_maps_to_level() {
        let args = Args::try_parse_from(["guider_ctl", "-vv", "list"]).expect("valid arguments");
        assert_eq!(log_level(&args, &GuiderConfig::default()), LogLevel::Trace);
        let args = Args::try_parse_from(["guider_ctl", "list"]).expect("valid arguments");
        assert_eq!(log_level(&args, &GuiderConfig::default()), LogLevel::Warn);
    }
}
