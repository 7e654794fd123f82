//! Kaar CLI - Kubernetes Application Archive

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::error::ErrorKind;
use kaar_core::{CancelToken, KaarConfig};
use tracing_subscriber::EnvFilter;

mod commands;
mod error;
mod exit_codes;
mod util;

use error::{CliError, Result};

#[derive(Parser, Debug)]
#[command(name = "kaar")]
#[command(author = "Kaar Contributors")]
#[command(version)]
#[command(about = "Pack Kubernetes manifests and their container images into one kaarball", long_about = None)]
#[command(after_help = "Examples:\n  kaar -cf app.kaar app/\n  kaar -xf app.kaar out/\n  kaar -tf app.kaar")]
struct Cli {
    /// Create a kaarball from a directory
    #[arg(short = 'c', long)]
    create: bool,

    /// Extract a kaarball into a directory
    #[arg(short = 'x', long)]
    extract: bool,

    /// List the contents of a kaarball
    #[arg(short = 't', long)]
    list: bool,

    /// Operate on the kaarball file given as first argument
    #[arg(short = 'f', long)]
    file: bool,

    /// Print the full per-file and per-image report
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Replace existing files when extracting
    #[arg(long)]
    overwrite: bool,

    /// Index images without fetching or embedding them
    #[arg(long)]
    no_images: bool,

    /// Write extracted images to this directory
    #[arg(long, value_name = "DIR")]
    image_dir: Option<PathBuf>,

    /// Number of files parsed in parallel
    #[arg(long, value_name = "N")]
    jobs: Option<usize>,

    /// Give up on a single image fetch after this long (e.g. 30s, 2m)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    fetch_timeout: Option<Duration>,

    /// Configuration file (default: ~/.config/kaar/config.yaml)
    #[arg(long, value_name = "PATH", env = "KAAR_CONFIG")]
    config: Option<PathBuf>,

    /// ARCHIVE [DIR]
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,
}

/// What to run, after flag validation
#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Create { archive: PathBuf, dir: PathBuf },
    Extract { archive: PathBuf, dir: PathBuf },
    List { archive: PathBuf },
}

impl Cli {
    /// Check flag combinations before any I/O happens
    fn mode(&self) -> Result<Mode> {
        let selected = [self.create, self.extract, self.list]
            .iter()
            .filter(|set| **set)
            .count();
        if selected == 0 {
            return Err(CliError::usage_with_help(
                "one of --create, --extract or --list is required",
                "kaar -cf ARCHIVE DIR | kaar -xf ARCHIVE DIR | kaar -tf ARCHIVE",
            ));
        }
        if selected > 1 {
            return Err(CliError::usage(
                "--create, --extract and --list are mutually exclusive",
            ));
        }
        if !self.file {
            return Err(CliError::usage_with_help(
                "STDIN and STDOUT not supported",
                "Pass -f with the kaarball path",
            ));
        }

        let expected = if self.list { 1 } else { 2 };
        if self.paths.len() != expected {
            return Err(CliError::usage(format!(
                "expected {} path argument(s), got {}",
                expected,
                self.paths.len()
            )));
        }

        let archive = self.paths[0].clone();
        let mode = if self.create {
            Mode::Create {
                archive,
                dir: self.paths[1].clone(),
            }
        } else if self.extract {
            Mode::Extract {
                archive,
                dir: self.paths[1].clone(),
            }
        } else {
            Mode::List { archive }
        };
        Ok(mode)
    }

    /// File configuration with command line overrides
    fn config(&self) -> Result<KaarConfig> {
        let mut config = match &self.config {
            Some(path) => KaarConfig::load_from(&kaar_core::resolve_path(path))?,
            None => KaarConfig::load()?,
        };
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        if self.fetch_timeout.is_some() {
            config.fetch_timeout = self.fetch_timeout;
        }
        config.overwrite |= self.overwrite;
        if self.no_images {
            config.embed_images = false;
        }
        config.verbose = self.verbose;
        config.version = env!("CARGO_PKG_VERSION").to_string();
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("KAAR_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mode = cli.mode()?;
    let config = cli.config()?;

    let (handle, cancel) = CancelToken::pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            handle.cancel();
        }
    });

    match mode {
        Mode::Create { archive, dir } => {
            commands::create::run(&archive, &dir, &config, cancel).await
        }
        Mode::Extract { archive, dir } => {
            commands::extract::run(&archive, &dir, cli.image_dir.as_deref(), &config, cancel).await
        }
        Mode::List { archive } => commands::list::run(&archive, &config),
    }
}

#[tokio::main]
async fn main() {
    // Setup miette for nice error display
    miette::set_panic_hook();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(err) => {
            let _ = err.print();
            std::process::exit(exit_codes::ERROR);
        }
    };
    init_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(()) => exit_codes::SUCCESS,
        Err(err) => {
            let code = err.exit_code();
            eprintln!("{:?}", miette::Report::new(err));
            code
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("kaar").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_bundled_short_flags() {
        let mode = parse(&["-cvf", "app.kaar", "app"]).mode().unwrap();
        assert_eq!(
            mode,
            Mode::Create {
                archive: PathBuf::from("app.kaar"),
                dir: PathBuf::from("app"),
            }
        );

        let mode = parse(&["-tf", "app.kaar"]).mode().unwrap();
        assert_eq!(
            mode,
            Mode::List {
                archive: PathBuf::from("app.kaar")
            }
        );
    }

    #[test]
    fn test_modes_are_exclusive() {
        let err = parse(&["-c", "-x", "-f", "a", "b"]).mode().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));

        let err = parse(&["-f", "a", "b"]).mode().unwrap_err();
        assert!(matches!(err, CliError::Usage { .. }));
    }

    #[test]
    fn test_file_flag_required() {
        let err = parse(&["-x", "a", "b"]).mode().unwrap_err();
        assert!(err.to_string().contains("STDIN and STDOUT not supported"));
    }

    #[test]
    fn test_argument_count() {
        assert!(parse(&["-cf", "a"]).mode().is_err());
        assert!(parse(&["-xf", "a", "b", "c"]).mode().is_err());
        assert!(parse(&["-tf", "a", "b"]).mode().is_err());
    }

    #[test]
    fn test_fetch_timeout_parsing() {
        let cli = parse(&["-cf", "a", "b", "--fetch-timeout", "1m 30s"]);
        assert_eq!(cli.fetch_timeout, Some(Duration::from_secs(90)));
    }
}
