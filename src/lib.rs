//! Command line surface of shmcoord, split out of `main.rs` for testing

pub mod config;
pub mod menu;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use shm_coord_core::WorkerMode;
use std::path::PathBuf;

pub use config::Config;

/// Shared-memory coordination exercises: shared accumulator, shared stack, symmetry checks
#[derive(Parser, Debug, PartialEq)]
#[clap(name = "shmcoord", author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand
    #[clap(subcommand)]
    pub command: Command,

    /// Configuration file
    #[clap(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[clap(short, long, global = true)]
    pub log_level: Option<String>,

    /// Enable debug logging (same as --log-level=debug)
    #[clap(short, long, global = true)]
    pub verbose: bool,
}

/// Commands
#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Sum the numbers in FILES into a shared accumulator, one worker per file
    Sum {
        /// Worker kind (process or thread)
        #[clap(short, long)]
        mode: Option<WorkerMode>,

        /// Result file
        #[clap(short, long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Session id naming the shared objects (random by default)
        #[clap(long)]
        session: Option<String>,

        /// Per-worker deadline in seconds
        #[clap(long, value_name = "N")]
        deadline_secs: Option<u64>,

        /// Print the run report as JSON
        #[clap(long)]
        json: bool,

        /// Input files
        #[clap(required = true)]
        files: Vec<PathBuf>,
    },

    /// Fold one file into a running accumulator (spawned by `sum`)
    #[clap(hide = true)]
    Worker {
        /// Base of the segment names
        #[clap(long)]
        base: Option<String>,

        #[clap(long)]
        session: String,

        /// Worker index, for logs
        #[clap(long, default_value = "0")]
        index: usize,

        file: PathBuf,
    },

    /// Interactive shared stack
    Stack {
        /// Session id; without one every `stack` on this host shares one stack
        #[clap(long)]
        session: Option<String>,
    },

    /// Check whether a matrix is symmetric
    Symmetry {
        /// Matrix file (`n p` then n*n values); a generated 4x4 matrix without it
        file: Option<PathBuf>,

        /// Worker threads (default: from the file, then the config)
        #[clap(short, long)]
        threads: Option<usize>,

        #[clap(long, value_enum, default_value = "threads")]
        strategy: Strategy,

        /// Print the report as JSON
        #[clap(long)]
        json: bool,
    },

    /// Replace a matrix by (A + Aᵀ) / 2
    Symmetrize {
        /// Matrix file; a generated linear matrix without it
        file: Option<PathBuf>,

        #[clap(short, long)]
        threads: Option<usize>,
    },

    /// Remove shared objects left behind by a crashed run
    Cleanup {
        /// Base of the segment names (e.g. shm_sum, shared_stack)
        #[clap(long)]
        base: String,

        #[clap(long)]
        session: Option<String>,
    },

    /// Write a default configuration file
    Init {
        /// Output path
        #[clap(default_value = "shmcoord.toml")]
        path: PathBuf,
    },
}

/// How `symmetry` splits the work
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// One thread per worker over strided rows
    Threads,
    /// rayon parallel iterator
    Rayon,
}

/// Load the configuration file named on the command line, a `shmcoord.toml`
/// in the working directory, or the defaults
pub fn load_config(cli: &Cli) -> Result<Config> {
    if let Some(config_path) = &cli.config {
        Config::from_file(config_path)
    } else if let Some(config_path) = Config::find_config_file() {
        Config::from_file(config_path)
    } else {
        Ok(Config::default())
    }
}

/// Effective log filter: --verbose, then --log-level, then the config
pub fn log_level(cli: &Cli, config: &Config) -> String {
    if cli.verbose {
        "debug".to_string()
    } else {
        cli.log_level.clone().unwrap_or_else(|| config.log_level.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_parsing() {
        let cli = Cli::try_parse_from(["shmcoord", "sum", "a.txt", "b.txt"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Sum {
                mode: None,
                output: None,
                session: None,
                deadline_secs: None,
                json: false,
                files: vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")],
            }
        );
        assert!(!cli.verbose);
        assert_eq!(cli.log_level, None);

        let cli = Cli::try_parse_from([
            "shmcoord", "sum", "--mode", "thread", "-o", "out.txt", "--deadline-secs", "5", "x.txt", "-v",
        ])
        .unwrap();
        match cli.command {
            Command::Sum { mode, output, deadline_secs, .. } => {
                assert_eq!(mode, Some(WorkerMode::Thread));
                assert_eq!(output, Some(PathBuf::from("out.txt")));
                assert_eq!(deadline_secs, Some(5));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(cli.verbose);
    }

    #[test]
    fn test_usage_errors() {
        assert!(Cli::try_parse_from(["shmcoord"]).is_err());
        assert!(Cli::try_parse_from(["shmcoord", "sum"]).is_err());
        assert!(Cli::try_parse_from(["shmcoord", "sum", "--mode", "fork", "a.txt"]).is_err());

        let help = Cli::try_parse_from(["shmcoord", "--help"]).unwrap_err();
        assert!(!help.use_stderr());
    }

    #[test]
    fn test_worker_and_symmetry_parsing() {
        let cli = Cli::try_parse_from([
            "shmcoord", "worker", "--base", "shm_sum", "--session", "abc", "--index", "3", "f.txt",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Command::Worker {
                base: Some("shm_sum".to_string()),
                session: "abc".to_string(),
                index: 3,
                file: PathBuf::from("f.txt"),
            }
        );

        let cli = Cli::try_parse_from(["shmcoord", "symmetry", "--strategy", "rayon", "-t", "8"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Symmetry {
                file: None,
                threads: Some(8),
                strategy: Strategy::Rayon,
                json: false,
            }
        );
    }

    #[test]
    fn test_log_level_precedence() {
        let config = Config {
            log_level: "warn".to_string(),
            ..Config::default()
        };

        let cli = Cli::try_parse_from(["shmcoord", "init"]).unwrap();
        assert_eq!(log_level(&cli, &config), "warn");

        let cli = Cli::try_parse_from(["shmcoord", "--log-level", "trace", "init"]).unwrap();
        assert_eq!(log_level(&cli, &config), "trace");

        let cli = Cli::try_parse_from(["shmcoord", "-l", "trace", "-v", "init"]).unwrap();
        assert_eq!(log_level(&cli, &config), "debug");
    }
}
