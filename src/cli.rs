// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `pgflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pgflow",
    version,
    about = "Run a DAG workflow from a TOML definition with an in-process store and worker.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `$PGFLOW_CONFIG`, else `Pgflow.toml` in the current working
    /// directory.
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Flow input as a JSON document.
    #[arg(long, value_name = "JSON", default_value = "{}")]
    pub input: String,

    /// Drive the worker with repeated single poll/execute/await cycles
    /// instead of the continuous loop.
    #[arg(long)]
    pub once: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PGFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the flow, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let args = CliArgs::try_parse_from([
            "pgflow",
            "--config",
            "flows/etl.toml",
            "--input",
            "[1,2]",
            "--once",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some("flows/etl.toml"));
        assert_eq!(args.input, "[1,2]");
        assert!(args.once);
        assert!(!args.dry_run);
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }

    #[test]
    fn input_defaults_to_an_empty_object() {
        let args = CliArgs::try_parse_from(["pgflow"]).unwrap();
        assert_eq!(args.input, "{}");
        assert!(args.config.is_none());
    }
}
