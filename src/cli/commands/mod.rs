//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod convert;
mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{load_settings_with_options, LoadOptions};

#[derive(Parser)]
#[command(name = "imagesheet")]
#[command(about = "Replace image URLs in spreadsheet cells with embedded images")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Start the web service
    Serve {
        /// Address to bind (port, host, or host:port)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Convert a workbook locally
    Convert {
        /// Workbook to convert
        input: PathBuf,
        /// Output path (default: <input>_with_images.xlsx)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Images downloaded concurrently per batch
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },
}

/// Parse arguments, load settings and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
    };
    let (settings, _config) = load_settings_with_options(options).await;

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| settings.bind.clone());
            serve::cmd_serve(&settings, &bind).await
        }
        Commands::Convert {
            input,
            output,
            concurrency,
        } => convert::cmd_convert(&settings, &input, output, concurrency).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_convert() {
        let cli = Cli::try_parse_from([
            "imagesheet",
            "-v",
            "convert",
            "in.xlsx",
            "-o",
            "out.xlsx",
            "-j",
            "4",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Convert {
                input,
                output,
                concurrency,
            } => {
                assert_eq!(input, PathBuf::from("in.xlsx"));
                assert_eq!(output, Some(PathBuf::from("out.xlsx")));
                assert_eq!(concurrency, Some(4));
            }
            Commands::Serve { .. } => panic!("expected convert"),
        }
    }

    #[test]
    fn test_parse_serve_with_global_config() {
        let cli = Cli::try_parse_from([
            "imagesheet",
            "serve",
            "--bind",
            "0.0.0.0:8080",
            "--config",
            "imagesheet.toml",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("imagesheet.toml")));
        assert!(matches!(
            cli.command,
            Commands::Serve { bind: Some(ref b) } if b == "0.0.0.0:8080"
        ));
    }

    #[test]
    fn test_convert_requires_input() {
        assert!(Cli::try_parse_from(["imagesheet", "convert"]).is_err());
    }
}
