//! Command-line argument parsing

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "image-relocator")]
#[command(about = "Bundle the images referenced by deployment manifests and relocate them into another registry")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Configuration file (YAML or JSON)
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(long = "verbose", short = 'v', global = true)]
    pub verbose: bool,

    /// Quiet mode - only errors and results
    #[arg(long = "quiet", short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Skip TLS certificate verification
    #[arg(long = "skip-tls", short = 'k', global = true)]
    pub skip_tls: bool,

    /// Number of images transferred at once
    #[arg(long = "concurrency", short = 'j', global = true)]
    pub concurrency: Option<usize>,

    /// Username for the destination registry
    #[arg(long = "username", short = 'u', global = true)]
    pub username: Option<String>,

    /// Password for the destination registry
    #[arg(long = "password", short = 'p', global = true)]
    pub password: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the distinct images referenced under a manifest directory
    Images {
        /// Directory (or file) of deployment manifests
        manifest_dir: PathBuf,
    },
    /// Save every referenced image into a bundle directory
    Save {
        /// Directory (or file) of deployment manifests
        manifest_dir: PathBuf,

        /// Bundle directory to write archives into
        #[arg(long = "bundle", short = 'b')]
        bundle: PathBuf,

        /// Leave images that are already in the bundle alone
        #[arg(long = "skip-existing")]
        skip_existing: bool,
    },
    /// Push every bundled image to a destination registry
    Push {
        /// Bundle directory written by `save`
        bundle: PathBuf,

        /// Destination registry host, e.g. registry.example.com:5000
        #[arg(long = "registry", short = 'r')]
        registry: String,

        /// Destination namespace the images are placed under
        #[arg(long = "namespace", short = 'n', default_value = "")]
        namespace: String,

        /// Write the image mapping to this file instead of stdout
        #[arg(long = "output", short = 'o')]
        output: Option<PathBuf>,

        /// Mapping output format
        #[arg(long = "format", short = 'f', value_enum, default_value_t = OutputFormat::Yaml)]
        format: OutputFormat,

        /// Reach the destination registry over plain HTTP
        #[arg(long = "plain-http")]
        plain_http: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Yaml,
    Json,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    /// Validate argument combinations clap cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.global.concurrency == Some(0) {
            return Err("Concurrency must be greater than 0".to_string());
        }
        if self.global.password.is_some() && self.global.username.is_none() {
            return Err("--password requires --username".to_string());
        }
        if let Command::Push { registry, .. } = &self.command {
            if registry.is_empty() || registry.contains("://") || registry.contains('/') {
                return Err(format!(
                    "Registry must be a host name with optional port, got {:?}",
                    registry
                ));
            }
        }
        Ok(())
    }

    /// Whether the command prints its result to stdout
    pub fn writes_results_to_stdout(&self) -> bool {
        matches!(
            self.command,
            Command::Images { .. } | Command::Push { output: None, .. }
        )
    }

    /// Destination registry host, for commands that have one
    pub fn destination_registry(&self) -> Option<&str> {
        match &self.command {
            Command::Push { registry, .. } => Some(registry),
            _ => None,
        }
    }
}
