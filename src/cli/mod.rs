//! Command line interface module
//!
//! Argument parsing and the runner that maps each subcommand onto the
//! library: `images` lists what a manifest tree references, `save` fills a
//! bundle, and `push` relocates a bundle and prints the image mapping.

pub mod args;
pub mod runner;

pub use args::{Args, Command, OutputFormat};
pub use runner::Runner;
