//! Logging and output control
//!
//! This module provides the [`Logger`] for user-visible progress output with
//! quiet and verbose switches, and [`init_tracing`] which installs the
//! `tracing` subscriber used for structured diagnostics from the library.

use std::fmt;
use std::io;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Where progress lines are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sink {
    #[default]
    Stdout,
    /// Keeps stdout free for machine-readable output
    Stderr,
}

/// Logger responsible for all user-visible output
#[derive(Debug, Clone)]
pub struct Logger {
    pub verbose: bool,
    pub quiet: bool,
    pub sink: Sink,
    pub start_time: Option<Instant>,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            quiet: false,
            sink: Sink::Stdout,
            start_time: Some(Instant::now()),
        }
    }

    pub fn new_quiet() -> Self {
        Self {
            quiet: true,
            ..Self::new(false)
        }
    }

    /// Send progress to stderr instead of stdout
    pub fn with_stderr(self) -> Self {
        Self {
            sink: Sink::Stderr,
            ..self
        }
    }

    fn emit(&self, line: fmt::Arguments<'_>) {
        if self.quiet {
            return;
        }
        match self.sink {
            Sink::Stdout => println!("{}", line),
            Sink::Stderr => eprintln!("{}", line),
        }
    }

    /// Main section heading
    pub fn section(&self, title: &str) {
        self.emit(format_args!("\n=== {} ===", title));
    }

    /// Sub-section heading
    pub fn subsection(&self, title: &str) {
        self.emit(format_args!("\n--- {} ---", title));
    }

    pub fn info(&self, message: &str) {
        self.emit(format_args!("ℹ️  {}", message));
    }

    pub fn success(&self, message: &str) {
        self.emit(format_args!("✅ {}", message));
    }

    /// Always printed, to stderr, even in quiet mode
    pub fn error(&self, message: &str) {
        eprintln!("❌ ERROR: {}", message);
    }

    /// One line per image transfer
    pub fn step(&self, message: &str) {
        self.emit(format_args!("▶️  {}", message));
    }

    /// Only shown in verbose mode
    pub fn detail(&self, message: &str) {
        if self.verbose {
            self.emit(format_args!("   {}", message));
        }
    }

    pub fn summary(&self, title: &str, items: &[String]) {
        self.emit(format_args!("\n📋 {}", title));
        self.emit(format_args!("{}", "─".repeat(title.len() + 3)));
        for item in items {
            self.emit(format_args!("  • {}", item));
        }
        if items.is_empty() {
            self.emit(format_args!("  (No items to display)"));
        }
    }

    pub fn summary_kv(&self, title: &str, items: &[(&str, String)]) {
        self.subsection(title);
        for (key, value) in items {
            self.emit(format_args!("  {}: {}", key, value));
        }
    }

    /// Time since the logger was created
    pub fn elapsed(&self) -> Duration {
        self.start_time
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }

    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m{}s", secs / 60, secs % 60)
        } else {
            format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise the filter is `debug` for this crate in
/// verbose mode and `warn` everywhere else. Events go to stderr in compact
/// form without timestamps.
pub fn init_tracing(verbose: bool) {
    let default_directive = if verbose {
        "warn,image_relocator=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(format)
        .with_writer(io::stderr)
        .with_filter(filter);

    // A subscriber may already be installed when embedded in another binary.
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
}
