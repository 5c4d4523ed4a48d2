//! Command-line interface for Accent
//!
//! Handles argument parsing and logging configuration.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use log::LevelFilter;

use crate::diagnostics::{Diagnostics, DiagnosticsLog};
use crate::settings::Settings;

/// Which device backend drives capture and playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Synthesized tone in, silent speaker out
    Mock,
    /// Default PipeWire source and sink
    #[cfg(feature = "pipewire")]
    Pipewire,
}

/// Accent - voice memo recorder that plays back what you just said
#[derive(Parser, Debug)]
#[command(name = "accent")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Settings file (default: ~/.config/accent/settings.json)
    #[arg(short, long)]
    pub settings: Option<PathBuf>,

    /// Device backend
    #[arg(short, long, value_enum, default_value_t = Backend::Mock)]
    pub device: Backend,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    pub fn settings_path(&self) -> PathBuf {
        self.settings.clone().unwrap_or_else(Settings::default_path)
    }
}

/// Initialize the logging system based on CLI arguments and settings
///
/// Returns the diagnostics ring fed by the same logger.
pub fn init_logging(args: &Args, settings: &Settings) -> Diagnostics {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    // Set accent modules to requested verbosity level
    builder.filter_module("accent", args.log_level());

    // Runtime and audio server internals only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("tokio", args.log_level());
        builder.filter_module("pipewire", args.log_level());
    }

    let console = builder.format_timestamp_millis().build();
    let diagnostics = Diagnostics::new(
        settings.diagnostics_capacity,
        Diagnostics::level_for(settings.debug_level),
    );
    let logger = DiagnosticsLog::new(console, diagnostics.clone());
    let max_level = logger.max_level();

    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(max_level);
    }
    diagnostics
}
