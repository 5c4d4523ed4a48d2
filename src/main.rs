//! Accent - a voice memo recorder that plays back what you just said
//!
//! This is the console entry point: it wires the selected device backend to
//! the coordinators and reads commands from stdin.

use std::sync::Arc;

use accent::cli::{self, Args, Backend};
use accent::console::{self, Console};
use accent::device::mock::{MockMicrophone, MockSpeaker};
use accent::device::{CaptureDevice, OutputDevice};
use accent::{
    CaptureCoordinator, FocusSignal, Orchestrator, PlaybackCoordinator, SessionMetrics, Settings,
};
use anyhow::Context;
use clap::Parser;
use log::info;
use tokio::io::BufReader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments, load settings and initialize logging
    let args = Args::parse();
    let settings = Settings::load_or_default(&args.settings_path())?;
    let diagnostics = cli::init_logging(&args, &settings);

    info!("Starting Accent voice memo console ({:?} devices)", args.device);

    let (microphone, speaker): (Arc<dyn CaptureDevice>, Arc<dyn OutputDevice>) = match args.device
    {
        Backend::Mock => (
            Arc::new(MockMicrophone::new()),
            Arc::new(MockSpeaker::realtime()),
        ),
        #[cfg(feature = "pipewire")]
        Backend::Pipewire => (
            Arc::new(accent::device::pipewire::PipewireMicrophone::default()),
            Arc::new(accent::device::pipewire::PipewireSpeaker::default()),
        ),
    };

    let metrics = Arc::new(SessionMetrics::new());
    let capture = Arc::new(CaptureCoordinator::new(
        microphone,
        settings.capture_options(),
        Arc::clone(&metrics),
    ));
    let playback = Arc::new(PlaybackCoordinator::new(speaker));
    let orchestrator = Arc::new(Orchestrator::new(capture, playback, settings));
    orchestrator
        .launch()
        .await
        .context("failed to prepare audio devices")?;

    let printer = console::spawn_state_printer(&orchestrator);
    let mut console = Console::new(Arc::clone(&orchestrator), diagnostics, metrics);
    println!("accent ready, type help for commands");

    // A console starts out in the foreground
    console.signal(FocusSignal::PageShow).await;

    console
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
        .context("console input failed")?;

    orchestrator.shutdown().await;
    printer.abort();
    Ok(())
}
