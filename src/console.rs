//! Line-oriented console driving the orchestrator
//!
//! Reads one command per line. Commands mirror the buttons of a voice memo
//! screen (`record`, `play`, ...) plus raw focus signals (`focus`, `blur`,
//! `show`, `hide`, `visible`, `hidden`) so the listening behavior can be
//! exercised without a window.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use log::debug;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::audio::ClipExporter;
use crate::diagnostics::Diagnostics;
use crate::focus::{FocusMonitor, FocusSignal};
use crate::metrics::SessionMetrics;
use crate::orchestrator::{Command, Orchestrator};

pub const HELP: &str = "\
commands:
  record | r         start or resume recording
  play | p           play back since the last interruption
  pause              pause recording
  stop | s           stop recording and discard it
  restart            stop and start again
  cancel | c         stop playback
  focus | blur | show | hide | visible | hidden
                     simulate window focus signals
  status             coordinator states and counters
  log                diagnostics, newest first
  save [path]        export the last played clip
  open <path>        load a WAV file as the clip to replay
  list               exported files, newest first
  help               this text
  quit | q           exit";

/// One parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Command(Command),
    Focus(FocusSignal),
    Status,
    Log,
    Save(Option<PathBuf>),
    Open(PathBuf),
    List,
    Help,
    Quit,
}

impl FromStr for Input {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(word) = words.next() else {
            return Err("empty command".to_string());
        };
        let argument = words.next().map(PathBuf::from);

        let input = match word.to_lowercase().as_str() {
            "record" | "r" => Self::Command(Command::Record),
            "play" | "p" => Self::Command(Command::Play),
            "pause" => Self::Command(Command::Pause),
            "stop" | "s" => Self::Command(Command::Stop),
            "restart" => Self::Command(Command::Restart),
            "cancel" | "c" => Self::Command(Command::Cancel),
            "status" => Self::Status,
            "log" => Self::Log,
            "save" => Self::Save(argument),
            "open" => Self::Open(argument.ok_or("open needs a path")?),
            "list" => Self::List,
            "help" | "?" => Self::Help,
            "quit" | "q" | "exit" => Self::Quit,
            other => Self::Focus(
                other
                    .parse()
                    .map_err(|_| format!("unknown command '{}', type help", other))?,
            ),
        };
        Ok(input)
    }
}

pub struct Console {
    orchestrator: Arc<Orchestrator>,
    diagnostics: Diagnostics,
    metrics: Arc<SessionMetrics>,
    exporter: ClipExporter,
    focus: FocusMonitor,
}

impl Console {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        diagnostics: Diagnostics,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            orchestrator,
            diagnostics,
            metrics,
            exporter: ClipExporter::new(),
            focus: FocusMonitor::new(),
        }
    }

    pub fn with_exporter(mut self, exporter: ClipExporter) -> Self {
        self.exporter = exporter;
        self
    }

    /// Feed a focus signal, forwarding the edge (if any) to the orchestrator.
    pub async fn signal(&mut self, signal: FocusSignal) -> String {
        match self.focus.observe(signal) {
            Some(event) => match self.orchestrator.handle_focus(event).await {
                Ok(()) => format!("{:?}", event),
                Err(err) => format!("error: {}", err),
            },
            None => {
                debug!(target: "accent::console", "{:?} coalesced", signal);
                String::new()
            }
        }
    }

    /// Run until `quit` or end of input.
    pub async fn run<R, W>(&mut self, input: R, mut output: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let reply = match line.parse::<Input>() {
                Ok(Input::Quit) => break,
                Ok(input) => self.execute(input).await,
                Err(message) => message,
            };
            if !reply.is_empty() {
                output.write_all(reply.as_bytes()).await?;
                output.write_all(b"\n").await?;
                output.flush().await?;
            }
        }
        Ok(())
    }

    pub async fn execute(&mut self, input: Input) -> String {
        match input {
            Input::Command(command) => match self.orchestrator.handle_command(command).await {
                Ok(()) => String::new(),
                Err(err) => format!("error: {}", err),
            },
            Input::Focus(signal) => self.signal(signal).await,
            Input::Status => self.status(),
            Input::Log => self.diagnostics.entries().join("\n"),
            Input::Save(path) => match self.orchestrator.last_clip() {
                Some(clip) => match self.exporter.save(&clip, path.as_deref()) {
                    Ok(path) => format!("saved {}", path.display()),
                    Err(err) => format!("error: {}", err),
                },
                None => "error: nothing to save yet".to_string(),
            },
            Input::Open(path) => match ClipExporter::load(&path) {
                Ok(clip) => {
                    let secs = clip.duration_secs().unwrap_or_default();
                    self.orchestrator.set_last_clip(clip);
                    format!("loaded {:.1}s from {}", secs, path.display())
                }
                Err(err) => format!("error: {}", err),
            },
            Input::List => match self.exporter.list() {
                Ok(paths) => paths
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(err) => format!("error: {}", err),
            },
            Input::Help => HELP.to_string(),
            Input::Quit => String::new(),
        }
    }

    fn status(&self) -> String {
        let capture = self.orchestrator.capture();
        let metrics = serde_json::to_string(&self.metrics.snapshot()).unwrap_or_default();
        format!(
            "capture: {} ({:.1}s, from {:.1}s, {})\nplayback: {}\nfocused: {}\nmetrics: {}",
            capture.state(),
            capture.current_time(),
            capture.run_offset(),
            capture.mime_type(),
            self.orchestrator.playback().state(),
            self.orchestrator.is_focused(),
            metrics
        )
    }
}

/// Print every state change of both coordinators to stdout.
pub fn spawn_state_printer(orchestrator: &Orchestrator) -> JoinHandle<()> {
    let mut capture = orchestrator.capture().subscribe();
    let mut playback = orchestrator.playback().subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                state = capture.recv() => match state {
                    Ok(state) => println!("capture: {}", state),
                    Err(RecvError::Lagged(n)) => println!("capture: {} changes missed", n),
                    Err(RecvError::Closed) => break,
                },
                state = playback.recv() => match state {
                    Ok(state) => println!("playback: {}", state),
                    Err(RecvError::Lagged(n)) => println!("playback: {} changes missed", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{CaptureCoordinator, CaptureOptions, PlaybackCoordinator};
    use crate::device::mock::{MockMicrophone, MockSpeaker};
    use crate::settings::Settings;
    use log::LevelFilter;
    use std::time::Duration;

    #[test]
    fn test_parse_inputs() {
        assert_eq!("r".parse(), Ok(Input::Command(Command::Record)));
        assert_eq!("  Play ".parse(), Ok(Input::Command(Command::Play)));
        assert_eq!("hide".parse(), Ok(Input::Focus(FocusSignal::PageHide)));
        assert_eq!("save".parse(), Ok(Input::Save(None)));
        assert_eq!(
            "save /tmp/memo.wav".parse(),
            Ok(Input::Save(Some(PathBuf::from("/tmp/memo.wav"))))
        );
        assert!("open".parse::<Input>().is_err());
        assert!("dance".parse::<Input>().unwrap_err().contains("dance"));
    }

    fn console(dir: &std::path::Path) -> Console {
        let metrics = Arc::new(SessionMetrics::new());
        let capture = CaptureCoordinator::new(
            Arc::new(MockMicrophone::new()),
            CaptureOptions::default(),
            Arc::clone(&metrics),
        );
        let playback = PlaybackCoordinator::new(Arc::new(MockSpeaker::new()));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(capture),
            Arc::new(playback),
            Settings::default(),
        ));
        Console::new(orchestrator, Diagnostics::new(8, LevelFilter::Off), metrics)
            .with_exporter(ClipExporter::new().with_export_dir(dir))
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_script() {
        let dir = tempfile::tempdir().unwrap();
        let mut console = console(dir.path());
        console.orchestrator.launch().await.unwrap();

        assert_eq!(console.execute(Input::Focus(FocusSignal::Focus)).await, "GainedFocus");
        assert_eq!(console.execute(Input::Focus(FocusSignal::PageShow)).await, "");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(console.execute(Input::Command(Command::Play)).await, "");

        let saved = console.execute(Input::Save(None)).await;
        assert!(saved.starts_with("saved "), "{}", saved);
        assert_eq!(console.execute(Input::List).await.lines().count(), 1);

        let status = console.execute(Input::Status).await;
        assert!(status.starts_with("capture: Paused"), "{}", status);
        assert!(status.contains("\"devices_acquired\":1"), "{}", status);
    }

    #[tokio::test]
    async fn test_run_stops_at_quit() {
        let dir = tempfile::tempdir().unwrap();
        let mut console = console(dir.path());
        let input = tokio::io::BufReader::new(&b"help\nsave\nquit\nrecord\n"[..]);
        let mut output = Vec::new();

        console.run(input, &mut output).await.unwrap();
        let text = String::from_utf8(output).unwrap();
        assert!(text.starts_with("commands:"));
        assert!(text.ends_with("error: nothing to save yet\n"));
        assert_eq!(console.orchestrator.capture().state(), crate::CaptureState::UnInitialized);
    }
}
