use std::time::Duration;

use tokio::time::Instant;

/// Elapsed recording time across pause/resume cycles.
///
/// `elapsed_before_run` only advances when a run ends; `run_started_at` is set
/// only while a run is in progress. `run_began` is where the latest run
/// started on the timeline and survives the end of that run.
#[derive(Debug, Default, Clone)]
pub struct Timeline {
    elapsed_before_run: Duration,
    run_started_at: Option<Instant>,
    run_began: Duration,
}

impl Timeline {
    pub fn begin_run(&mut self, now: Instant) {
        if self.run_started_at.is_none() {
            self.run_started_at = Some(now);
            self.run_began = self.elapsed_before_run;
        }
    }

    pub fn end_run(&mut self, now: Instant) {
        if let Some(started) = self.run_started_at.take() {
            self.elapsed_before_run += now.saturating_duration_since(started);
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_running(&self) -> bool {
        self.run_started_at.is_some()
    }

    /// Total recorded time in seconds, including the running span.
    pub fn current_time(&self, now: Instant) -> f64 {
        let running = self
            .run_started_at
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();
        (self.elapsed_before_run + running).as_secs_f64()
    }

    /// Where the current (or most recent) run began, in seconds.
    pub fn run_offset(&self) -> f64 {
        self.run_began.as_secs_f64()
    }
}
