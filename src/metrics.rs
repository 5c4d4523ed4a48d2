//! Counters describing device session churn.
//!
//! One collector is created by the caller and handed to the coordinators, so
//! tests can inspect counts without any process-wide state.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct SessionMetrics {
    devices_acquired: AtomicU64,
    acquisition_failures: AtomicU64,
    devices_released: AtomicU64,
    device_failures: AtomicU64,
    flushes_requested: AtomicU64,
    chunks_received: AtomicU64,
}

/// Point-in-time copy of [`SessionMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub devices_acquired: u64,
    pub acquisition_failures: u64,
    pub devices_released: u64,
    pub device_failures: u64,
    pub flushes_requested: u64,
    pub chunks_received: u64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of devices acquired so far, including this one.
    pub(crate) fn device_acquired(&self) -> u64 {
        self.devices_acquired.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn acquisition_failed(&self) {
        self.acquisition_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn device_released(&self) {
        self.devices_released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn device_failed(&self) {
        self.device_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn flush_requested(&self) {
        self.flushes_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn chunk_received(&self) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            devices_acquired: self.devices_acquired.load(Ordering::Relaxed),
            acquisition_failures: self.acquisition_failures.load(Ordering::Relaxed),
            devices_released: self.devices_released.load(Ordering::Relaxed),
            device_failures: self.device_failures.load(Ordering::Relaxed),
            flushes_requested: self.flushes_requested.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
        }
    }
}
