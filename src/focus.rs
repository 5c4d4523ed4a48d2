//! Window focus tracking.
//!
//! Hosts report focus in several overlapping ways (focus/blur, page show/hide,
//! visibility changes), often two at once for the same edge. [`FocusMonitor`]
//! folds them into a single stream of edges.

use std::str::FromStr;

/// A raw signal from the host window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusSignal {
    Focus,
    Blur,
    PageShow,
    PageHide,
    Visible,
    Hidden,
}

impl FocusSignal {
    fn gains_focus(self) -> bool {
        matches!(self, Self::Focus | Self::PageShow | Self::Visible)
    }
}

impl FromStr for FocusSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "focus" => Ok(Self::Focus),
            "blur" => Ok(Self::Blur),
            "pageshow" | "show" => Ok(Self::PageShow),
            "pagehide" | "hide" => Ok(Self::PageHide),
            "visible" => Ok(Self::Visible),
            "hidden" => Ok(Self::Hidden),
            other => Err(format!("unknown focus signal: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusEvent {
    GainedFocus,
    LostFocus,
}

/// Coalesces [`FocusSignal`]s so no two consecutive events share an edge.
#[derive(Debug, Default)]
pub struct FocusMonitor {
    focused: Option<bool>,
}

impl FocusMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known focus state; the first matching signal is then a repeat.
    pub fn with_focus(focused: bool) -> Self {
        Self {
            focused: Some(focused),
        }
    }

    pub fn is_focused(&self) -> bool {
        self.focused.unwrap_or(false)
    }

    pub fn observe(&mut self, signal: FocusSignal) -> Option<FocusEvent> {
        let gains = signal.gains_focus();
        if self.focused == Some(gains) {
            return None;
        }
        self.focused = Some(gains);
        Some(if gains {
            FocusEvent::GainedFocus
        } else {
            FocusEvent::LostFocus
        })
    }
}
