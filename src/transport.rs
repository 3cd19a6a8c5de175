//! Observable transport state.
//!
//! This is what a front end renders: the pipeline phase, which section and
//! block are sounding, the chosen voice and rate, and the last error. The
//! orchestrator, scheduler and session write it through the transition
//! methods on [Transport]; nothing reads it back to make timing decisions.

use crate::document::{Section, SectionStatus};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum Phase {
    #[default]
    Idle,
    Parsing,
    ExtractingSections,
    ProcessingSection,
    GeneratingVoice,
    Playing,
    Paused,
    Completed,
    Error,
}

impl Phase {
    /// Playback overlays that background progress reporting must not clobber.
    pub fn is_playback(&self) -> bool {
        matches!(self, Phase::Playing | Phase::Paused)
    }
}

/// The two narrator voices offered to the user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum Voice {
    #[default]
    NarratorA,
    NarratorB,
}

impl Voice {
    pub fn toggled(self) -> Self {
        match self {
            Voice::NarratorA => Voice::NarratorB,
            Voice::NarratorB => Voice::NarratorA,
        }
    }
}

impl Display for Voice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Voice::NarratorA => write!(f, "Narrator A"),
            Voice::NarratorB => write!(f, "Narrator B"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SectionSummary {
    pub title: String,
    pub page_start: usize,
    pub page_end: usize,
    pub status: SectionStatus,
}

impl From<&Section> for SectionSummary {
    fn from(section: &Section) -> Self {
        SectionSummary {
            title: section.title.clone(),
            page_start: section.page_start,
            page_end: section.page_end,
            status: section.status,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransportState {
    pub phase: Phase,
    pub current_section: usize,
    pub active_block: Option<String>,
    pub voice: Voice,
    pub playback_rate: f64,
    pub error: Option<String>,

    /// Document parsing progress, 0-100
    pub parse_progress: u8,

    /// One entry per section, for the per-section progress indicator
    pub sections: Vec<SectionSummary>,

    /// Set when the provider rejected a key; cleared by entering new credentials
    pub credentials_required: bool,
}

impl Default for TransportState {
    fn default() -> Self {
        TransportState {
            phase: Phase::Idle,
            current_section: 0,
            active_block: None,
            voice: Voice::default(),
            playback_rate: 1.0,
            error: None,
            parse_progress: 0,
            sections: vec![],
            credentials_required: false,
        }
    }
}

/// Writer half of the transport state. Cloning shares the same state.
#[derive(Clone)]
pub struct Transport {
    tx: Arc<watch::Sender<TransportState>>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(TransportState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.tx.subscribe()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> TransportState {
        self.tx.borrow().clone()
    }

    fn update(&self, f: impl FnOnce(&mut TransportState)) {
        self.tx.send_modify(f);
    }

    /// Unconditional phase change.
    pub fn set_phase(&self, phase: Phase) {
        self.update(|state| {
            if state.phase != phase {
                debug!("Transport phase: {:?} -> {:?}", state.phase, phase);
                state.phase = phase;
            }
        });
    }

    /// Phase change requested by background pipeline progress. Ignored while
    /// audio is playing or paused so playback controls are never interrupted.
    pub fn report_progress(&self, phase: Phase) {
        self.update(|state| {
            if !state.phase.is_playback() && state.phase != Phase::Error {
                state.phase = phase;
            }
        });
    }

    /// Playback ran out. An error raised meanwhile stays visible.
    pub fn finish_playback(&self) {
        self.update(|state| {
            if state.phase != Phase::Error {
                state.phase = Phase::Completed;
            }
        });
    }

    pub fn set_parse_progress(&self, percent: u8) {
        self.update(|state| state.parse_progress = percent.min(100));
    }

    pub fn set_sections(&self, sections: &[Section]) {
        let summaries = sections.iter().map(SectionSummary::from).collect();
        self.update(|state| state.sections = summaries);
    }

    pub fn set_section_status(&self, index: usize, status: SectionStatus) {
        self.update(|state| {
            if let Some(summary) = state.sections.get_mut(index) {
                summary.status = status;
            }
        });
    }

    pub fn set_current_section(&self, index: usize) {
        self.update(|state| state.current_section = index);
    }

    pub fn set_active_block(&self, block: Option<String>) {
        self.update(|state| state.active_block = block);
    }

    pub fn set_voice(&self, voice: Voice) {
        self.update(|state| state.voice = voice);
    }

    pub fn set_playback_rate(&self, rate: f64) {
        self.update(|state| state.playback_rate = rate);
    }

    /// Enters [Phase::Error] with a user-visible message.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        error!("Pipeline error: {message}");
        self.update(|state| {
            state.phase = Phase::Error;
            state.error = Some(message);
        });
    }

    /// Records an error without leaving the current phase, so audio that is
    /// already playing stays under the user's control.
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("Error: {message}");
        self.update(|state| state.error = Some(message));
    }

    pub fn dismiss_error(&self) {
        self.update(|state| {
            state.error = None;
            if state.phase == Phase::Error {
                state.phase = Phase::Idle;
            }
        });
    }

    pub fn set_credentials_required(&self, required: bool) {
        self.update(|state| state.credentials_required = required);
    }

    /// Back to the upload screen. Voice, rate and credential flag survive.
    pub fn reset(&self) {
        self.update(|state| {
            *state = TransportState {
                voice: state.voice,
                playback_rate: state.playback_rate,
                credentials_required: state.credentials_required,
                ..TransportState::default()
            };
        });
    }
}
