//! Everything one user's narration session owns: credentials, the shared
//! document, the scheduler, and whichever pipeline run is current.
//!
//! Front ends (the terminal controls, the event bus) only talk to [Session].

use crate::{
    clock::AudioClock,
    config::Config,
    credentials::{CredentialStore, Credentials},
    document::{self, Document, SectionStatus, SharedDocument},
    event::{ControlAction, Event, EventBus, PlaybackEvent},
    lock::PoisonlessLock,
    narration::{NarrationWorker, RunControl, VoiceSelection},
    pipeline::{PipelineOrchestrator, PipelineOutcome},
    prefetch::Prefetcher,
    scheduler::PlaybackScheduler,
    sources::CollaboratorFactory,
    transport::{Phase, Transport, TransportState, Voice},
};
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct CredentialState {
    credentials: Option<Credentials>,

    /// A provider rejected the current keys; they must be re-entered
    rejected: bool,
}

struct ActiveRun {
    control: RunControl,

    /// Section bookkeeping outlives an aborted run while its audio plays out
    tracker: CancellationToken,
}

pub struct Session {
    bus: EventBus,
    transport: Transport,
    scheduler: PlaybackScheduler,
    document: SharedDocument,
    voice: VoiceSelection,
    factory: CollaboratorFactory,
    store: CredentialStore,
    credentials: Arc<Mutex<CredentialState>>,
    run: Mutex<Option<ActiveRun>>,
    concurrency: usize,
}

impl Session {
    /// Sets up an idle session, restoring remembered credentials if any.
    pub async fn create(config: &Config, bus: EventBus, factory: CollaboratorFactory) -> Self {
        let transport = Transport::new();
        transport.set_voice(config.playback.default_voice);
        transport.set_playback_rate(config.playback.default_rate);

        let scheduler = PlaybackScheduler::with_lead_in(
            AudioClock::new(),
            transport.clone(),
            bus.clone(),
            Duration::from_millis(config.playback.lead_in_ms),
        );

        let store = CredentialStore::new(&config.credentials_path);
        let credentials = store.load().await;
        if credentials.is_some() {
            info!("Loaded credentials from {}", store.path().display());
        }
        transport.set_credentials_required(credentials.is_none());

        Session {
            bus,
            transport,
            scheduler,
            document: document::shared(Document::default()),
            voice: Arc::new(Mutex::new(config.playback.default_voice)),
            factory,
            store,
            credentials: Arc::new(Mutex::new(CredentialState {
                credentials,
                rejected: false,
            })),
            run: Mutex::new(None),
            concurrency: config.playback.synthesis_concurrency,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn document(&self) -> SharedDocument {
        self.document.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.transport.subscribe()
    }

    pub fn snapshot(&self) -> TransportState {
        self.transport.snapshot()
    }

    /// Usable credentials are present and were not rejected.
    pub fn has_credentials(&self) -> bool {
        let state = self.credentials.plock();
        state.credentials.is_some() && !state.rejected
    }

    /// Stores a new key pair, replacing whatever was entered before.
    pub async fn set_credentials(&self, credentials: Credentials) -> Result<()> {
        if !credentials.is_complete() {
            bail!("Both an LLM key and a TTS key are required");
        }

        self.store.save(&credentials).await?;

        let was_required = {
            let mut state = self.credentials.plock();
            let was_required = state.rejected || state.credentials.is_none();
            *state = CredentialState {
                credentials: Some(credentials),
                rejected: false,
            };
            was_required
        };

        info!("Credentials updated");
        self.transport.set_credentials_required(false);
        if was_required {
            self.dismiss_error();
        }

        Ok(())
    }

    /// Forgets both keys and returns to the upload screen.
    pub async fn logout(&self) -> Result<()> {
        self.reset();
        *self.credentials.plock() = CredentialState::default();
        self.transport.set_credentials_required(true);
        self.store.clear().await?;

        info!("Logged out");
        Ok(())
    }

    /// Discards the current document and starts narrating the one at `path`.
    ///
    /// The returned handle resolves once every section was scheduled, or the
    /// run stopped early; audio may keep playing after that.
    pub fn start(&self, path: impl Into<PathBuf>) -> Result<JoinHandle<PipelineOutcome>> {
        let path = path.into();

        let credentials = {
            let state = self.credentials.plock();
            match &state.credentials {
                Some(credentials) if !state.rejected => credentials.clone(),
                _ => bail!("Enter valid API keys before narrating a document"),
            }
        };

        self.reset();
        info!("Narrating {}", path.display());

        let control = RunControl::new();
        let tracker = CancellationToken::new();

        let worker = NarrationWorker::new(
            (self.factory)(&credentials),
            self.document.clone(),
            self.voice.clone(),
            control.clone(),
        );
        let prefetcher = Prefetcher::new(
            worker.clone(),
            self.document.clone(),
            self.transport.clone(),
            self.bus.clone(),
            self.concurrency,
        );

        self.spawn_section_tracker(tracker.clone(), prefetcher.clone());

        let orchestrator = PipelineOrchestrator::new(
            worker,
            prefetcher,
            self.document.clone(),
            self.scheduler.clone(),
            self.transport.clone(),
            self.bus.clone(),
        );

        *self.run.plock() = Some(ActiveRun { control, tracker });

        let credentials = self.credentials.clone();
        Ok(tokio::spawn(async move {
            let outcome = orchestrator.run_pipeline(&path).await;
            if matches!(outcome, PipelineOutcome::InvalidCredential { .. }) {
                credentials.plock().rejected = true;
            }
            outcome
        }))
    }

    /// Follows playback to keep section statuses current and to prefetch the
    /// section after the one that just started.
    fn spawn_section_tracker(&self, tracker: CancellationToken, prefetcher: Prefetcher) {
        // Subscribe before anything can be scheduled
        let mut events = self.bus.subscribe();
        let document = self.document.clone();
        let transport = self.transport.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = tracker.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Some(Event::Playback(PlaybackEvent::SectionStarted { index })) => {
                        for (i, status) in section_started(&document, index) {
                            transport.set_section_status(i, status);
                        }
                        prefetcher.try_start(index + 1);
                    }
                    Some(Event::Playback(PlaybackEvent::Drained)) => {
                        for (i, status) in playback_drained(&document) {
                            transport.set_section_status(i, status);
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        });
    }

    pub fn play(&self) {
        self.scheduler.resume();
    }

    pub fn pause(&self) {
        self.scheduler.pause();
    }

    /// Suspending before anything is scheduled makes playback start paused.
    pub fn toggle_play_pause(&self) {
        if self.scheduler.is_paused() {
            self.play();
        } else {
            self.pause();
        }
    }

    pub fn set_playback_rate(&self, rate: f64) {
        self.scheduler.set_playback_rate(rate);
    }

    /// Applies to blocks synthesized from now on.
    pub fn set_voice(&self, voice: Voice) {
        *self.voice.plock() = voice;
        info!("Voice set to {voice}");
        self.transport.set_voice(voice);
    }

    pub fn voice(&self) -> Voice {
        *self.voice.plock()
    }

    /// Back to the upload screen: cancels the run, silences playback and
    /// drops the document.
    pub fn reset(&self) {
        if let Some(run) = self.run.plock().take() {
            debug!("Cancelling current run");
            run.control.cancel();
            run.tracker.cancel();
        }

        self.scheduler.stop();
        self.scheduler.clock().resume();
        *self.document.plock() = Document::default();
        self.transport.reset();
    }

    pub fn dismiss_error(&self) {
        self.transport.dismiss_error();

        // Audio left over from an aborted run stays controllable
        if !self.scheduler.is_idle() && self.transport.snapshot().phase == Phase::Idle {
            let phase = if self.scheduler.is_paused() {
                Phase::Paused
            } else {
                Phase::Playing
            };
            self.transport.set_phase(phase);
        }
    }

    pub fn log_status(&self) {
        let state = self.snapshot();
        let progress = self.document.plock().progress();

        info!(
            "{:?} | section {}/{} | block {} | {} at {}x | {:.0}% done",
            state.phase,
            state.current_section + 1,
            state.sections.len(),
            state.active_block.as_deref().unwrap_or("-"),
            state.voice,
            state.playback_rate,
            progress * 100.0
        );
        if let Some(error) = &state.error {
            info!("Error: {error}");
        }
    }

    pub fn handle_control(&self, action: ControlAction) {
        match action {
            ControlAction::TogglePlayPause => self.toggle_play_pause(),
            ControlAction::Play => self.play(),
            ControlAction::Pause => self.pause(),
            ControlAction::SetRate(rate) => self.set_playback_rate(rate),
            ControlAction::SetVoice(voice) => self.set_voice(voice),
            ControlAction::ToggleVoice => self.set_voice(self.voice().toggled()),
            ControlAction::Reset => self.reset(),
            ControlAction::DismissError => self.dismiss_error(),
            ControlAction::Status => self.log_status(),
            // Handled by the binary
            ControlAction::Quit => {}
        }
    }
}

/// Marks section `index` as playing and every earlier playing section done.
/// Returns the changed statuses.
fn section_started(document: &SharedDocument, index: usize) -> Vec<(usize, SectionStatus)> {
    let mut document = document.plock();
    let mut changed = vec![];

    for (i, section) in document.sections.iter_mut().enumerate() {
        if i < index && section.status == SectionStatus::Playing {
            section.status = SectionStatus::Completed;
            changed.push((i, SectionStatus::Completed));
        } else if i == index && section.status != SectionStatus::Playing {
            section.status = SectionStatus::Playing;
            changed.push((i, SectionStatus::Playing));
        }
    }

    changed
}

fn playback_drained(document: &SharedDocument) -> Vec<(usize, SectionStatus)> {
    let mut document = document.plock();
    let mut changed = vec![];

    for (i, section) in document.sections.iter_mut().enumerate() {
        if section.status == SectionStatus::Playing {
            section.status = SectionStatus::Completed;
            changed.push((i, SectionStatus::Completed));
        }
    }

    changed
}

/// Routes control events from the bus to `session`.
pub fn init(bus: &EventBus, session: Arc<Session>) {
    let bus = bus.clone();
    tokio::spawn(async move {
        let mut bus_rx = bus.subscribe();

        while let Some(event) = bus_rx.recv().await {
            if let Event::Control(action) = event {
                session.handle_control(action);
            }
        }
    });
}
