//! Gapless sequential playback of synthesized blocks.
//!
//! Blocks are scheduled back to back on the [AudioClock] as they arrive. The
//! scheduler keeps its own authoritative copies of everything timing depends
//! on (rate, next start instant, in-flight items) and only pushes results out
//! to the [Transport] for display.

use crate::{
    audio::AudioBuffer,
    clock::AudioClock,
    constants::SCHEDULE_LEAD_IN,
    document::Block,
    event::{Event, EventBus, PlaybackEvent},
    lock::PoisonlessLock,
    mixer::{self, Sample},
    transport::{Phase, Transport},
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One block's audio while it is scheduled or sounding.
#[derive(Debug)]
pub struct PlaybackItem {
    pub id: u64,
    pub block_id: String,
    pub section: usize,
    /// Scheduled start on the audio clock, in seconds
    pub start_at: f64,
    /// Live playback rate, follows every rate change
    pub rate: f64,
    pub audio: Arc<AudioBuffer>,
    /// Read cursor into `audio`, in source frames
    pub position: f64,
}

impl PlaybackItem {
    pub fn is_finished(&self) -> bool {
        self.position >= self.audio.frames() as f64
    }
}

/// Read-only view of an in-flight item.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledSegment {
    pub id: u64,
    pub block_id: String,
    pub section: usize,
    pub start_at: f64,
    pub duration_secs: f64,
    pub rate: f64,
}

impl From<&PlaybackItem> for ScheduledSegment {
    fn from(item: &PlaybackItem) -> Self {
        ScheduledSegment {
            id: item.id,
            block_id: item.block_id.clone(),
            section: item.section,
            start_at: item.start_at,
            duration_secs: item.audio.duration_secs(),
            rate: item.rate,
        }
    }
}

struct SchedulerState {
    queue: VecDeque<PlaybackItem>,

    /// Earliest instant the next segment may start. None until something is
    /// scheduled after a stop.
    next_start: Option<f64>,

    rate: f64,
    active_block: Option<String>,
    active_section: Option<usize>,

    /// Audio has been scheduled and has not drained yet
    sounding: bool,

    /// The orchestrator has no more blocks to hand over
    pipeline_finished: bool,

    next_id: u64,

    /// Cancels the deferred "block starts now" updates of the current run
    markers: CancellationToken,
}

impl SchedulerState {
    fn new(rate: f64) -> Self {
        SchedulerState {
            queue: VecDeque::new(),
            next_start: None,
            rate,
            active_block: None,
            active_section: None,
            sounding: false,
            pipeline_finished: false,
            next_id: 0,
            markers: CancellationToken::new(),
        }
    }
}

#[derive(Clone)]
pub struct PlaybackScheduler {
    state: Arc<Mutex<SchedulerState>>,
    clock: AudioClock,
    transport: Transport,
    bus: EventBus,
    lead_in: f64,
}

impl PlaybackScheduler {
    pub fn new(clock: AudioClock, transport: Transport, bus: EventBus) -> Self {
        Self::with_lead_in(clock, transport, bus, SCHEDULE_LEAD_IN)
    }

    pub fn with_lead_in(
        clock: AudioClock,
        transport: Transport,
        bus: EventBus,
        lead_in: Duration,
    ) -> Self {
        let rate = transport.snapshot().playback_rate;
        Self {
            state: Arc::new(Mutex::new(SchedulerState::new(rate))),
            clock,
            transport,
            bus,
            lead_in: lead_in.as_secs_f64(),
        }
    }

    pub fn clock(&self) -> &AudioClock {
        &self.clock
    }

    /// Schedules `block`'s audio right after everything already queued.
    ///
    /// Returns the scheduled start instant, or None for a block without audio.
    pub fn enqueue(&self, block: &Block) -> Option<f64> {
        self.schedule(block, None)
    }

    /// Like [PlaybackScheduler::enqueue], but drops the block if `run` is
    /// already cancelled. The check is made under the queue lock, so a block
    /// of a run cancelled before [PlaybackScheduler::stop] never outlives it.
    pub fn enqueue_for_run(&self, block: &Block, run: &CancellationToken) -> Option<f64> {
        self.schedule(block, Some(run))
    }

    fn schedule(&self, block: &Block, run: Option<&CancellationToken>) -> Option<f64> {
        let Some(audio) = block.audio.clone() else {
            debug!("Block {} has no audio, skipping playback", block.id);
            return None;
        };

        let (id, start, markers, first) = {
            let mut state = self.state.plock();

            if run.is_some_and(|run| run.is_cancelled()) {
                debug!("Dropping block {} of a stopped run", block.id);
                return None;
            }

            let earliest = self.clock.now() + self.lead_in;
            let start = state.next_start.map_or(earliest, |next| next.max(earliest));
            let rate = state.rate;

            // Advance by the duration at the rate in effect right now. A
            // later rate change does not move instants already handed out.
            state.next_start = Some(start + audio.duration_secs() / rate);

            let id = state.next_id;
            state.next_id += 1;

            state.queue.push_back(PlaybackItem {
                id,
                block_id: block.id.clone(),
                section: block.section,
                start_at: start,
                rate,
                audio,
                position: 0.0,
            });

            let first = !state.sounding;
            state.sounding = true;

            (id, start, state.markers.clone(), first)
        };

        debug!(
            "Scheduled block {} at {:.3}s (queue cursor now {:?})",
            block.id,
            start,
            self.next_start()
        );

        if first {
            let phase = if self.clock.is_suspended() {
                Phase::Paused
            } else {
                Phase::Playing
            };
            self.transport.set_phase(phase);
        }

        self.schedule_marker(id, start, markers);

        Some(start)
    }

    /// Flips the active block marker when the segment is due to start.
    fn schedule_marker(&self, id: u64, start: f64, markers: CancellationToken) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = markers.cancelled() => {}
                _ = scheduler.clock.sleep_until(start) => scheduler.activate(id),
            }
        });
    }

    fn activate(&self, id: u64) {
        let started = {
            let mut state = self.state.plock();

            let Some(item) = state.queue.iter().find(|item| item.id == id) else {
                // Stopped, or already played out
                return;
            };
            let block_id = item.block_id.clone();
            let section = item.section;

            let section_changed = state.active_section != Some(section);
            state.active_block = Some(block_id.clone());
            state.active_section = Some(section);

            (block_id, section, section_changed)
        };

        let (block_id, section, section_changed) = started;

        self.transport.set_active_block(Some(block_id.clone()));
        self.bus
            .send(Event::Playback(PlaybackEvent::BlockStarted { block_id, section }));

        if section_changed {
            info!("Now playing section {}", section + 1);
            self.transport.set_current_section(section);
            self.bus
                .send(Event::Playback(PlaybackEvent::SectionStarted { index: section }));
        }
    }

    /// Completion notification for a segment that played out naturally.
    pub fn complete_segment(&self, id: u64) {
        let (block_id, drained) = {
            let mut state = self.state.plock();

            let Some(pos) = state.queue.iter().position(|item| item.id == id) else {
                // Stopped before the notification arrived
                return;
            };
            let Some(item) = state.queue.remove(pos) else {
                return;
            };

            let drained = state.queue.is_empty() && state.pipeline_finished;
            if drained {
                state.active_block = None;
                state.active_section = None;
                state.sounding = false;
            }

            (item.block_id, drained)
        };

        self.bus
            .send(Event::Playback(PlaybackEvent::SegmentEnded { block_id }));

        if drained {
            self.on_drained();
        }
    }

    /// Tells the scheduler no further blocks will arrive for this document.
    pub fn mark_pipeline_finished(&self) {
        let drained = {
            let mut state = self.state.plock();
            state.pipeline_finished = true;

            let drained = state.queue.is_empty();
            if drained {
                state.active_block = None;
                state.active_section = None;
                state.sounding = false;
            }
            drained
        };

        if drained {
            self.on_drained();
        }
    }

    fn on_drained(&self) {
        info!("Playback finished");
        self.transport.set_active_block(None);
        self.transport.finish_playback();
        self.bus.send(Event::Playback(PlaybackEvent::Drained));
    }

    /// Changes the rate for future segments and every segment in flight.
    pub fn set_playback_rate(&self, rate: f64) {
        if !rate.is_finite() || rate <= 0.0 {
            warn!("Ignoring invalid playback rate {rate}");
            return;
        }

        {
            let mut state = self.state.plock();
            state.rate = rate;
            for item in state.queue.iter_mut() {
                item.rate = rate;
            }
        }

        info!("Playback rate set to {rate}x");
        self.transport.set_playback_rate(rate);
    }

    pub fn playback_rate(&self) -> f64 {
        self.state.plock().rate
    }

    /// Suspends the shared clock. No-op if already paused.
    pub fn pause(&self) {
        if self.clock.suspend() {
            info!("Playback paused");
            if self.state.plock().sounding {
                self.transport.set_phase(Phase::Paused);
            }
        }
    }

    /// Resumes the shared clock. No-op if not paused.
    pub fn resume(&self) {
        if self.clock.resume() {
            info!("Playback resumed");
            if self.state.plock().sounding {
                self.transport.set_phase(Phase::Playing);
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.clock.is_suspended()
    }

    /// Halts everything immediately and forgets the schedule.
    ///
    /// Pending marker updates and completion notifications of the stopped
    /// segments are suppressed; the next enqueue starts from scratch.
    pub fn stop(&self) {
        let stopped = {
            let mut state = self.state.plock();
            state.markers.cancel();

            let stopped = state.queue.len();
            let rate = state.rate;
            *state = SchedulerState::new(rate);
            stopped
        };

        debug!("Stopped {stopped} in-flight segments");
        self.transport.set_active_block(None);
    }

    pub fn next_start(&self) -> Option<f64> {
        self.state.plock().next_start
    }

    pub fn active_block(&self) -> Option<String> {
        self.state.plock().active_block.clone()
    }

    pub fn in_flight(&self) -> Vec<ScheduledSegment> {
        self.state
            .plock()
            .queue
            .iter()
            .map(ScheduledSegment::from)
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        self.state.plock().queue.is_empty()
    }

    /// Renders `frames` output frames starting at clock time `chunk_start`
    /// and delivers completion notifications for segments that ran out.
    pub fn render(&self, chunk_start: f64, frames: usize, output_rate: u32) -> Vec<Sample> {
        let (samples, ended) = {
            let mut state = self.state.plock();
            mixer::mix(state.queue.make_contiguous(), chunk_start, frames, output_rate)
        };

        for id in ended {
            self.complete_segment(id);
        }

        samples
    }
}
