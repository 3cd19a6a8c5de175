use crate::transport::Voice;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::{self, Receiver, Sender};

#[derive(Clone)]
pub struct EventBus {
    tx: Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel::<Event>(100);
        Self { tx }
    }

    pub fn send(&self, event: Event) {
        // Nobody listening is fine, events are notifications
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscriber {
        Subscriber::new(self.tx.subscribe())
    }
}

pub struct Subscriber {
    rx: Receiver<Event>,
}

impl Subscriber {
    pub fn new(rx: Receiver<Event>) -> Self {
        Self { rx }
    }

    pub fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        self.rx.try_recv()
    }

    /// Next event, or None once every sender is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => break Some(event),
                Err(RecvError::Closed) => break None,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "EventBus::Subscriber lagging behind senders, skipping {skipped} messages"
                    );
                }
            }
        }
    }
}

/// User commands, from the terminal or any other front end.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlAction {
    TogglePlayPause,
    Play,
    Pause,
    SetRate(f64),
    SetVoice(Voice),
    ToggleVoice,
    Reset,
    DismissError,
    Status,
    Quit,
}

/// Notifications from the playback scheduler.
#[derive(Clone, Debug, PartialEq)]
pub enum PlaybackEvent {
    /// A block's audio reached its scheduled start
    BlockStarted { block_id: String, section: usize },

    /// The first block of a different section started sounding
    SectionStarted { index: usize },

    /// A segment finished playing naturally
    SegmentEnded { block_id: String },

    /// Nothing left to play and the pipeline is done
    Drained,
}

/// Notifications from the pipeline orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    Parsed { pages: usize },
    SectionsDetected { count: usize, fallback: bool },
    SectionReady { index: usize },
    Completed,
    Aborted { reason: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Control(ControlAction),
    Playback(PlaybackEvent),
    Pipeline(PipelineEvent),
}

pub fn debug(bus: &EventBus) {
    let bus = bus.clone();
    tokio::spawn(async move {
        let mut bus = bus.subscribe();
        while let Some(event) = bus.recv().await {
            if matches!(
                event,
                Event::Playback(PlaybackEvent::BlockStarted { .. })
                    | Event::Playback(PlaybackEvent::SegmentEnded { .. })
            ) {
                trace!("Received event: {:?}", event);
            } else {
                debug!("Received event: {:?}", event);
            }
        }
    });
}
