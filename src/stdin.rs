use crate::{
    constants::RATE_PRESETS,
    event::{ControlAction, Event, EventBus},
};

/// Maps a key press to a playback control.
pub fn action_for_key(key: u8) -> Option<ControlAction> {
    match key {
        b'p' | b' ' => Some(ControlAction::TogglePlayPause),
        b'1'..=b'5' => Some(ControlAction::SetRate(
            RATE_PRESETS[(key - b'1') as usize],
        )),
        b'v' => Some(ControlAction::ToggleVoice),
        b'r' => Some(ControlAction::Reset),
        b's' => Some(ControlAction::Status),
        b'd' => Some(ControlAction::DismissError),
        b'q' => Some(ControlAction::Quit),
        _ => None,
    }
}

pub const HELP: &str = "Controls: [p] play/pause  [1-5] speed 0.75x-2x  [v] switch voice  [r] reset  [s] status  [d] dismiss error  [q] quit";

/// Reads single key presses from stdin and forwards them as control events.
pub fn start(bus: EventBus) {
    tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        let stdin = stdin.lock();

        for byte in std::io::Read::bytes(stdin) {
            let Ok(key) = byte else {
                warn!("Failed to read from stdin, terminal controls disabled");
                break;
            };

            if let Some(action) = action_for_key(key) {
                bus.send(Event::Control(action));
            }
        }
    });
}
