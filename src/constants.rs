use std::time::Duration;

// Output stream parameters (what the mixer renders and net serves)
pub const SAMPLE_RATE: u32 = 24000; // 24 kHz, native rate of most TTS providers
pub const BIT_DEPTH: u16 = 16; // 16 bits per sample
pub const CHANNELS: u16 = 2; // Stereo channel

/// Delay between "now" and the earliest instant a freshly enqueued segment may start.
pub const SCHEDULE_LEAD_IN: Duration = Duration::from_millis(100);

/// Simultaneous synthesis requests allowed while prefetching a section.
pub const SYNTHESIS_CONCURRENCY: usize = 3;

/// Provider character limit per synthesis request.
pub const TTS_MAX_CHARS: usize = 4096;

/// Selectable playback rates, slowest first.
pub const RATE_PRESETS: [f64; 5] = [0.75, 1.0, 1.25, 1.5, 2.0];

/// Title used when section detection fails and the whole paper becomes one section.
pub const FALLBACK_SECTION_TITLE: &str = "Full Document";

/// User-facing message for rejected credentials.
pub const INVALID_CREDENTIAL_MESSAGE: &str =
    "The API rejected your credentials, check your key and enter it again.";
