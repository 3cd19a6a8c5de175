use crate::{
    clock::AudioClock,
    scheduler::{PlaybackItem, PlaybackScheduler},
};
use tokio::sync::watch;

const TARGET_CHUNK_SIZE: usize = 512;

/// Max drift between the render cursor and the clock before resyncing, in seconds.
const MAX_RENDER_DRIFT: f64 = 0.25;

pub type Sample = (i16, i16);
pub type MixerOutput = watch::Receiver<Vec<Sample>>;

/// Mixes every item sounding within `[chunk_start, chunk_start + frames)`.
///
/// Items advance their read cursor at their own live rate (speeding up a
/// segment also raises its pitch, like a tape). Returns the mixed chunk and
/// the ids of items that ran out of audio during it.
pub fn mix(
    items: &mut [PlaybackItem],
    chunk_start: f64,
    frames: usize,
    output_rate: u32,
) -> (Vec<Sample>, Vec<u64>) {
    let out_rate = output_rate as f64;
    let chunk_end = chunk_start + frames as f64 / out_rate;
    let mut mixed = vec![(0.0f32, 0.0f32); frames];
    let mut ended = vec![];

    for item in items.iter_mut() {
        if item.start_at >= chunk_end {
            // Queue is in start order, the rest start even later
            break;
        }

        let total = item.audio.frames() as f64;
        let step = item.rate * item.audio.sample_rate as f64 / out_rate;

        for (i, out) in mixed.iter_mut().enumerate() {
            if item.position >= total {
                break;
            }
            let t = chunk_start + i as f64 / out_rate;
            if t < item.start_at {
                continue;
            }

            let (left, right) = interpolate(item, item.position);
            out.0 += left;
            out.1 += right;
            item.position += step;
        }

        if item.is_finished() {
            ended.push(item.id);
        }
    }

    let samples = mixed
        .into_iter()
        .map(|(left, right)| (to_i16(left), to_i16(right)))
        .collect();

    (samples, ended)
}

fn interpolate(item: &PlaybackItem, position: f64) -> (f32, f32) {
    let index = position.floor() as usize;
    let frac = (position - index as f64) as f32;
    let (l0, r0) = item.audio.frame(index);
    let (l1, r1) = if index + 1 < item.audio.frames() {
        item.audio.frame(index + 1)
    } else {
        (l0, r0)
    };
    (l0 + (l1 - l0) * frac, r0 + (r1 - r0) * frac)
}

fn to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Starts the render loop, producing `output_rate` stereo chunks in real time.
///
/// While the clock is suspended the loop keeps emitting silence so network
/// listeners stay connected, but nothing advances.
pub fn init(scheduler: PlaybackScheduler, output_rate: u32) -> MixerOutput {
    let (tx, rx) = watch::channel(Default::default());
    let clock: AudioClock = scheduler.clock().clone();

    tokio::spawn(async move {
        let start_time = tokio::time::Instant::now();
        let mut sample_send_count: u64 = 0;
        let mut rendered_until = clock.now();

        let sleep_time = std::time::Duration::from_micros(
            ((TARGET_CHUNK_SIZE as f64 / output_rate as f64) * 1_000_000.0) as u64,
        );

        loop {
            let expected_sent_samples =
                ((start_time.elapsed() + sleep_time).as_secs_f64() * output_rate as f64) as u64;
            let chunk_size = expected_sent_samples.saturating_sub(sample_send_count) as usize;

            let chunk = if clock.is_suspended() {
                rendered_until = clock.now();
                vec![(0, 0); chunk_size]
            } else {
                let now = clock.now();
                if (rendered_until - now).abs() > MAX_RENDER_DRIFT {
                    trace!("Render cursor drifted to {rendered_until:.3}s, resyncing to {now:.3}s");
                    rendered_until = now;
                }
                let chunk = scheduler.render(rendered_until, chunk_size, output_rate);
                rendered_until += chunk_size as f64 / output_rate as f64;
                chunk
            };

            // Keep rendering without listeners, completions depend on it
            tx.send_replace(chunk);
            sample_send_count += chunk_size as u64;

            tokio::time::sleep(sleep_time).await;
        }
    });

    rx
}
