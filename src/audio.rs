//! Decoded narration audio.
//!
//! Synthesized speech arrives as an encoded file (wav, mp3, ...), is decoded
//! with symphonia into interleaved f32 samples and, when the provider needed
//! several requests for one block, concatenated into one contiguous buffer.

use anyhow::{Context, Result};
use rubato::{FftFixedIn, Resampler};
use std::io::Cursor;
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            samples,
        }
    }

    /// A buffer of silence lasting `duration`. Handy for tests and padding.
    pub fn silence(sample_rate: u32, channels: u16, duration: Duration) -> Self {
        let frames = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
        Self::new(sample_rate, channels, vec![0.0; frames * channels.max(1) as usize])
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Playback length at rate 1.0, in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Stereo pair at `frame`; mono is duplicated, extra channels are dropped.
    pub fn frame(&self, frame: usize) -> (f32, f32) {
        let channels = self.channels as usize;
        let base = frame * channels;
        match self.samples.get(base..base + channels) {
            Some([mono]) => (*mono, *mono),
            Some([left, right, ..]) => (*left, *right),
            _ => (0.0, 0.0),
        }
    }

    /// Appends `other` sample-for-sample, converting it to this buffer's
    /// channel count and sample rate first when they differ.
    pub fn append(&mut self, other: AudioBuffer) -> Result<()> {
        let other = remix(other, self.channels);
        let other = if other.sample_rate != self.sample_rate {
            resample(&other, self.sample_rate)?
        } else {
            other
        };

        self.samples.extend(other.samples);
        Ok(())
    }
}

/// Joins chunk buffers in order into one contiguous buffer.
pub fn concat(chunks: Vec<AudioBuffer>) -> Result<Option<AudioBuffer>> {
    let mut chunks = chunks.into_iter();

    let Some(mut joined) = chunks.next() else {
        return Ok(None);
    };

    for chunk in chunks {
        joined.append(chunk)?;
    }

    Ok(Some(joined))
}

/// Converts `buffer` to `channels` channels by averaging down or duplicating up.
fn remix(buffer: AudioBuffer, channels: u16) -> AudioBuffer {
    if buffer.channels == channels {
        return buffer;
    }

    let from = buffer.channels as usize;
    let to = channels as usize;
    let mut samples = Vec::with_capacity(buffer.frames() * to);

    for frame in buffer.samples.chunks_exact(from) {
        let mono = frame.iter().sum::<f32>() / from as f32;
        samples.extend(std::iter::repeat(mono).take(to));
    }

    AudioBuffer::new(buffer.sample_rate, channels, samples)
}

/// Resamples interleaved audio to `target_rate`.
fn resample(buffer: &AudioBuffer, target_rate: u32) -> Result<AudioBuffer> {
    let channels = buffer.channels as usize;
    if buffer.is_empty() {
        return Ok(AudioBuffer::new(target_rate, buffer.channels, vec![]));
    }

    let mut resampler = FftFixedIn::<f64>::new(
        buffer.sample_rate as usize,
        target_rate as usize,
        1024, // chunk size
        2,    // sub-chunks
        channels,
    )
    .context("Failed to create resampler")?;

    // Deinterleave
    let mut input: Vec<Vec<f64>> = vec![Vec::with_capacity(buffer.frames()); channels];
    for frame in buffer.samples.chunks_exact(channels) {
        for (c, sample) in frame.iter().enumerate() {
            input[c].push(*sample as f64);
        }
    }

    let chunk_size = resampler.input_frames_max();
    let total_frames = input[0].len();
    let expected =
        (total_frames as f64 * target_rate as f64 / buffer.sample_rate as f64).round() as usize;

    // The filter shifts everything by `delay` output frames. Keep feeding
    // silence until the delayed tail is out, then cut the delay off the front.
    let delay = resampler.output_delay();
    let mut output: Vec<Vec<f64>> = vec![vec![]; channels];
    let mut chunk_start = 0;

    while output[0].len() < delay + expected {
        let chunk: Vec<Vec<f64>> = input
            .iter()
            .map(|ch| {
                let from = chunk_start.min(total_frames);
                let to = (chunk_start + chunk_size).min(total_frames);
                let mut ch = ch[from..to].to_vec();
                ch.resize(chunk_size, 0.0);
                ch
            })
            .collect();

        let resampled = resampler
            .process(&chunk, None)
            .context("Resampling failed")?;
        for (c, ch) in resampled.into_iter().enumerate() {
            output[c].extend(ch);
        }
        chunk_start += chunk_size;
    }

    let mut samples = Vec::with_capacity(expected * channels);
    for i in delay..delay + expected {
        for ch in &output {
            samples.push(ch[i] as f32);
        }
    }

    Ok(AudioBuffer::new(target_rate, buffer.channels, samples))
}

/// Decodes an encoded audio file held in memory.
pub fn decode(bytes: Vec<u8>, extension: Option<&str>) -> Result<AudioBuffer> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = extension {
        hint.with_extension(extension);
    }

    let format_opts: FormatOptions = Default::default();
    let metadata_opts: MetadataOptions = Default::default();
    let decoder_opts: DecoderOptions = Default::default();

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &format_opts, &metadata_opts)
        .context("Unrecognized audio format")?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .context("Could not find any tracks in audio")?;
    let mut decoder = symphonia::default::get_codecs().make(&track.codec_params, &decoder_opts)?;
    let track_id = track.id;

    let mut sample_rate = track.codec_params.sample_rate.unwrap_or_default();
    let mut channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(1);
    let mut samples = vec![];
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = format.next_packet();

        // Symphonia reports the expected end of stream as UnexpectedEof
        let packet = match packet {
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            packet => packet?,
        };

        if packet.track_id() != track_id {
            continue;
        }

        let audio_buf = decoder.decode(&packet)?;

        if sample_buf.is_none() {
            let spec = *audio_buf.spec();
            sample_rate = spec.rate;
            channels = spec.channels.count() as u16;
            sample_buf = Some(SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec));
        }

        if let Some(buf) = &mut sample_buf {
            buf.copy_interleaved_ref(audio_buf);
            samples.extend_from_slice(buf.samples());
        }
    }

    Ok(AudioBuffer::new(sample_rate, channels, samples))
}
