//! Serves the mixer output as an endless WAV stream over TCP, so any player
//! that can open a network stream (`ffplay tcp://host:7878`, VLC, ...) can
//! listen to the narration.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use hound::{SampleFormat, WavSpec};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use crate::constants::{BIT_DEPTH, CHANNELS};
use crate::mixer::{MixerOutput, Sample};

pub async fn init(listen_addr: &str, sample_rate: u32, source: MixerOutput) -> Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {listen_addr}"))?;
    info!("Streaming narration on tcp://{}", listener.local_addr()?);

    tokio::spawn(async move {
        loop {
            match accept(&listener, &source, sample_rate).await {
                Ok(addr) => info!("Accepted listener from {}", addr),
                Err(e) => warn!("Failed to accept listener: {:?}", e),
            }
        }
    });

    Ok(())
}

/// WAV header for a stream without a known length.
pub fn stream_header(sample_rate: u32) -> Vec<u8> {
    let spec = WavSpec {
        channels: CHANNELS,
        sample_rate,
        bits_per_sample: BIT_DEPTH,
        sample_format: SampleFormat::Int,
    };
    spec.into_header_for_infinite_file()
}

/// Interleaved little-endian PCM for one chunk.
pub fn encode_samples(samples: &[Sample]) -> Vec<u8> {
    let mut wav_data: Vec<u8> = Vec::with_capacity(samples.len() * 4);

    for (left, right) in samples {
        // Writing into a Vec can't fail
        let _ = WriteBytesExt::write_i16::<LittleEndian>(&mut wav_data, *left);
        let _ = WriteBytesExt::write_i16::<LittleEndian>(&mut wav_data, *right);
    }

    wav_data
}

async fn accept(
    listener: &TcpListener,
    source: &MixerOutput,
    sample_rate: u32,
) -> Result<SocketAddr> {
    let (mut stream, addr) = listener.accept().await?;
    let mut source = source.clone();

    tokio::spawn(async move {
        if let Err(e) = stream.write_all(&stream_header(sample_rate)).await {
            debug!("Failed to write wav header to {addr}: {e}");
            return;
        }

        loop {
            if source.changed().await.is_err() {
                debug!("Mixer stopped, closing stream to {addr}");
                break;
            }

            let samples = source.borrow_and_update().clone();
            if let Err(e) = stream.write_all(&encode_samples(&samples)).await {
                debug!("Listener {addr} went away: {e}");
                break;
            }
        }
    });

    Ok(addr)
}
