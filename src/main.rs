#[macro_use]
extern crate log;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use paper_narrator::{
    config,
    credentials::Credentials,
    event::{self, ControlAction, Event, EventBus},
    mixer, net,
    pipeline::PipelineOutcome,
    session::{self, Session},
    sources, stdin,
    transport::Voice,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VoiceArg {
    A,
    B,
}

impl From<VoiceArg> for Voice {
    fn from(voice: VoiceArg) -> Self {
        match voice {
            VoiceArg::A => Voice::NarratorA,
            VoiceArg::B => Voice::NarratorB,
        }
    }
}

/// Reads research papers aloud, section by section.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// PDF to narrate
    pdf: Option<PathBuf>,

    /// Config file, defaults to ./Config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Narrator voice
    #[arg(long, value_enum)]
    voice: Option<VoiceArg>,

    /// Initial playback rate
    #[arg(short, long)]
    rate: Option<f64>,

    /// API key for section detection and text processing
    #[arg(long)]
    llm_key: Option<String>,

    /// API key for speech synthesis
    #[arg(long)]
    tts_key: Option<String>,

    /// Forget stored API keys and exit
    #[arg(long)]
    logout: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    // reqwest is built without a default crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load_from(path).await?,
        None => config::load().await?,
    };

    let bus = EventBus::new();
    event::debug(&bus);

    let session = Arc::new(
        Session::create(&config, bus.clone(), sources::http_factory(&config)).await,
    );

    if args.logout {
        session.logout().await?;
        return Ok(());
    }

    match (args.llm_key, args.tts_key) {
        (Some(llm_key), Some(tts_key)) => {
            session
                .set_credentials(Credentials::new(llm_key, tts_key))
                .await?
        }
        (None, None) => {}
        _ => bail!("--llm-key and --tts-key must be given together"),
    }

    if !session.has_credentials() {
        bail!("No API keys stored yet, pass --llm-key and --tts-key");
    }

    let Some(pdf) = args.pdf else {
        bail!("No PDF given");
    };

    if let Some(voice) = args.voice {
        session.set_voice(voice.into());
    }
    if let Some(rate) = args.rate {
        session.set_playback_rate(rate);
    }

    let mixer_output = mixer::init(session.scheduler().clone(), config.output.sample_rate);
    net::init(
        &config.output.listen_addr,
        config.output.sample_rate,
        mixer_output,
    )
    .await?;

    let mut quit_rx = bus.subscribe();
    session::init(&bus, session.clone());
    stdin::start(bus.clone());
    info!("{}", stdin::HELP);

    let pipeline = session.start(pdf)?;
    tokio::spawn(async move {
        match pipeline.await {
            Ok(PipelineOutcome::Completed) => info!("Every section is ready"),
            Ok(PipelineOutcome::Cancelled) => {}
            Ok(outcome) => warn!("Narration stopped early: {outcome:?}"),
            Err(e) => error!("Pipeline task failed: {e:?}"),
        }
    });

    let quit = async {
        while let Some(event) = quit_rx.recv().await {
            if event == Event::Control(ControlAction::Quit) {
                break;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = quit => {}
    }

    session.reset();
    Ok(())
}
