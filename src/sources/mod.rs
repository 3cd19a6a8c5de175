//! External content sources the pipeline depends on.
//!
//! Each collaborator is a trait so the orchestrator can be driven by the
//! shipped implementations (poppler for PDFs, an OpenAI-compatible chat API
//! for structuring, an HTTP speech API for narration) or by test doubles.

pub mod llm;
pub mod pdf;
pub mod tts;

use crate::{
    audio::AudioBuffer,
    config::Config,
    credentials::Credentials,
    document::{Page, RawBlock, RawSection},
    error::NarratorResult,
    transport::Voice,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Receives document parsing progress, 0-100.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// Extracts the ordered pages of the document at `path`.
    async fn parse(&self, path: &Path, progress: ProgressFn) -> NarratorResult<Vec<Page>>;
}

#[async_trait]
pub trait SectionExtractor: Send + Sync {
    /// Partitions the pages into titled, 1-indexed inclusive page ranges.
    async fn extract_sections(&self, page_texts: &[String]) -> NarratorResult<Vec<RawSection>>;
}

#[async_trait]
pub trait ContentProcessor: Send + Sync {
    /// Turns one section's pages into ordered narration blocks.
    async fn process_section_text(
        &self,
        section_title: &str,
        section_id: &str,
        page_texts: &[String],
    ) -> NarratorResult<Vec<RawBlock>>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Speaks `text` with `voice`. Ok(None) when there was nothing to say.
    async fn synthesize(&self, text: &str, voice: Voice) -> NarratorResult<Option<AudioBuffer>>;
}

/// The full set of collaborators one pipeline run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub parser: Arc<dyn DocumentParser>,
    pub extractor: Arc<dyn SectionExtractor>,
    pub processor: Arc<dyn ContentProcessor>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// Builds collaborators for the credentials in effect when a run starts.
pub type CollaboratorFactory = Arc<dyn Fn(&Credentials) -> Collaborators + Send + Sync>;

/// Factory for the shipped HTTP-backed collaborators.
pub fn http_factory(config: &Config) -> CollaboratorFactory {
    let config = config.clone();
    Arc::new(move |credentials: &Credentials| {
        let llm = Arc::new(llm::LlmClient::new(&config.llm, &credentials.llm_api_key));
        Collaborators {
            parser: Arc::new(pdf::PopplerParser::default()),
            extractor: llm.clone(),
            processor: llm,
            synthesizer: Arc::new(tts::HttpSpeechSynthesizer::new(
                &config.tts,
                &credentials.tts_api_key,
            )),
        }
    })
}
