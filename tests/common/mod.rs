//! Test infrastructure for paper-narrator integration tests.
//!
//! Provides scripted collaborators, a session harness backed by a temporary
//! credentials file, and helpers for waiting on transport state.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

pub use paper_narrator::audio::AudioBuffer;
pub use paper_narrator::config::Config;
pub use paper_narrator::constants::{FALLBACK_SECTION_TITLE, INVALID_CREDENTIAL_MESSAGE};
pub use paper_narrator::credentials::{CredentialStore, Credentials};
pub use paper_narrator::document::{BlockKind, Page, RawBlock, RawSection, SectionStatus};
pub use paper_narrator::error::{NarratorError, NarratorResult};
pub use paper_narrator::event::{Event, EventBus, PipelineEvent, PlaybackEvent, Subscriber};
pub use paper_narrator::pipeline::PipelineOutcome;
pub use paper_narrator::session::Session;
pub use paper_narrator::sources::{
    CollaboratorFactory, Collaborators, ContentProcessor, DocumentParser, ProgressFn,
    SectionExtractor, SpeechSynthesizer,
};
pub use paper_narrator::transport::{Phase, TransportState, Voice};

/// Sample rate of the audio the mock synthesizer produces.
pub const MOCK_RATE: u32 = 24000;

/// Makes sure reqwest finds a crypto provider.
pub fn install_crypto() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Returns the given pages, or fails with the given message.
pub struct MockParser {
    pub pages: Vec<String>,
    pub failure: Option<String>,
}

impl MockParser {
    pub fn with_pages(pages: &[&str]) -> Self {
        Self {
            pages: pages.iter().map(|page| page.to_string()).collect(),
            failure: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            pages: vec![],
            failure: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl DocumentParser for MockParser {
    async fn parse(&self, _path: &Path, progress: ProgressFn) -> NarratorResult<Vec<Page>> {
        if let Some(message) = &self.failure {
            return Err(anyhow::anyhow!(message.clone()).into());
        }

        let total = self.pages.len();
        let pages = self
            .pages
            .iter()
            .enumerate()
            .map(|(i, text)| {
                progress((((i + 1) * 100) / total.max(1)) as u8);
                Page {
                    index: i + 1,
                    text: text.clone(),
                    image: None,
                }
            })
            .collect();

        Ok(pages)
    }
}

/// Returns fixed sections, or fails.
pub struct MockExtractor {
    pub sections: Option<Vec<RawSection>>,
}

impl MockExtractor {
    pub fn with_sections(sections: &[(&str, usize, usize)]) -> Self {
        Self {
            sections: Some(
                sections
                    .iter()
                    .map(|(title, page_start, page_end)| RawSection {
                        title: title.to_string(),
                        page_start: *page_start,
                        page_end: *page_end,
                    })
                    .collect(),
            ),
        }
    }

    pub fn failing() -> Self {
        Self { sections: None }
    }
}

#[async_trait]
impl SectionExtractor for MockExtractor {
    async fn extract_sections(&self, _page_texts: &[String]) -> NarratorResult<Vec<RawSection>> {
        match &self.sections {
            Some(sections) => Ok(sections.clone()),
            None => Err(anyhow::anyhow!("section detection unavailable").into()),
        }
    }
}

/// One TEXT block per page of the section. Sections can be scripted to fail
/// or to reject the key.
#[derive(Default)]
pub struct MockProcessor {
    pub calls: Mutex<Vec<String>>,
    pub titles: Mutex<Vec<String>>,
    pub reject: HashSet<String>,
    pub fail: HashSet<String>,
}

impl MockProcessor {
    pub fn rejecting(section_id: &str) -> Self {
        Self {
            reject: HashSet::from([section_id.to_string()]),
            ..Default::default()
        }
    }

    pub fn failing(section_id: &str) -> Self {
        Self {
            fail: HashSet::from([section_id.to_string()]),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn titles(&self) -> Vec<String> {
        lock(&self.titles).clone()
    }
}

#[async_trait]
impl ContentProcessor for MockProcessor {
    async fn process_section_text(
        &self,
        section_title: &str,
        section_id: &str,
        page_texts: &[String],
    ) -> NarratorResult<Vec<RawBlock>> {
        lock(&self.calls).push(section_id.to_string());
        lock(&self.titles).push(section_title.to_string());

        if self.reject.contains(section_id) {
            return Err(NarratorError::invalid_credential("LLM"));
        }
        if self.fail.contains(section_id) {
            return Err(anyhow::anyhow!("model overloaded").into());
        }

        Ok(page_texts
            .iter()
            .map(|text| RawBlock {
                kind: BlockKind::Text,
                content: text.clone(),
            })
            .collect())
    }
}

/// Produces silence whose length depends on the text. Calls can be slowed
/// down, and texts containing a marker can be made to fail or be rejected.
pub struct MockSynthesizer {
    pub calls: Mutex<Vec<(String, Voice)>>,
    pub delay: Duration,
    pub clip: Duration,
    pub fail_marker: Option<String>,
    pub reject_marker: Option<String>,
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self {
            calls: Mutex::new(vec![]),
            delay: Duration::ZERO,
            clip: Duration::from_millis(200),
            fail_marker: None,
            reject_marker: None,
        }
    }
}

impl MockSynthesizer {
    pub fn calls(&self) -> Vec<(String, Voice)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str, voice: Voice) -> NarratorResult<Option<AudioBuffer>> {
        lock(&self.calls).push((text.to_string(), voice));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(marker) = &self.reject_marker {
            if text.contains(marker.as_str()) {
                return Err(NarratorError::invalid_credential("TTS"));
            }
        }
        if let Some(marker) = &self.fail_marker {
            if text.contains(marker.as_str()) {
                return Err(anyhow::anyhow!("synthesis timed out").into());
            }
        }
        if text.trim().is_empty() {
            return Ok(None);
        }

        Ok(Some(AudioBuffer::silence(MOCK_RATE, 1, self.clip)))
    }
}

/// Handles to the scripted collaborators a session was built with.
pub struct Mocks {
    pub parser: Arc<MockParser>,
    pub extractor: Arc<MockExtractor>,
    pub processor: Arc<MockProcessor>,
    pub synthesizer: Arc<MockSynthesizer>,
}

impl Mocks {
    /// A paper with one section per entry of `sections`, one page each.
    pub fn paper(sections: &[&str]) -> Self {
        let pages: Vec<String> = sections
            .iter()
            .map(|title| format!("This is the text of {title}."))
            .collect();
        let page_refs: Vec<&str> = pages.iter().map(|page| page.as_str()).collect();
        let ranges: Vec<(&str, usize, usize)> = sections
            .iter()
            .enumerate()
            .map(|(i, title)| (*title, i + 1, i + 1))
            .collect();

        Self {
            parser: Arc::new(MockParser::with_pages(&page_refs)),
            extractor: Arc::new(MockExtractor::with_sections(&ranges)),
            processor: Arc::new(MockProcessor::default()),
            synthesizer: Arc::new(MockSynthesizer::default()),
        }
    }

    /// Explicit pages and section ranges.
    pub fn layout(pages: &[&str], sections: &[(&str, usize, usize)]) -> Self {
        Self {
            parser: Arc::new(MockParser::with_pages(pages)),
            extractor: Arc::new(MockExtractor::with_sections(sections)),
            processor: Arc::new(MockProcessor::default()),
            synthesizer: Arc::new(MockSynthesizer::default()),
        }
    }

    pub fn factory(&self) -> CollaboratorFactory {
        let collaborators = Collaborators {
            parser: self.parser.clone(),
            extractor: self.extractor.clone(),
            processor: self.processor.clone(),
            synthesizer: self.synthesizer.clone(),
        };
        Arc::new(move |_credentials: &Credentials| collaborators.clone())
    }
}

pub fn test_credentials() -> Credentials {
    Credentials::new("llm-test-key", "tts-test-key")
}

/// Session wired to scripted collaborators, with credentials in a temp dir.
pub struct TestNarrator {
    pub session: Session,
    pub bus: EventBus,
    pub dir: tempfile::TempDir,
}

impl TestNarrator {
    pub async fn new(mocks: &Mocks) -> Self {
        let narrator = Self::without_credentials(mocks).await;
        narrator
            .session
            .set_credentials(test_credentials())
            .await
            .unwrap();
        narrator
    }

    pub async fn without_credentials(mocks: &Mocks) -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path());
        let bus = EventBus::new();
        let session = Session::create(&config, bus.clone(), mocks.factory()).await;

        Self { session, bus, dir }
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.dir.path().join("credentials.json")
    }

    /// Runs the pipeline to its end and returns the outcome.
    pub async fn run(&self) -> PipelineOutcome {
        let handle = self.session.start("paper.pdf").unwrap();
        tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("pipeline should finish")
            .unwrap()
    }
}

pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.credentials_path = dir.join("credentials.json");
    config
}

/// Waits until the transport state satisfies `predicate`.
pub async fn wait_for_state<F>(session: &Session, timeout: Duration, predicate: F) -> TransportState
where
    F: Fn(&TransportState) -> bool,
{
    let mut rx = session.subscribe();
    let result = tokio::time::timeout(timeout, async {
        loop {
            let state = rx.borrow_and_update().clone();
            if predicate(&state) {
                return state;
            }
            if rx.changed().await.is_err() {
                return state;
            }
        }
    })
    .await;

    match result {
        Ok(state) => state,
        Err(_) => panic!(
            "Timed out waiting for transport state, last: {:?}",
            session.snapshot()
        ),
    }
}

/// Collects all events currently queued on a subscriber.
pub fn drain_events(subscriber: &mut Subscriber) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match subscriber.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(n)) => {
                eprintln!("Warning: subscriber lagged, missed {n} events");
            }
            Err(_) => break,
        }
    }
    events
}

/// Asserts that a specific event type was received.
#[macro_export]
macro_rules! assert_event_received {
    ($events:expr, $pattern:pat) => {
        assert!(
            $events.iter().any(|e| matches!(e, $pattern)),
            "Expected event matching {} not found in {:?}",
            stringify!($pattern),
            $events
        );
    };
}

/// Asserts that a specific event type was NOT received.
#[macro_export]
macro_rules! assert_event_not_received {
    ($events:expr, $pattern:pat) => {
        assert!(
            !$events.iter().any(|e| matches!(e, $pattern)),
            "Unexpected event matching {} found in {:?}",
            stringify!($pattern),
            $events
        );
    };
}
