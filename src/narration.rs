//! Per-run plumbing shared by the orchestrator and the prefetcher: run
//! cancellation and turning one section into narrated blocks.

use crate::{
    document::{Block, BlockKind, RawBlock, SharedDocument},
    error::NarratorError,
    lock::PoisonlessLock,
    normalize::normalize,
    sources::Collaborators,
    transport::Voice,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Why a run stopped before finishing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Interrupt {
    /// A provider rejected its key. Nothing else should run until new keys are entered.
    InvalidCredential { provider: String },

    /// The user reset or replaced the document.
    Cancelled,
}

/// Voice selection shared between the session and any running pipeline.
/// Read at every synthesis call so changes apply to blocks not yet spoken.
pub type VoiceSelection = Arc<Mutex<Voice>>;

/// Cancellation scope of one pipeline run.
#[derive(Clone, Default)]
pub struct RunControl {
    token: CancellationToken,
    rejected: Arc<Mutex<Option<String>>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Records a credential rejection and stops the whole run. The first
    /// rejection wins.
    pub fn reject(&self, provider: &str) {
        {
            let mut rejected = self.rejected.plock();
            if rejected.is_none() {
                *rejected = Some(provider.to_string());
            }
        }
        self.token.cancel();
    }

    /// Err if the run should not continue.
    pub fn checkpoint(&self) -> Result<(), Interrupt> {
        if let Some(provider) = self.rejected.plock().clone() {
            return Err(Interrupt::InvalidCredential { provider });
        }
        if self.token.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        Ok(())
    }

    /// Runs `update` on the value behind `lock` unless the run has stopped.
    ///
    /// The check happens while holding the lock. Reset cancels the run before
    /// it touches shared state, so a stale run can never write after it.
    pub fn apply<T, R>(
        &self,
        lock: &Mutex<T>,
        update: impl FnOnce(&mut T) -> R,
    ) -> Result<R, Interrupt> {
        let mut value = lock.plock();
        self.checkpoint()?;
        Ok(update(&mut value))
    }

    /// Awaits `fut` unless the run is cancelled first, in which case its
    /// result is dropped.
    pub async fn guard<T>(&self, fut: impl Future<Output = T>) -> Result<T, Interrupt> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.checkpoint().err().unwrap_or(Interrupt::Cancelled)),
            result = fut => {
                self.checkpoint()?;
                Ok(result)
            }
        }
    }
}

/// Turns sections into blocks and blocks into audio.
#[derive(Clone)]
pub struct NarrationWorker {
    collaborators: Collaborators,
    document: SharedDocument,
    voice: VoiceSelection,
    run: RunControl,
}

impl NarrationWorker {
    pub fn new(
        collaborators: Collaborators,
        document: SharedDocument,
        voice: VoiceSelection,
        run: RunControl,
    ) -> Self {
        Self {
            collaborators,
            document,
            voice,
            run,
        }
    }

    pub fn run(&self) -> &RunControl {
        &self.run
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Structures section `index` into normalized blocks.
    ///
    /// A processor failure falls back to one TEXT block holding the section's
    /// normalized raw text. Only a rejected key or cancellation is an error.
    pub async fn blocks_for(&self, index: usize) -> Result<Vec<Block>, Interrupt> {
        let (section_id, title, page_texts) = {
            let document = self.document.plock();
            let Some(section) = document.sections.get(index) else {
                return Ok(vec![]);
            };
            (
                section.id.clone(),
                section.title.clone(),
                document.page_texts_in(section.page_start, section.page_end),
            )
        };

        let processed = self
            .run
            .guard(self.collaborators.processor.process_section_text(
                &title,
                &section_id,
                &page_texts,
            ))
            .await?;

        let raw = match processed {
            Ok(raw) => raw,
            Err(NarratorError::InvalidCredential { provider }) => {
                self.run.reject(&provider);
                return Err(Interrupt::InvalidCredential { provider });
            }
            Err(NarratorError::Failed(e)) => {
                warn!("Processing {section_id} failed, reading its raw text instead: {e:?}");
                vec![]
            }
        };

        let mut blocks = to_blocks(&section_id, index, raw);
        if blocks.is_empty() {
            blocks = to_blocks(
                &section_id,
                index,
                vec![RawBlock {
                    kind: BlockKind::Text,
                    content: normalize(&page_texts.join("\n")),
                }],
            );
        }

        Ok(blocks)
    }

    /// Synthesizes `block` with the voice selected right now.
    ///
    /// A failed synthesis leaves the block without audio; only a rejected key
    /// or cancellation is an error.
    pub async fn synthesize(&self, mut block: Block) -> Result<Block, Interrupt> {
        let voice = *self.voice.plock();

        let result = self
            .run
            .guard(self.collaborators.synthesizer.synthesize(&block.content, voice))
            .await?;

        block.audio = match result {
            Ok(audio) => audio.filter(|audio| !audio.is_empty()).map(Arc::new),
            Err(NarratorError::InvalidCredential { provider }) => {
                self.run.reject(&provider);
                return Err(Interrupt::InvalidCredential { provider });
            }
            Err(NarratorError::Failed(e)) => {
                warn!("Synthesis of {} failed, skipping it: {e:?}", block.id);
                None
            }
        };

        Ok(block)
    }
}

/// Normalizes processor output into blocks, dropping ones left empty.
fn to_blocks(section_id: &str, section: usize, raw: Vec<RawBlock>) -> Vec<Block> {
    raw.into_iter()
        .map(|raw| (raw.kind, normalize(&raw.content)))
        .filter(|(_, content)| !content.is_empty())
        .enumerate()
        .map(|(ordinal, (kind, content))| Block::new(section_id, section, ordinal, kind, &content))
        .collect()
}
