//! Drives one document from upload to fully scheduled narration.
//!
//! parse -> detect sections -> for each section in order: structure,
//! synthesize, enqueue. A section the prefetcher already claimed is waited
//! for instead of processed again.

use crate::{
    constants::INVALID_CREDENTIAL_MESSAGE,
    document::{Block, Document, SectionStatus, SharedDocument},
    error::NarratorError,
    event::{Event, EventBus, PipelineEvent},
    lock::PoisonlessLock,
    narration::{Interrupt, NarrationWorker, RunControl},
    prefetch::{PrefetchOutcome, Prefetcher},
    scheduler::PlaybackScheduler,
    sources::ProgressFn,
    transport::{Phase, Transport},
};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every section was handed to the scheduler
    Completed,

    /// A provider rejected its key. Already scheduled audio keeps playing.
    InvalidCredential { provider: String },

    /// Reset by the user, nothing was reported
    Cancelled,

    /// Unexpected failure, surfaced to the user verbatim
    Failed(String),
}

enum Stop {
    Interrupted(Interrupt),
    Failed(String),
}

impl From<Interrupt> for Stop {
    fn from(interrupt: Interrupt) -> Self {
        Stop::Interrupted(interrupt)
    }
}

pub struct PipelineOrchestrator {
    worker: NarrationWorker,
    prefetcher: Prefetcher,
    document: SharedDocument,
    scheduler: PlaybackScheduler,
    transport: Transport,
    bus: EventBus,
}

impl PipelineOrchestrator {
    pub fn new(
        worker: NarrationWorker,
        prefetcher: Prefetcher,
        document: SharedDocument,
        scheduler: PlaybackScheduler,
        transport: Transport,
        bus: EventBus,
    ) -> Self {
        Self {
            worker,
            prefetcher,
            document,
            scheduler,
            transport,
            bus,
        }
    }

    fn run(&self) -> &RunControl {
        self.worker.run()
    }

    /// Processes the document at `path` and reports how the run ended.
    pub async fn run_pipeline(&self, path: &Path) -> PipelineOutcome {
        let outcome = match self.process(path).await {
            Ok(()) => PipelineOutcome::Completed,
            Err(Stop::Interrupted(Interrupt::Cancelled)) => PipelineOutcome::Cancelled,
            Err(Stop::Interrupted(Interrupt::InvalidCredential { provider })) => {
                PipelineOutcome::InvalidCredential { provider }
            }
            Err(Stop::Failed(message)) => PipelineOutcome::Failed(message),
        };

        match &outcome {
            PipelineOutcome::Completed => {
                info!("All sections scheduled");
                self.scheduler.mark_pipeline_finished();
                self.bus.send(Event::Pipeline(PipelineEvent::Completed));
            }
            PipelineOutcome::Cancelled => {
                debug!("Pipeline cancelled");
            }
            PipelineOutcome::InvalidCredential { provider } => {
                warn!("{provider} rejected its credentials, aborting pipeline");
                self.scheduler.mark_pipeline_finished();
                self.transport.fail(INVALID_CREDENTIAL_MESSAGE);
                self.transport.set_credentials_required(true);
                self.bus.send(Event::Pipeline(PipelineEvent::Aborted {
                    reason: INVALID_CREDENTIAL_MESSAGE.to_string(),
                }));
            }
            PipelineOutcome::Failed(message) => {
                let sounding = !self.scheduler.is_idle();
                self.scheduler.mark_pipeline_finished();
                if sounding {
                    self.transport.report_error(message.clone());
                } else {
                    self.transport.fail(message.clone());
                }
                self.bus.send(Event::Pipeline(PipelineEvent::Aborted {
                    reason: message.clone(),
                }));
            }
        }

        outcome
    }

    async fn process(&self, path: &Path) -> Result<(), Stop> {
        let run = self.run().clone();
        let collaborators = self.worker.collaborators().clone();

        self.transport.report_progress(Phase::Parsing);
        self.transport.set_parse_progress(0);

        let transport = self.transport.clone();
        let progress: ProgressFn = Arc::new(move |percent| transport.set_parse_progress(percent));

        let pages = match run.guard(collaborators.parser.parse(path, progress)).await? {
            Ok(pages) => pages,
            Err(NarratorError::InvalidCredential { provider }) => {
                run.reject(&provider);
                return Err(Interrupt::InvalidCredential { provider }.into());
            }
            Err(NarratorError::Failed(e)) => {
                return Err(Stop::Failed(format!("Could not read the PDF: {e:#}")));
            }
        };

        if pages.is_empty() {
            return Err(Stop::Failed("The PDF has no pages".to_string()));
        }

        let page_count = pages.len();
        let page_texts = run.apply(&self.document, |document| {
            *document = Document::new(pages);
            document.page_texts()
        })?;
        self.transport.set_parse_progress(100);
        self.bus
            .send(Event::Pipeline(PipelineEvent::Parsed { pages: page_count }));

        self.transport.report_progress(Phase::ExtractingSections);
        let raw = match run
            .guard(collaborators.extractor.extract_sections(&page_texts))
            .await?
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Section detection failed, narrating as one section: {e:?}");
                vec![]
            }
        };

        let fallback = raw.is_empty();
        let sections = run.apply(&self.document, |document| {
            document.set_sections(raw);
            document.sections.clone()
        })?;

        info!(
            "Narrating {} sections over {page_count} pages",
            sections.len()
        );
        self.transport.set_sections(&sections);
        self.bus
            .send(Event::Pipeline(PipelineEvent::SectionsDetected {
                count: sections.len(),
                fallback,
            }));

        for index in 0..sections.len() {
            self.narrate_section(index).await?;
        }

        run.checkpoint()?;
        Ok(())
    }

    async fn narrate_section(&self, index: usize) -> Result<(), Stop> {
        loop {
            self.run().checkpoint()?;

            let status = self.document.plock().section_status(index);
            match status {
                None => return Ok(()),
                Some(SectionStatus::Pending) => {
                    if self.claim(index)? {
                        return self.process_inline(index).await;
                    }
                }
                Some(SectionStatus::Processing) => {
                    debug!("Section {} is being prefetched, waiting", index + 1);
                    if let Some(PrefetchOutcome::Interrupted(interrupt)) =
                        self.prefetcher.wait_for(index).await
                    {
                        return Err(interrupt.into());
                    }
                    tokio::task::yield_now().await;
                }
                Some(_) => {
                    self.enqueue_prepared(index);
                    return Ok(());
                }
            }
        }
    }

    fn claim(&self, index: usize) -> Result<bool, Interrupt> {
        self.run().apply(&self.document, |document| {
            if document.section_status(index) != Some(SectionStatus::Pending) {
                return false;
            }
            document.set_section_status(index, SectionStatus::Processing);
            true
        })
    }

    /// Processes a section nobody prepared yet. Each block is scheduled as
    /// soon as its audio exists so playback can start early.
    async fn process_inline(&self, index: usize) -> Result<(), Stop> {
        self.transport
            .set_section_status(index, SectionStatus::Processing);
        self.transport.report_progress(Phase::ProcessingSection);

        let blocks = self.worker.blocks_for(index).await?;
        debug!("Section {} has {} blocks", index + 1, blocks.len());

        self.transport.report_progress(Phase::GeneratingVoice);
        for block in blocks {
            let block = self.worker.synthesize(block).await?;
            self.store_block(index, &block)?;
            self.scheduler.enqueue_for_run(&block, self.run().token());
        }

        let promoted = self.run().apply(&self.document, |document| {
            let promoted = document.section_status(index) == Some(SectionStatus::Processing);
            if promoted {
                document.set_section_status(index, SectionStatus::Ready);
            }
            promoted
        })?;
        if promoted {
            self.transport.set_section_status(index, SectionStatus::Ready);
        }
        self.bus
            .send(Event::Pipeline(PipelineEvent::SectionReady { index }));

        Ok(())
    }

    fn store_block(&self, index: usize, block: &Block) -> Result<(), Interrupt> {
        self.run().apply(&self.document, |document| {
            if let Some(section) = document.sections.get_mut(index) {
                section.blocks.push(block.clone());
            }
        })
    }

    /// Hands a prefetched section's blocks to the scheduler in order.
    fn enqueue_prepared(&self, index: usize) {
        let blocks = self
            .document
            .plock()
            .sections
            .get(index)
            .map(|section| section.blocks.clone())
            .unwrap_or_default();

        debug!(
            "Scheduling {} prefetched blocks of section {}",
            blocks.len(),
            index + 1
        );
        for block in &blocks {
            self.scheduler.enqueue_for_run(block, self.run().token());
        }
    }
}
