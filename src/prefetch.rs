//! Background preparation of the section after the one currently playing.
//!
//! At most one prefetch runs at a time. A prefetched section ends up Ready
//! with synthesized blocks stored on the document; handing those blocks to
//! the scheduler is always the orchestrator's job.

use crate::{
    document::{Block, SectionStatus, SharedDocument},
    event::{Event, EventBus, PipelineEvent},
    narration::{Interrupt, NarrationWorker},
    transport::Transport,
};
use futures::{stream, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrefetchState {
    NotStarted,
    InProgress { section: usize },
    Done { section: usize, outcome: PrefetchOutcome },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrefetchOutcome {
    Ready,
    Interrupted(Interrupt),
}

#[derive(Clone)]
pub struct Prefetcher {
    state: Arc<watch::Sender<PrefetchState>>,
    worker: NarrationWorker,
    document: SharedDocument,
    transport: Transport,
    bus: EventBus,
    concurrency: usize,
}

impl Prefetcher {
    pub fn new(
        worker: NarrationWorker,
        document: SharedDocument,
        transport: Transport,
        bus: EventBus,
        concurrency: usize,
    ) -> Self {
        let (tx, _rx) = watch::channel(PrefetchState::NotStarted);
        Self {
            state: Arc::new(tx),
            worker,
            document,
            transport,
            bus,
            concurrency: concurrency.max(1),
        }
    }

    pub fn state(&self) -> PrefetchState {
        self.state.borrow().clone()
    }

    /// Starts preparing section `index` in the background.
    ///
    /// Returns false without doing anything if a prefetch is already running,
    /// the section does not exist, or someone else already claimed it.
    pub fn try_start(&self, index: usize) -> bool {
        let run = self.worker.run();

        // Claim under the state lock so only one prefetch can start
        let mut started = false;
        self.state.send_if_modified(|state| {
            if matches!(state, PrefetchState::InProgress { .. }) {
                return false;
            }

            let claimed = run.apply(&self.document, |document| {
                if document.section_status(index) != Some(SectionStatus::Pending) {
                    return false;
                }
                document.set_section_status(index, SectionStatus::Processing);
                true
            });
            if claimed != Ok(true) {
                return false;
            }

            *state = PrefetchState::InProgress { section: index };
            started = true;
            true
        });

        if !started {
            return false;
        }

        debug!("Prefetching section {}", index + 1);
        self.transport
            .set_section_status(index, SectionStatus::Processing);

        let prefetcher = self.clone();
        tokio::spawn(async move {
            let prepared = match prefetcher.prepare(index).await {
                Ok(blocks) => prefetcher.store(index, blocks),
                Err(interrupt) => Err(interrupt),
            };
            let outcome = match prepared {
                Ok(()) => PrefetchOutcome::Ready,
                Err(interrupt) => {
                    prefetcher.release(index);
                    PrefetchOutcome::Interrupted(interrupt)
                }
            };

            debug!("Prefetch of section {} finished: {:?}", index + 1, outcome);
            prefetcher.state.send_replace(PrefetchState::Done {
                section: index,
                outcome,
            });
        });

        true
    }

    /// Structures the section, then synthesizes its blocks a few at a time.
    /// Results come back in block order regardless of completion order.
    async fn prepare(&self, index: usize) -> Result<Vec<Block>, Interrupt> {
        let blocks = self.worker.blocks_for(index).await?;

        let synthesized: Vec<Result<Block, Interrupt>> = stream::iter(blocks)
            .map(|block| self.worker.synthesize(block))
            .buffered(self.concurrency)
            .collect()
            .await;

        synthesized.into_iter().collect()
    }

    /// Stores prepared blocks, unless the run ended while they were made.
    fn store(&self, index: usize, blocks: Vec<Block>) -> Result<(), Interrupt> {
        let stored = self.worker.run().apply(&self.document, |document| {
            let Some(section) = document.sections.get_mut(index) else {
                return false;
            };
            section.blocks = blocks;
            if section.status == SectionStatus::Processing {
                section.status = SectionStatus::Ready;
            }
            true
        })?;

        if stored {
            self.transport.set_section_status(index, SectionStatus::Ready);
            self.bus
                .send(Event::Pipeline(PipelineEvent::SectionReady { index }));
        }
        Ok(())
    }

    /// Hands an unfinished section back so it can be processed again. A
    /// reset document is left alone.
    fn release(&self, index: usize) {
        let _ = self.worker.run().apply(&self.document, |document| {
            if document.section_status(index) == Some(SectionStatus::Processing) {
                document.set_section_status(index, SectionStatus::Pending);
            }
        });
    }

    /// Waits until a prefetch of section `index` is no longer in progress.
    pub async fn wait_for(&self, index: usize) -> Option<PrefetchOutcome> {
        let mut rx = self.state.subscribe();
        let run = self.worker.run().clone();

        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                PrefetchState::InProgress { section } if section == index => {}
                PrefetchState::Done { section, outcome } if section == index => {
                    return Some(outcome)
                }
                _ => return None,
            }

            tokio::select! {
                _ = run.token().cancelled() => return None,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}
