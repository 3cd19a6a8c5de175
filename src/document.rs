//! Pages, sections and narration blocks of one uploaded paper.

use crate::{audio::AudioBuffer, constants::FALLBACK_SECTION_TITLE, normalize::normalize};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// One page of the source PDF. Index is 1-based.
#[derive(Clone, Debug, PartialEq)]
pub struct Page {
    pub index: usize,
    pub text: String,
    pub image: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionStatus {
    #[default]
    Pending,
    Processing,
    Ready,
    Playing,
    Completed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlockKind {
    /// Verbatim paper text
    Text,
    /// Spoken paraphrase of something that can't be read verbatim (equations, figures)
    Description,
}

/// Section boundaries as reported by the section extractor.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RawSection {
    pub title: String,
    #[serde(rename = "pageStart", alias = "page_start")]
    pub page_start: usize,
    #[serde(rename = "pageEnd", alias = "page_end")]
    pub page_end: usize,
}

/// Narration block as reported by the content processor.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RawBlock {
    #[serde(rename = "type")]
    pub kind: BlockKind,
    pub content: String,
}

#[derive(Clone, Debug)]
pub struct Block {
    pub id: String,
    pub kind: BlockKind,
    pub content: String,
    /// Index of the owning section within the document
    pub section: usize,
    /// Decoded narration. None until synthesized, stays None if synthesis failed.
    pub audio: Option<Arc<AudioBuffer>>,
}

impl Block {
    pub fn new(section_id: &str, section: usize, ordinal: usize, kind: BlockKind, content: &str) -> Self {
        Block {
            id: block_id(section_id, ordinal),
            kind,
            content: normalize(content),
            section,
            audio: None,
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

pub fn block_id(section_id: &str, ordinal: usize) -> String {
    format!("{section_id}-block-{ordinal}")
}

#[derive(Clone, Debug)]
pub struct Section {
    pub id: String,
    pub title: String,
    pub page_start: usize,
    pub page_end: usize,
    pub blocks: Vec<Block>,
    pub status: SectionStatus,
}

impl Section {
    pub fn page_count(&self) -> usize {
        self.page_end + 1 - self.page_start
    }
}

/// All state derived from one uploaded document.
#[derive(Clone, Debug, Default)]
pub struct Document {
    pub pages: Vec<Page>,
    pub sections: Vec<Section>,
}

impl Document {
    pub fn new(pages: Vec<Page>) -> Self {
        Document {
            pages,
            sections: vec![],
        }
    }

    pub fn total_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn page_texts(&self) -> Vec<String> {
        self.pages.iter().map(|page| page.text.clone()).collect()
    }

    /// Text of the pages in `[start, end]` (1-based, inclusive).
    pub fn page_texts_in(&self, start: usize, end: usize) -> Vec<String> {
        self.pages
            .iter()
            .filter(|page| page.index >= start && page.index <= end)
            .map(|page| page.text.clone())
            .collect()
    }

    /// Installs extractor output as this document's sections.
    ///
    /// Ranges are clamped into `[1, total_pages]`; an empty result falls back
    /// to a single section covering the whole document.
    pub fn set_sections(&mut self, raw: Vec<RawSection>) {
        let total = self.total_pages().max(1);

        let mut sections: Vec<Section> = raw
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                let start = raw.page_start.clamp(1, total);
                let end = raw.page_end.clamp(start, total);
                Section {
                    id: format!("section-{}", i + 1),
                    title: raw.title.trim().to_string(),
                    page_start: start,
                    page_end: end,
                    blocks: vec![],
                    status: SectionStatus::Pending,
                }
            })
            .collect();

        if sections.is_empty() {
            sections = fallback_sections(total);
        }

        self.sections = sections;
    }

    /// Read-only, document-ordered view of every block.
    pub fn blocks(&self) -> Vec<&Block> {
        self.sections
            .iter()
            .flat_map(|section| section.blocks.iter())
            .collect()
    }

    pub fn find_block(&self, id: &str) -> Option<&Block> {
        self.blocks().into_iter().find(|block| block.id == id)
    }

    pub fn section_status(&self, index: usize) -> Option<SectionStatus> {
        self.sections.get(index).map(|section| section.status)
    }

    pub fn set_section_status(&mut self, index: usize, status: SectionStatus) {
        if let Some(section) = self.sections.get_mut(index) {
            section.status = status;
        }
    }

    /// Fraction of sections that have finished playing.
    pub fn progress(&self) -> f64 {
        if self.sections.is_empty() {
            return 0.0;
        }
        let completed = self
            .sections
            .iter()
            .filter(|section| section.status == SectionStatus::Completed)
            .count();
        completed as f64 / self.sections.len() as f64
    }
}

/// One section spanning the whole document, used when detection fails.
pub fn fallback_sections(total_pages: usize) -> Vec<Section> {
    vec![Section {
        id: "section-1".to_string(),
        title: FALLBACK_SECTION_TITLE.to_string(),
        page_start: 1,
        page_end: total_pages.max(1),
        blocks: vec![],
        status: SectionStatus::Pending,
    }]
}

/// Document shared by the orchestrator, prefetcher and session.
///
/// Only ever locked for short synchronous updates, never across an await.
pub type SharedDocument = Arc<Mutex<Document>>;

pub fn shared(document: Document) -> SharedDocument {
    Arc::new(Mutex::new(document))
}
