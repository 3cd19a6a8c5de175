//! PDF text extraction through poppler's command line tools.
//!
//! `pdfinfo` reports the page count, then `pdftotext` is run once per page
//! so progress can be reported as pages come in.

use crate::{
    document::Page,
    error::{NarratorError, NarratorResult},
    sources::{DocumentParser, ProgressFn},
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref PAGES_RE: Regex = Regex::new(r"(?m)^Pages:\s+(\d+)\s*$").unwrap();
}

pub struct PopplerParser {
    pdfinfo: PathBuf,
    pdftotext: PathBuf,
}

impl Default for PopplerParser {
    fn default() -> Self {
        Self {
            pdfinfo: PathBuf::from("pdfinfo"),
            pdftotext: PathBuf::from("pdftotext"),
        }
    }
}

impl PopplerParser {
    pub fn new(pdfinfo: impl Into<PathBuf>, pdftotext: impl Into<PathBuf>) -> Self {
        Self {
            pdfinfo: pdfinfo.into(),
            pdftotext: pdftotext.into(),
        }
    }

    async fn run(&self, program: &Path, args: &[&str]) -> anyhow::Result<String> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", program.display()))?;

        if !output.status.success() {
            return Err(anyhow!(
                "{} failed (exit code {code}): {stderr}",
                program.display(),
                code = output.status.code().unwrap_or_default(),
                stderr = String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn page_count(&self, path: &str) -> anyhow::Result<usize> {
        let info = self.run(&self.pdfinfo, &[path]).await?;
        parse_page_count(&info).context("pdfinfo did not report a page count")
    }

    async fn page_text(&self, path: &str, page: usize) -> anyhow::Result<String> {
        let page = page.to_string();
        self.run(
            &self.pdftotext,
            &["-f", &page, "-l", &page, "-enc", "UTF-8", path, "-"],
        )
        .await
    }
}

/// Reads the `Pages:` line of `pdfinfo` output.
pub fn parse_page_count(info: &str) -> Option<usize> {
    PAGES_RE
        .captures(info)
        .and_then(|captures| captures.get(1))
        .and_then(|count| count.as_str().parse().ok())
}

#[async_trait]
impl DocumentParser for PopplerParser {
    async fn parse(&self, path: &Path, progress: ProgressFn) -> NarratorResult<Vec<Page>> {
        let path_str = path
            .to_str()
            .ok_or_else(|| NarratorError::Failed(anyhow!("Path is not valid UTF-8: {path:?}")))?;

        progress(0);
        let count = self.page_count(path_str).await?;
        info!("Parsing {} ({count} pages)", path.display());

        let mut pages = Vec::with_capacity(count);
        for index in 1..=count {
            let text = self.page_text(path_str, index).await?;
            // pdftotext terminates every page with a form feed
            let text = text.trim_end_matches('\u{c}').to_string();

            pages.push(Page {
                index,
                text,
                image: None,
            });
            progress(((index * 100) / count) as u8);
        }

        Ok(pages)
    }
}
