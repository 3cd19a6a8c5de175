//! Section detection and narration structuring through an OpenAI-compatible
//! chat completions API.

use crate::{
    config::LlmConfig,
    document::{RawBlock, RawSection},
    error::{NarratorError, NarratorResult},
    sources::{ContentProcessor, SectionExtractor},
};
use anyhow::anyhow;
use async_trait::async_trait;
use itertools::Itertools;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

const PROVIDER: &str = "LLM";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-page excerpt length sent for section detection. Headings live near
/// the top of a page, the rest only costs tokens.
const EXTRACTION_PAGE_CHARS: usize = 3000;

const EXTRACTION_PROMPT: &str = r#"You are given the text of a research paper, page by page.
Split the paper into its top-level sections in reading order (for example Abstract, Introduction, Methods, Results, Discussion, Conclusion).
Every page must belong to exactly one section. Skip the reference list and appendices if they are at the end.
Respond with JSON only, in this shape:
{"sections": [{"title": "Introduction", "pageStart": 1, "pageEnd": 2}]}
Page numbers are 1-based and inclusive."#;

const PROCESSING_PROMPT: &str = r#"You prepare one section of a research paper for being read aloud.
Return the section as an ordered list of narration blocks:
- "TEXT" blocks contain the paper's own prose, verbatim, without page headers, footers, line numbers or citation markers.
- "DESCRIPTION" blocks replace anything that cannot be read aloud (equations, tables, figures, code) with a short spoken explanation.
Keep paragraphs as separate blocks. Do not summarize the prose.
Respond with JSON only, in this shape:
{"blocks": [{"type": "TEXT", "content": "..."}, {"type": "DESCRIPTION", "content": "..."}]}"#;

pub struct LlmClient {
    client: Client,
    api_url: String,
    model: String,
    temperature: f32,
    api_key: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig, api_key: &str) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            api_key: api_key.to_string(),
        }
    }

    /// Runs one chat completion and parses the reply as JSON.
    async fn complete_json(&self, system: &str, user: String) -> NarratorResult<Value> {
        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });

        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(NarratorError::invalid_credential(PROVIDER));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("{PROVIDER} request failed with {status}: {text}").into());
        }

        let data: Value = resp.json().await?;
        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("{PROVIDER} response had no message content"))?;

        Ok(serde_json::from_str(strip_code_fence(content))?)
    }
}

/// Models sometimes wrap JSON in a markdown fence despite being told not to.
pub fn strip_code_fence(content: &str) -> &str {
    let content = content.trim();
    let Some(inner) = content.strip_prefix("```") else {
        return content;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Accepts either a bare array or an object holding the array under `key`.
pub fn parse_list<T: DeserializeOwned>(value: Value, key: &str) -> NarratorResult<Vec<T>> {
    let list = match value {
        list @ Value::Array(_) => list,
        Value::Object(mut object) => object
            .remove(key)
            .ok_or_else(|| anyhow!("Expected a \"{key}\" list in the response"))?,
        other => return Err(anyhow!("Unexpected response shape: {other}").into()),
    };

    Ok(serde_json::from_value(list)?)
}

fn excerpt(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[async_trait]
impl SectionExtractor for LlmClient {
    async fn extract_sections(&self, page_texts: &[String]) -> NarratorResult<Vec<RawSection>> {
        let pages = page_texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                format!(
                    "--- Page {} ---\n{}",
                    i + 1,
                    excerpt(text, EXTRACTION_PAGE_CHARS)
                )
            })
            .join("\n\n");

        let user = format!("The paper has {} pages.\n\n{pages}", page_texts.len());
        let sections = parse_list(self.complete_json(EXTRACTION_PROMPT, user).await?, "sections")?;

        Ok(sections)
    }
}

#[async_trait]
impl ContentProcessor for LlmClient {
    async fn process_section_text(
        &self,
        section_title: &str,
        section_id: &str,
        page_texts: &[String],
    ) -> NarratorResult<Vec<RawBlock>> {
        debug!("Structuring {section_id} ({section_title})");

        let user = format!(
            "Section title: {section_title}\n\n{}",
            page_texts.join("\n\n")
        );
        let blocks = parse_list(self.complete_json(PROCESSING_PROMPT, user).await?, "blocks")?;

        Ok(blocks)
    }
}
