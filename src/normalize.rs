//! Text cleanup applied to extracted paper text before it is narrated.
//!
//! Strips everything a listener does not want read aloud: citations,
//! identifiers, line numbers, page furniture and publication boilerplate.

use lazy_static::lazy_static;
use regex::Regex;

const MONTH: &str = r"(?:January|February|March|April|May|June|July|August|September|October|November|December|Jan|Feb|Mar|Apr|Jun|Jul|Aug|Sep|Sept|Oct|Nov|Dec)\.?";
const AUTHOR: &str = r"[A-Z][A-Za-z'\-]+(?:\s+et\s+al\.?|\s+(?:and|&)\s+[A-Z][A-Za-z'\-]+)?";

lazy_static! {
    /// Patterns anchored to the start of a line. Run before anything else so
    /// they still see the original line structure.
    static ref LINE_PATTERNS: Vec<Regex> = vec![
        // leading short numeric line markers ("12  The model ...")
        Regex::new(r"(?m)^[ \t]*(?:\d{1,3}[ \t]+)+").unwrap(),
    ];

    static ref PATTERNS: Vec<Regex> = vec![
        // email addresses
        Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap(),
        // URLs
        Regex::new(r"(?i)(?:https?://|www\.)\S+").unwrap(),
        // DOIs
        Regex::new(r"(?i)\bdoi:?\s*10\.\d{4,9}/\S+|\b10\.\d{4,9}/\S+").unwrap(),
        // arXiv identifiers
        Regex::new(r"(?i)\barxiv:?\s*\d{4}\.\d{4,5}(?:v\d+)?(?:\s*\[[^\]]*\])?").unwrap(),
        // ORCID identifiers
        Regex::new(r"(?i)(?:\borcid(?:\.org/|:)?\s*)?\b\d{4}-\d{4}-\d{4}-\d{3}[\dX]\b").unwrap(),
        // submission / acceptance dates
        Regex::new(&format!(
            r"(?i)\b(?:received|submitted|accepted|revised|published online)(?:\s+(?:on|in))?\s*:?\s*(?:\d{{1,2}}\s+{MONTH}\s+\d{{4}}|{MONTH}\s+\d{{1,2}},?\s+\d{{4}}|{MONTH}\s+\d{{4}}|\d{{4}}-\d{{2}}-\d{{2}})[;,.]?"
        ))
        .unwrap(),
        // corresponding author notes, up to the end of the sentence or line.
        // Initials ("J. Doe") do not end the note.
        Regex::new(r"(?i:\bcorresponding authors?\b)(?:\b[A-Z]\.|[^.\n])*\.?").unwrap(),
        // copyright notices, same extent
        Regex::new(r"(?:©|(?i:\bcopyright\b))(?:\b[A-Z]\.|[^.\n])*\.?").unwrap(),
        // bracketed numeric citations: [1], [2,3], [1-5], [1, 4–6]
        Regex::new(r"\[\d+(?:\s*[,\-–]\s*\d+)*\]").unwrap(),
        // author-year citations: (Smith et al., 2023), (Smith and Jones, 2023; Doe, 2020a)
        Regex::new(&format!(
            r"\({AUTHOR},?\s+\d{{4}}[a-z]?(?:\s*;\s*{AUTHOR},?\s+\d{{4}}[a-z]?)*\)"
        ))
        .unwrap(),
        // orphaned "et al., 2023" fragments
        Regex::new(r"\bet\s+al\.?,?\s*\d{4}[a-z]?").unwrap(),
        // runs of 3-digit line numbers
        Regex::new(r"\b\d{3}(?:\s+\d{3}){2,}\b").unwrap(),
        // "Page 3", "page 3 of 12"
        Regex::new(r"(?i)\bpage\s+\d+(?:\s+of\s+\d+)?\b").unwrap(),
        // footnote glyphs
        Regex::new(r"[*†‡§¶]").unwrap(),
    ];

    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

fn clean_once(text: &str) -> String {
    let mut text = text.to_string();

    for re in LINE_PATTERNS.iter().chain(PATTERNS.iter()) {
        text = re.replace_all(&text, " ").into_owned();
    }

    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Cleans `text` for narration.
///
/// Removing one pattern can expose another (a citation hiding a line
/// marker), so passes repeat until the text stops changing. After the first
/// pass the text only ever shrinks, which bounds the loop.
pub fn normalize(text: &str) -> String {
    let mut current = clean_once(text);

    loop {
        let next = clean_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}
