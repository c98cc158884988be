//! Content processing collaborator
//!
//! The engine treats content as opaque text. The two places where it needs an
//! opinion about text (joining two nodes on merge, finding outgoing
//! references) go through [`ContentProcessor`] so an editor can plug in its
//! own markdown handling.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

// Matches: [@Title](nodespace://uuid) or [text](nodespace://node/uuid?x=y)
// Capture group 1: the node ID (without "node/" prefix)
const MARKDOWN_MENTION_PATTERN: &str =
    r"\[[^\]]+\]\(nodespace://(?:node/)?([^\s)?]+)(?:\?[^)]*)?\)";

// Matches: nodespace://uuid or nodespace://node/uuid
const PLAIN_MENTION_PATTERN: &str = r"nodespace://(?:node/)?([^\s)?\]]+)";

pub trait ContentProcessor: Send + Sync {
    /// Content of `target` after `source` is merged into it
    fn merge(&self, target: &str, source: &str) -> String;

    /// Node ids referenced from `content`, deduplicated, in first-seen order
    fn extract_mentions(&self, content: &str) -> Vec<String>;
}

/// Plain concatenation and `nodespace://` link extraction
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultContentProcessor;

impl ContentProcessor for DefaultContentProcessor {
    fn merge(&self, target: &str, source: &str) -> String {
        let mut merged = String::with_capacity(target.len() + source.len());
        merged.push_str(target);
        merged.push_str(source);
        merged
    }

    fn extract_mentions(&self, content: &str) -> Vec<String> {
        extract_mentions(content)
    }
}

/// Extract mentioned node ids from markdown links and bare `nodespace://` URIs
///
/// # Examples
///
/// ```
/// # use nodespace_hierarchy::services::extract_mentions;
/// let content = "See [@Plan](nodespace://node/abc-123) and nodespace://2025-10-24";
/// assert_eq!(extract_mentions(content), vec!["abc-123", "2025-10-24"]);
/// ```
pub fn extract_mentions(content: &str) -> Vec<String> {
    static MARKDOWN_REGEX: OnceLock<Regex> = OnceLock::new();
    let markdown_regex =
        MARKDOWN_REGEX.get_or_init(|| Regex::new(MARKDOWN_MENTION_PATTERN).unwrap());
    static PLAIN_REGEX: OnceLock<Regex> = OnceLock::new();
    let plain_regex = PLAIN_REGEX.get_or_init(|| Regex::new(PLAIN_MENTION_PATTERN).unwrap());

    let mut found: Vec<(usize, String)> = Vec::new();
    let mut markdown_ranges = Vec::new();
    for cap in markdown_regex.captures_iter(content) {
        if let (Some(whole), Some(node_id)) = (cap.get(0), cap.get(1)) {
            markdown_ranges.push(whole.range());
            found.push((whole.start(), node_id.as_str().to_string()));
        }
    }

    // skip bare URIs that sit inside a markdown link already counted
    for cap in plain_regex.captures_iter(content) {
        if let (Some(whole), Some(node_id)) = (cap.get(0), cap.get(1)) {
            let inside_link = markdown_ranges
                .iter()
                .any(|range| range.contains(&whole.start()));
            if !inside_link {
                found.push((whole.start(), node_id.as_str().to_string()));
            }
        }
    }

    found.sort_by_key(|(position, _)| *position);
    let mut seen = HashSet::new();
    found
        .into_iter()
        .map(|(_, id)| id)
        .filter(|id| seen.insert(id.clone()))
        .collect()
}
