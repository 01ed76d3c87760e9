//! Pre-summary cleanup of the merged abstracts.
//!
//! The document is split into `### ` heading blocks. Blocks the model marked
//! as irrelevant are dropped, repeated articles are removed (first wins) and
//! long runs of blank lines are collapsed.

use std::collections::HashSet;

const HEADING_PREFIX: &str = "### ";

/// Identity of a heading block used for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockKey {
    Url(String),
    Title(String),
}

/// Cleaned text plus what was removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanedAbstracts {
    pub text: String,
    pub kept: usize,
    pub skipped: usize,
    pub duplicates: usize,
}

struct Block<'a> {
    heading: Option<&'a str>,
    body: Vec<&'a str>,
}

impl Block<'_> {
    fn key(&self) -> Option<BlockKey> {
        self.heading.and_then(heading_key)
    }

    /// Marked when the heading itself, or the first non-blank body line, is a skip marker.
    fn is_skipped(&self) -> bool {
        if self.heading.map_or(false, is_skip_marker) {
            return true;
        }
        // body[0] is the heading line itself
        self.body
            .iter()
            .skip(usize::from(self.heading.is_some()))
            .find(|line| !line.trim().is_empty())
            .map_or(false, |line| is_skip_marker(line))
    }
}

/// `SKIP` or `[SKIP]`, any case, surrounding whitespace ignored.
pub fn is_skip_marker(line: &str) -> bool {
    let line = line.trim();
    line.eq_ignore_ascii_case("skip") || line.eq_ignore_ascii_case("[skip]")
}

/// Key for a heading's text (without the `### ` prefix).
///
/// `[title](url)` is keyed by url, falling back to the title when the url is
/// empty; any other heading is keyed by its trimmed text.
pub fn heading_key(heading: &str) -> Option<BlockKey> {
    let heading = heading.trim();

    if let Some(rest) = heading.strip_prefix('[') {
        if let Some((label, tail)) = rest.split_once("](") {
            if let Some((url, _)) = tail.split_once(')') {
                let url = url.trim();
                if !url.is_empty() {
                    return Some(BlockKey::Url(url.to_string()));
                }
                let label = label.trim();
                if !label.is_empty() {
                    return Some(BlockKey::Title(label.to_string()));
                }
            }
        }
    }

    if heading.is_empty() {
        None
    } else {
        Some(BlockKey::Title(heading.to_string()))
    }
}

fn split_blocks(text: &str) -> Vec<Block<'_>> {
    let mut blocks = vec![Block { heading: None, body: Vec::new() }];
    for line in text.lines() {
        match line.strip_prefix(HEADING_PREFIX) {
            Some(heading) => blocks.push(Block { heading: Some(heading), body: vec![line] }),
            None => {
                if let Some(current) = blocks.last_mut() {
                    current.body.push(line);
                }
            }
        }
    }
    blocks
}

/// Drop skipped and duplicate blocks, then normalize blank lines.
pub fn clean_abstracts(text: &str) -> CleanedAbstracts {
    let mut seen: HashSet<BlockKey> = HashSet::new();
    let mut lines: Vec<&str> = Vec::new();
    let (mut kept, mut skipped, mut duplicates) = (0, 0, 0);

    for block in split_blocks(text) {
        if block.heading.is_some() {
            if block.is_skipped() {
                skipped += 1;
                continue;
            }
            if let Some(key) = block.key() {
                if !seen.insert(key) {
                    duplicates += 1;
                    continue;
                }
            }
            kept += 1;
        }

        // a stray marker from an answer without a heading
        lines.extend(block.body.into_iter().filter(|line| !is_skip_marker(line)));
    }

    CleanedAbstracts {
        text: collapse_blank_lines(&lines),
        kept,
        skipped,
        duplicates,
    }
}

/// Runs of 3+ blank lines become 2 blank lines; trailing whitespace is trimmed.
fn collapse_blank_lines(lines: &[&str]) -> String {
    let mut out = String::new();
    let mut blank_run = 0;

    for line in lines {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run <= 2 {
                out.push('\n');
            }
        } else {
            blank_run = 0;
            out.push_str(line);
            out.push('\n');
        }
    }

    out.trim_end().to_string()
}
