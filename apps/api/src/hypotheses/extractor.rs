//! Pulls `**Hypothesis N: Title**` blocks out of the marked region of an
//! assistant reply.
//!
//! The region is scanned line by line. A heading line opens a block; every
//! following line up to the next heading (or the end marker) is its
//! description. A block only counts once something closes it, so a reply cut
//! off mid-hypothesis never yields a half-written record.
//!
//! Ids are derived from `(chat_id, message_id, ordinal)` alone, so extracting
//! the same message twice produces the same ids and the store can upsert.

use serde::Serialize;
use uuid::Uuid;

pub const START_MARKER: &str = "<!-- HYPOTHESES_START -->";
pub const END_MARKER: &str = "<!-- HYPOTHESES_END -->";
/// Column width of `hypotheses.id`.
pub const MAX_ID_LEN: usize = 100;

const ID_PREFIX: &str = "hyp_";
const HEADING_KEYWORD: &str = "Hypothesis ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedHypothesis {
    pub id: String,
    pub title: String,
    pub description: String,
    pub order_index: i32,
}

/// `hyp_<chatId>_<messageId>_<ordinal>`. Hyphenated UUIDs and an `i32`
/// ordinal keep this under `MAX_ID_LEN` (at most 89 characters).
pub fn hypothesis_id(chat_id: Uuid, message_id: Uuid, ordinal: i32) -> String {
    let id = format!("{ID_PREFIX}{chat_id}_{message_id}_{ordinal}");
    debug_assert!(id.len() <= MAX_ID_LEN);
    id
}

/// Inverse of [`hypothesis_id`].
pub fn parse_hypothesis_id(id: &str) -> Option<(Uuid, Uuid, i32)> {
    let rest = id.strip_prefix(ID_PREFIX)?;
    let mut fields = rest.splitn(3, '_');
    let chat_id = Uuid::parse_str(fields.next()?).ok()?;
    let message_id = Uuid::parse_str(fields.next()?).ok()?;
    let ordinal = fields.next()?.parse::<i32>().ok()?;
    (ordinal >= 1).then_some((chat_id, message_id, ordinal))
}

struct OpenBlock {
    number: u32,
    title: String,
    lines: Vec<String>,
}

struct Block {
    number: u32,
    title: String,
    description: String,
}

/// Extracts the hypotheses of one assistant message.
///
/// Returns an empty list when the start marker is missing or nothing inside
/// the region parses. Blocks are ordered by their declared number and given
/// dense order indices starting at 1; a repeated number keeps its first block.
pub fn extract_hypotheses(
    text: &str,
    chat_id: Uuid,
    message_id: Uuid,
) -> Vec<ExtractedHypothesis> {
    let Some((region, terminated)) = find_region(text) else {
        return Vec::new();
    };

    let mut blocks = scan_blocks(region, terminated);
    blocks.sort_by_key(|b| b.number);
    blocks.dedup_by_key(|b| b.number);

    blocks
        .into_iter()
        .zip(1..)
        .map(|(block, order_index)| ExtractedHypothesis {
            id: hypothesis_id(chat_id, message_id, order_index),
            title: block.title,
            description: block.description,
            order_index,
        })
        .collect()
}

/// The text between the markers, and whether the end marker was present.
fn find_region(text: &str) -> Option<(&str, bool)> {
    let start = text.find(START_MARKER)? + START_MARKER.len();
    let region = &text[start..];
    match region.find(END_MARKER) {
        Some(end) => Some((&region[..end], true)),
        None => Some((region, false)),
    }
}

fn scan_blocks(region: &str, terminated: bool) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut current: Option<OpenBlock> = None;

    for line in region.lines() {
        if let Some((number, title)) = parse_heading(line) {
            if let Some(done) = current.take() {
                blocks.extend(close_block(done));
            }
            current = Some(OpenBlock {
                number,
                title,
                lines: Vec::new(),
            });
        } else if let Some(open) = current.as_mut() {
            open.lines.push(line.to_string());
        }
    }

    if terminated {
        if let Some(done) = current {
            blocks.extend(close_block(done));
        }
    }

    blocks
}

fn close_block(open: OpenBlock) -> Option<Block> {
    let description = open.lines.join("\n").trim().to_string();
    if open.title.is_empty() || description.is_empty() {
        return None;
    }
    Some(Block {
        number: open.number,
        title: open.title,
        description,
    })
}

/// Recognizes `**Hypothesis 3: Title**`, also with markdown `#` prefixes or
/// with the bold closing right after the colon.
fn parse_heading(line: &str) -> Option<(u32, String)> {
    let s = line.trim().trim_start_matches('#').trim_start();
    let s = s.strip_prefix("**").unwrap_or(s);
    let s = s.strip_prefix(HEADING_KEYWORD)?;

    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if digits_end == 0 {
        return None;
    }
    let number = s[..digits_end].parse::<u32>().ok()?;
    let rest = s[digits_end..].strip_prefix(':')?;

    let title = rest.trim();
    let title = title.strip_prefix("**").unwrap_or(title);
    let title = title.strip_suffix("**").unwrap_or(title).trim();
    Some((number, title.to_string()))
}
