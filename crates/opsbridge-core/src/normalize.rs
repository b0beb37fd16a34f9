//! Execution-log normalization.
//!
//! Remote job logs are redundant across retries and pagination, decorated
//! with terminal styling, and occasionally wrapped one line at a time in
//! single-key JSON objects. This module turns them into a stable report:
//!
//! 1. strip per-line timestamp prefixes and ANSI escape sequences;
//! 2. unwrap single-key JSON object lines whose value is a string;
//! 3. on a results-table marker, discard everything collected so far and
//!    keep only the value column of subsequent two-column rows;
//! 4. treat runs of three or more dashes as section boundaries;
//! 5. collapse consecutive duplicate lines, collapse blank runs, and drop
//!    blocks whose normalized content repeats an earlier block;
//! 6. regroup recognized section headers into a fixed category order with a
//!    visible separator between non-empty groups.
//!
//! The pipeline is idempotent: feeding its own output back through produces
//! the same text. Sections it cannot classify are never discarded — they
//! land in the trailing miscellaneous group.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Marker line (case-insensitive substring) announcing a key/value results
/// table; everything collected before it is noise.
const TABLE_MARKER: &str = "key value data: results";

/// Separator rendered between non-empty section groups.
const GROUP_SEPARATOR: &str = "\n\n-----------------------\n\n";

static TIMESTAMP_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}:\d{2}:\d{2}\s+").expect("valid timestamp prefix regex"));
static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ANSI escape regex"));
static HORIZONTAL_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-{3,}$").expect("valid horizontal rule regex"));
static COLUMN_GAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("valid column gap regex"));
static BLANK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n+").expect("valid blank run regex"));
static BLOCK_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\n+").expect("valid block split regex"));
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace run regex"));
static SECTION_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:Cloud Account ID:|Cloud Region:|Frontends of the environment:|Database of the environment:|Details for [^\n]+)\s*$",
    )
    .expect("valid section header regex")
});

/// Report categories, in render order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionGroup {
    Account,
    Frontend,
    AppPool,
    Database,
    Misc,
}

const GROUP_ORDER: [SectionGroup; 5] = [
    SectionGroup::Account,
    SectionGroup::Frontend,
    SectionGroup::AppPool,
    SectionGroup::Database,
    SectionGroup::Misc,
];

impl SectionGroup {
    const fn index(self) -> usize {
        match self {
            Self::Account => 0,
            Self::Frontend => 1,
            Self::AppPool => 2,
            Self::Database => 3,
            Self::Misc => 4,
        }
    }
}

/// Unwraps a line that is a single-key JSON object with a string value.
///
/// Restores doubly escaped newlines, tabs, and quotes left over from the
/// one-shot wrapping.
fn unwrap_single_kv(line: &str) -> Option<String> {
    let t = line.trim();
    if !(t.starts_with('{') && t.ends_with('}')) {
        return None;
    }
    let parsed: serde_json::Value = serde_json::from_str(t).ok()?;
    let object = parsed.as_object()?;
    if object.len() != 1 {
        return None;
    }
    let value = object.values().next()?.as_str()?;
    Some(
        value
            .replace("\\n", "\n")
            .replace("\\t", "\t")
            .replace("\\\"", "\"")
            .trim()
            .to_string(),
    )
}

/// Strips the timestamp prefix and ANSI escapes, then tries the single-key
/// JSON unwrap.
fn clean_line(raw: &str) -> String {
    let without_ts = TIMESTAMP_PREFIX.replace(raw, "");
    let without_ansi = ANSI_ESCAPE.replace_all(&without_ts, "");
    let line = without_ansi.trim_end();
    unwrap_single_kv(line).unwrap_or_else(|| line.to_string())
}

fn flush_section(keep: &mut Vec<String>, section: &mut Vec<String>) {
    if !section.is_empty() {
        keep.append(section);
        keep.push(String::new());
    }
}

/// Classifies a section header into its render group.
///
/// `Details for …` headers are disambiguated by the time-window substrings
/// their producers embed: 15m/1m windows mean application-pool metrics,
/// 2m/30m windows mean frontend metrics.
fn classify_header(header: &str) -> SectionGroup {
    let h = header.trim().to_lowercase();
    if h.starts_with("cloud account id:") || h.starts_with("cloud region:") {
        SectionGroup::Account
    } else if h.starts_with("frontends of the environment:") {
        SectionGroup::Frontend
    } else if h.starts_with("details for")
        && (h.contains("last 15m") || h.contains("bucket aggregation of 1m"))
    {
        SectionGroup::AppPool
    } else if h.starts_with("details for") && (h.contains("2m") || h.contains("30m")) {
        SectionGroup::Frontend
    } else if h.starts_with("database of the environment:") || h.starts_with("details for db") {
        SectionGroup::Database
    } else {
        SectionGroup::Misc
    }
}

fn normalized_block_key(block: &str) -> String {
    WHITESPACE_RUN
        .replace_all(&block.to_lowercase(), " ")
        .trim()
        .to_string()
}

/// Re-segments deduplicated blocks at known section headers and re-emits
/// them grouped by category, first occurrence of each header winning.
///
/// Segmentation restarts at every block boundary so that an unclassified
/// block stays its own (miscellaneous) section instead of attaching to the
/// preceding header; this keeps the pipeline idempotent across passes.
fn group_sections(blocks: &[&str]) -> String {
    let mut sections: Vec<String> = Vec::new();
    for block in blocks {
        let mut current: Vec<&str> = Vec::new();
        for line in block.split('\n') {
            if SECTION_HEADER.is_match(line.trim()) && !current.is_empty() {
                sections.push(current.join("\n").trim().to_string());
                current.clear();
            }
            current.push(line);
        }
        if !current.is_empty() {
            sections.push(current.join("\n").trim().to_string());
        }
    }

    let mut seen_headers = HashSet::new();
    let mut groups: [Vec<String>; 5] = std::array::from_fn(|_| Vec::new());
    for section in sections {
        let first_line = section.split('\n').next().unwrap_or("");
        if !seen_headers.insert(normalized_block_key(first_line)) {
            continue;
        }
        let group = classify_header(first_line);
        groups[group.index()].push(section);
    }

    let rendered: Vec<String> = GROUP_ORDER
        .iter()
        .map(|group| groups[group.index()].join("\n\n").trim().to_string())
        .filter(|group| !group.is_empty())
        .collect();
    rendered.join(GROUP_SEPARATOR).trim().to_string()
}

/// Normalizes raw execution-log lines into the final report text.
#[must_use]
pub fn normalize_log_lines<I, S>(lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut keep: Vec<String> = Vec::new();
    let mut section: Vec<String> = Vec::new();
    let mut in_table = false;
    let mut in_value_column = false;

    for raw in lines {
        let line = clean_line(raw.as_ref());
        let trimmed = line.trim();
        if trimmed.is_empty() {
            // A blank is a soft block boundary (runs collapse via the
            // no-op flush); inside a results table it is formatting noise.
            if !in_table {
                flush_section(&mut keep, &mut section);
            }
            continue;
        }

        if HORIZONTAL_RULE.is_match(trimmed) {
            in_table = false;
            in_value_column = false;
            flush_section(&mut keep, &mut section);
            continue;
        }
        if line.to_lowercase().contains(TABLE_MARKER) {
            keep.clear();
            section.clear();
            in_table = true;
            in_value_column = false;
            continue;
        }

        if in_table {
            let header = trimmed.to_lowercase();
            if header == "key" {
                continue;
            }
            if header == "value" {
                in_value_column = true;
                continue;
            }
            if in_value_column {
                if let Some(cell) = COLUMN_GAP.split(&line).last() {
                    if !cell.trim().is_empty() {
                        section.push(cell.to_string());
                    }
                }
            }
            continue;
        }

        section.push(line);
    }
    flush_section(&mut keep, &mut section);

    let mut deduped: Vec<String> = Vec::new();
    for line in keep {
        if deduped.last() != Some(&line) {
            deduped.push(line);
        }
    }

    let joined = deduped.join("\n").replace("\r\n", "\n");
    let collapsed = BLANK_RUN.replace_all(joined.trim(), "\n\n");

    let mut seen_blocks = HashSet::new();
    let mut blocks: Vec<&str> = Vec::new();
    for block in BLOCK_SPLIT.split(&collapsed) {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        if seen_blocks.insert(normalized_block_key(block)) {
            blocks.push(block);
        }
    }

    group_sections(&blocks)
}

/// Normalizes already-joined text (one log line per text line).
#[must_use]
pub fn normalize_text(raw: &str) -> String {
    normalize_log_lines(raw.split('\n'))
}
