//! Deterministic cleanup of model-generated page Markdown.
//!
//! Rules, in order:
//!
//! 1. strip an outer ```` ```markdown ```` fence
//! 2. CRLF / CR → LF
//! 3. trim trailing whitespace per line
//! 4. collapse runs of blank lines
//! 5. blank line before every heading
//! 6. insert a missing GFM separator row after a table header
//! 7. drop separator rows inside a table body
//! 8. keep image links only when they point at an image exported for this
//!    chunk; anything else becomes its alt text in italics
//! 9. strip invisible Unicode
//! 10. exactly one trailing newline
//!
//! Line endings must be normalised before any line-based rule, and images
//! are checked after table repair so link text inside cells survives.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Apply every rule. `exported_images` holds the file names (e.g.
/// `page9.png`, `crop_page_9_2.png`) that exist in the chunk's `images/`.
pub fn clean_markdown(input: &str, exported_images: &HashSet<String>) -> String {
    let s = strip_outer_fence(input);
    let s = normalise_line_endings(&s);
    let s = trim_line_ends(&s);
    let s = collapse_blank_lines(&s);
    let s = space_headings(&s);
    let s = insert_missing_separators(&s);
    let s = drop_body_separators(&s);
    let s = keep_exported_images(&s, exported_images);
    let s = strip_invisible(&s);
    single_final_newline(&s)
}

static OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\n(.*)\n```\s*$").expect("valid regex"));

fn strip_outer_fence(input: &str) -> String {
    match OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_line_ends(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

static BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").expect("valid regex"));

fn collapse_blank_lines(input: &str) -> String {
    BLANK_RUN.replace_all(input, "\n\n\n").into_owned()
}

fn is_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    (1..=6).contains(&hashes) && line[hashes..].starts_with(' ')
}

fn space_headings(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 32);
    for (i, line) in input.lines().enumerate() {
        if i > 0 && is_heading(line) {
            let kept = out.trim_end_matches('\n').len();
            out.truncate(kept);
            out.push_str("\n\n");
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.contains('-') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn insert_missing_separators(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 4);
    let mut prev_in_table = false;

    for (i, line) in lines.iter().enumerate() {
        out.push(line.to_string());
        let row = is_table_row(line);
        let starts_table = row && !prev_in_table && !is_separator_row(line);
        if starts_table {
            let next = lines.get(i + 1).copied().unwrap_or("");
            if is_table_row(next) && !is_separator_row(next) {
                let cols = line.trim().matches('|').count().saturating_sub(1).max(1);
                out.push(format!("|{}", " --- |".repeat(cols)));
            }
        }
        prev_in_table = row;
    }
    out.join("\n")
}

fn drop_body_separators(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut position = 0usize;
    for line in input.lines() {
        if is_table_row(line) {
            position += 1;
            if is_separator_row(line) && position != 2 {
                continue;
            }
        } else {
            position = 0;
        }
        out.push(line);
    }
    out.join("\n")
}

static IMAGE_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)\s]*)(?:\s+[^)]*)?\)").expect("valid regex"));

fn keep_exported_images(input: &str, exported: &HashSet<String>) -> String {
    IMAGE_LINK
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let target = caps[2].trim();
            let local = !target.contains("://");
            let file = target.rsplit('/').next().unwrap_or(target);
            if local && !file.is_empty() && exported.contains(file) {
                caps[0].to_string()
            } else {
                let alt = caps[1].trim();
                if alt.is_empty() {
                    String::new()
                } else {
                    format!("*{alt}*")
                }
            }
        })
        .into_owned()
}

fn strip_invisible(input: &str) -> String {
    input.replace(['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{00AD}'], "")
}

fn single_final_newline(input: &str) -> String {
    let t = input.trim_end();
    if t.is_empty() {
        "\n".to_string()
    } else {
        format!("{t}\n")
    }
}
