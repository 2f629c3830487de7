//! Deterministic cleanup of model output.
//!
//! Even a well-prompted model sometimes wraps its answer in ```` ```markdown ````
//! fences, emits CRLF line endings, sprinkles zero-width characters, or
//! invents placeholder image links. Links to the figures this crate crops
//! (`images/{page}_fig{n}.png`) are kept. These rules fix such quirks without
//! touching content, so the prompt can stay focused on what to extract.
//!
//! Rules run in a fixed order: fences come off before line endings are
//! normalised, and table repair runs on whitespace-trimmed lines.

use once_cell::sync::Lazy;
use regex::Regex;

type Rule = fn(&str) -> String;

const RULES: &[(&str, Rule)] = &[
    ("strip fences", strip_markdown_fences),
    ("line endings", normalise_line_endings),
    ("invisible chars", remove_invisible_chars),
    ("trailing whitespace", trim_trailing_whitespace),
    ("blank lines", collapse_blank_lines),
    ("table separators", fix_table_separators),
    ("placeholder images", remove_placeholder_images),
];

/// Apply every cleanup rule to one batch of model output.
///
/// The result has no leading or trailing blank lines; an empty or
/// whitespace-only answer becomes `""`.
pub fn clean_markdown(input: &str) -> String {
    let mut s = input.to_string();
    for (_name, rule) in RULES {
        s = rule(&s);
    }
    s.trim_matches('\n').to_string()
}

// ── Fences ───────────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[ \t]*(?:markdown|md)?[ \t]*\r?\n(.*?)\r?\n?```\s*$").unwrap());

static RE_JSON_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[ \t]*(?:json)?[ \t]*\r?\n(.*?)\r?\n?```\s*$").unwrap());

/// Remove one pair of fences wrapping the whole answer.
pub fn strip_markdown_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

/// Pull the JSON object out of a structured reply: drops ```` ```json ````
/// fences and any prose before the first `{` or after the last `}`.
pub fn extract_json_object(input: &str) -> &str {
    let trimmed = input.trim();
    let inner = match RE_JSON_FENCES.captures(trimmed) {
        Some(caps) => caps.get(1).map_or(trimmed, |m| m.as_str()),
        None => trimmed,
    };
    match (inner.find('{'), inner.rfind('}')) {
        (Some(start), Some(end)) if start < end => &inner[start..=end],
        _ => inner,
    }
}

// ── Whitespace ───────────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{00AD}',
        ],
        "",
    )
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_RUN.replace_all(input, "\n\n").into_owned()
}

// ── Pipe tables ──────────────────────────────────────────────────────────

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|')
        && t.contains('-')
        && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Each pipe table gets exactly one separator row, directly under its header.
fn fix_table_separators(input: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut row_in_table = 0usize;

    for line in input.lines() {
        if !is_table_row(line) {
            row_in_table = 0;
            out.push(line.to_string());
            continue;
        }
        row_in_table += 1;
        let separator = is_separator_row(line);
        match (row_in_table, separator) {
            (1, _) | (2, true) => out.push(line.to_string()),
            (2, false) => {
                let cols = out
                    .last()
                    .map_or(1, |h| h.trim().matches('|').count().saturating_sub(1).max(1));
                out.push(format!("|{}", " --- |".repeat(cols)));
                out.push(line.to_string());
                row_in_table = 3;
            }
            (_, true) => {}
            (_, false) => out.push(line.to_string()),
        }
    }
    out.join("\n")
}

// ── Placeholder images ───────────────────────────────────────────────────

static RE_IMAGE_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

const PLACEHOLDER_HOSTS: &[&str] = &[
    "example.com",
    "placeholder.com",
    "dummyimage.com",
    "placehold.it",
    "picsum.photos",
];

static RE_FIGURE_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\./)?(?:images/)?\d+_fig\d+\.png$").unwrap());

fn is_placeholder_url(url: &str) -> bool {
    let u = url.trim();
    if RE_FIGURE_FILE.is_match(u) {
        return false;
    }
    !(u.starts_with("http://") || u.starts_with("https://"))
        || PLACEHOLDER_HOSTS.iter().any(|h| u.contains(h))
}

/// `![alt](fake.png)` → `*alt*`. Real absolute links and extracted-figure
/// links are kept.
fn remove_placeholder_images(input: &str) -> String {
    RE_IMAGE_LINK
        .replace_all(input, |caps: &regex::Captures<'_>| {
            if !is_placeholder_url(&caps[2]) {
                return caps[0].to_string();
            }
            let alt = caps[1].trim();
            if alt.is_empty() {
                String::new()
            } else {
                format!("*{alt}*")
            }
        })
        .into_owned()
}
