//! Cross-batch document context: the heading stack and its breadcrumb.
//!
//! After each committed batch the orchestrator scans the new markdown for
//! headings and folds them into a stack whose levels strictly increase from
//! root to leaf. The stack is rendered into the next batch's prompt so the
//! model continues the hierarchy instead of restarting it.

use crate::prompts::BREADCRUMB_HEADER;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One ATX heading: `level` is the number of `#`s (1–6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub level: u8,
    pub title: String,
}

impl HeaderEntry {
    pub fn new(level: u8, title: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
        }
    }
}

pub type HeaderStack = Vec<HeaderEntry>;

/// Fold `new_entries` into `stack`, in order: each entry pops every entry at
/// its level or deeper and is then pushed.
pub fn apply(stack: &mut HeaderStack, new_entries: &[HeaderEntry]) {
    for entry in new_entries {
        while stack.last().is_some_and(|top| top.level >= entry.level) {
            stack.pop();
        }
        stack.push(entry.clone());
    }
}

/// Render the breadcrumb for the last `window` entries of `stack`, one per
/// line and indented two spaces per level below 1. Empty stack → `""`.
pub fn render(stack: &[HeaderEntry], window: usize) -> String {
    if stack.is_empty() || window == 0 {
        return String::new();
    }
    let tail = &stack[stack.len().saturating_sub(window)..];
    let mut out = String::from(BREADCRUMB_HEADER);
    for entry in tail {
        let level = entry.level.max(1) as usize;
        out.push('\n');
        out.push_str(&"  ".repeat(level - 1));
        out.push_str(&"#".repeat(level));
        out.push(' ');
        out.push_str(&entry.title);
    }
    out
}

static RE_ATX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ {0,3}(#{1,6})[ \t]+(.*?)(?:[ \t]+#+)?[ \t]*$").unwrap());

static RE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ {0,3}(`{3,}|~{3,})").unwrap());

/// Scan markdown for ATX headings in document order, skipping fenced code.
pub fn extract_headings(markdown: &str) -> Vec<HeaderEntry> {
    let mut out = Vec::new();
    let mut open_fence: Option<String> = None;

    for line in markdown.lines() {
        if let Some(caps) = RE_FENCE.captures(line) {
            let marker = &caps[1];
            match &open_fence {
                None => open_fence = Some(marker.to_string()),
                Some(open)
                    if marker.starts_with(&open[..1]) && marker.len() >= open.len() =>
                {
                    open_fence = None;
                }
                Some(_) => {}
            }
            continue;
        }
        if open_fence.is_some() {
            continue;
        }
        if let Some(caps) = RE_ATX.captures(line) {
            let title = caps[2].trim();
            if !title.is_empty() && !title.chars().all(|c| c == '#') {
                out.push(HeaderEntry::new(caps[1].len() as u8, title));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(stack: &[HeaderEntry]) -> Vec<u8> {
        stack.iter().map(|e| e.level).collect()
    }

    #[test]
    fn deeper_heading_pushes() {
        let mut s = vec![HeaderEntry::new(1, "Intro")];
        apply(&mut s, &[HeaderEntry::new(2, "Scope")]);
        assert_eq!(levels(&s), vec![1, 2]);
    }

    #[test]
    fn same_level_replaces() {
        let mut s = vec![HeaderEntry::new(1, "A"), HeaderEntry::new(2, "A.1")];
        apply(&mut s, &[HeaderEntry::new(2, "A.2")]);
        assert_eq!(s.last().unwrap().title, "A.2");
        assert_eq!(levels(&s), vec![1, 2]);
    }

    #[test]
    fn shallower_heading_pops_to_parent() {
        let mut s = vec![
            HeaderEntry::new(1, "A"),
            HeaderEntry::new(2, "A.1"),
            HeaderEntry::new(4, "A.1.x"),
        ];
        apply(&mut s, &[HeaderEntry::new(2, "A.2")]);
        assert_eq!(levels(&s), vec![1, 2]);
        apply(&mut s, &[HeaderEntry::new(1, "B")]);
        assert_eq!(s, vec![HeaderEntry::new(1, "B")]);
    }

    #[test]
    fn levels_strictly_increase_after_any_sequence() {
        let seq = [3u8, 1, 4, 1, 5, 2, 6, 5, 3, 5, 6, 2, 1, 6, 6, 2];
        let mut s = HeaderStack::new();
        for (i, &lvl) in seq.iter().enumerate() {
            apply(&mut s, &[HeaderEntry::new(lvl, format!("h{i}"))]);
            assert!(
                s.windows(2).all(|w| w[0].level < w[1].level),
                "not increasing after step {i}: {:?}",
                levels(&s)
            );
            assert_eq!(s.last().unwrap().level, lvl);
        }
    }

    #[test]
    fn render_empty_is_empty() {
        assert_eq!(render(&[], 32), "");
    }

    #[test]
    fn render_indents_by_level() {
        let s = vec![HeaderEntry::new(1, "Guide"), HeaderEntry::new(3, "Setup")];
        let out = render(&s, 32);
        assert_eq!(
            out,
            "### DOCUMENT LOCATION BREADCRUMB\n# Guide\n    ### Setup"
        );
    }

    #[test]
    fn render_keeps_last_window_entries() {
        let s = vec![
            HeaderEntry::new(1, "A"),
            HeaderEntry::new(2, "B"),
            HeaderEntry::new(3, "C"),
        ];
        let out = render(&s, 2);
        assert!(!out.contains("# A"));
        assert!(out.contains("## B") && out.contains("### C"));
    }

    #[test]
    fn render_is_pure() {
        let s = vec![HeaderEntry::new(2, "X")];
        assert_eq!(render(&s, 32), render(&s, 32));
        assert_eq!(s, vec![HeaderEntry::new(2, "X")]);
    }

    #[test]
    fn extracts_headings_in_order() {
        let md = "# Title\n\ntext\n\n## Part one ##\n### \n####### seven\n#nospace\n   ### Indented";
        let h = extract_headings(md);
        assert_eq!(
            h,
            vec![
                HeaderEntry::new(1, "Title"),
                HeaderEntry::new(2, "Part one"),
                HeaderEntry::new(3, "Indented"),
            ]
        );
    }

    #[test]
    fn ignores_headings_in_fenced_code() {
        let md = "## Real\n```bash\n# not a heading\n```\n~~~\n## also code\n~~~\n### After";
        let titles: Vec<_> = extract_headings(md).into_iter().map(|h| h.title).collect();
        assert_eq!(titles, vec!["Real", "After"]);
    }
}
