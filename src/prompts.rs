//! System prompts and user-message framing for batch conversion.
//!
//! Every prompt lives here so unit tests can inspect them without a model.
//! Callers override the two system prompts via
//! [`crate::config::ProcessorConfig::text_prompt`] and
//! [`crate::config::ProcessorConfig::image_prompt`]; the constants below are
//! used only when no override is provided.

/// Default system prompt for the text-extraction request of a batch.
pub const TEXT_SYSTEM_PROMPT: &str = r#"You are a document digitisation engine converting batches of page images into Markdown. The pages form one continuous document: treat every batch as a continuation of the text that came before it.

Follow these rules precisely:

1. STRUCTURE AND FLOW
   - Rebuild the heading hierarchy (#, ##, ###, ...) from meaning, continuing the hierarchy described in the preceding context
   - Join sentences, paragraphs, lists and tables that cross a page break
   - Never emit page markers such as "Page 3" or "Page 3 of 10"
   - Drop running headers, footers and page numbers

2. TABLES
   - Transcribe every table found on the pages, including its number and title
   - Use HTML <table> markup, preserving rowspan, colspan and multi-line cells
   - Place each table as close to its visual position as possible without splitting a sentence

3. FORMULAS
   - Use LaTeX: $inline$ and $$display$$
   - Preserve the notation exactly

4. FIGURES
   - Link every figure, chart and diagram to its cropped image: ![{caption or short description}](images/{page_number}_fig{n}.png)
   - {page_number} is the page label given before the image; {n} counts the figures of that page from 1, top to bottom
   - Below the link, describe the visual content; do not merely repeat the caption
   - Keep figures next to the paragraph they belong to; if a figure interrupts a paragraph, finish the paragraph first

5. LISTS AND FOOTNOTES
   - Continue numbering across pages without restarting
   - Footnotes use [^n] markers with the definition below the paragraph that references them

6. OUTPUT FORMAT
   - Output ONLY the Markdown content
   - Do NOT wrap the output in ```markdown fences
   - Do NOT add commentary or explanations"#;

/// Default system prompt for the figure-extraction request of a batch.
pub const IMAGE_SYSTEM_PROMPT: &str = r#"You locate figures in document page images. A figure is any chart, graph, diagram, table, photograph, illustration or drawing. Running text is NOT a figure.

For every figure on every page, report:
- "page_number": the page label given before the image
- "fig_number": the figure's order on its page, counting from 1 top to bottom
- "bbox": [x0, y0, x1, y1] enclosing the figure and nothing else, with (0, 0) at the top-left corner of the page image
- "caption": the transcribed caption, or an empty string
- "element_type": one of "chart", "graph", "diagram", "table", "photo", "illustration", "other"

Respond with a single JSON object and nothing else:
{"regions": [{"page_number": 1, "fig_number": 1, "bbox": [0, 0, 0, 0], "caption": "", "element_type": "chart"}]}

List the regions of each page top to bottom.

When the pages contain no figures, respond with {"regions": []}."#;

/// Appended to the figure prompt when boxes are expected on a 0–1000 grid.
pub const NORMALIZED_BBOX_NOTE: &str = "\n\nExpress every bbox coordinate on a 0-1000 grid relative to the page width and height, not in pixels.";

/// Appended to the figure prompt when boxes are expected in pixels.
pub const PIXEL_BBOX_NOTE: &str =
    "\n\nExpress every bbox coordinate in pixels of the page image as given.";

pub const PRECEDING_CONTEXT_HEADER: &str =
    "## PRECEDING CONTEXT (read-only, use for flow continuity):";

pub const START_OF_DOCUMENT: &str = "[Start of Document]";

pub const BREADCRUMB_HEADER: &str = "### DOCUMENT LOCATION BREADCRUMB";

/// Label sent as text immediately before each page image.
pub fn page_label(page_num: u32) -> String {
    format!("Page {page_num}:")
}

/// Text that opens the user message: the preceding context followed by the
/// announcement of the images that follow.
pub fn build_user_preamble(context: &str, page_count: usize) -> String {
    let context = if context.trim().is_empty() {
        START_OF_DOCUMENT
    } else {
        context
    };
    format!(
        "{PRECEDING_CONTEXT_HEADER}\n{context}\n\n## NEW IMAGES TO TRANSCRIBE ({page_count} pages):"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context_becomes_start_marker() {
        let p = build_user_preamble("", 3);
        assert!(p.contains(START_OF_DOCUMENT));
        assert!(p.ends_with("(3 pages):"));
    }

    #[test]
    fn context_is_embedded_verbatim() {
        let ctx = "### DOCUMENT LOCATION BREADCRUMB\n# Intro";
        let p = build_user_preamble(ctx, 1);
        assert!(p.contains(ctx));
        assert!(!p.contains(START_OF_DOCUMENT));
    }

    #[test]
    fn image_prompt_names_every_schema_field() {
        for field in ["regions", "page_number", "fig_number", "bbox", "caption", "element_type"] {
            assert!(IMAGE_SYSTEM_PROMPT.contains(field), "missing {field}");
        }
    }

    #[test]
    fn figure_links_match_extracted_file_names() {
        assert!(TEXT_SYSTEM_PROMPT.contains("(images/{page_number}_fig{n}.png)"));
        assert!(IMAGE_SYSTEM_PROMPT.contains(r#""table""#));
    }

    #[test]
    fn text_prompt_forbids_fences() {
        assert!(TEXT_SYSTEM_PROMPT.contains("```markdown"));
    }
}
