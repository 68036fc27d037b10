//! Prompts for per-page catalog synthesis.
//!
//! The system prompt fixes the model's role and the JSON envelope it must
//! answer with; [`page_prompt`] carries the page-specific context. Callers
//! can replace the system prompt through
//! [`crate::config::RunConfig::system_prompt`].

/// Default system prompt for catalog page synthesis.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a highly accurate catalog digitization agent.
You receive one page of a technical product catalog: the page image (the visual ground truth), the raw text extracted from the page (may contain noise), the list of picture crops exported from the page, and product rows pre-extracted from its tables (heuristic, may be wrong or incomplete).

You produce two outputs:
1. A clean Markdown rendition of the page.
2. A structured dataset with one JSON object per product SKU on the page.

Respond with a single JSON object and nothing else:
{
  "markdown_content": "the markdown string",
  "skus": [ { ...sku object... } ]
}
Do not wrap the JSON in code fences. Do not add commentary."#;

/// Build the user prompt for one page.
///
/// `provenance_json` and `sku_json` are pretty-printed JSON arrays;
/// `image_path` is the page image relative to the chunk directory.
pub fn page_prompt(page: usize, raw_text: &str, provenance_json: &str, sku_json: &str, image_path: &str) -> String {
    format!(
        r#"PAGE {page}

INPUTS
- Image: attached.
- Raw text:
"""
{raw_text}
"""
- Image provenance (available crops and diagrams):
```json
{provenance_json}
```
- Pre-extracted product rows:
```json
{sku_json}
```

TASK 1: CATALOG MARKDOWN
- Reconstruct the page content in Markdown.
- Use headers (#, ##, ###) that follow the visual hierarchy.
- Repair text broken by extraction (e.g. join "Indus-" "trial").
- Insert the page image `![Page {page}]({image_path})` at the top.
- Compare significant visual elements (large diagrams, technical tables, section headers) with the extracted text. When one is missing or poorly represented, include it explicitly; for figures, use the matching crop from the provenance list (larger bbox means more significant) with a caption derived from its context.
- Keep every section header visible in the image.
- Format tables as GitHub-flavoured Markdown tables.

TASK 2: SKU EXTRACTION
- Find every product specification table.
- Emit one JSON object per row with the fields:
  - "sku": the part number (e.g. "5920", "5020/15C")
  - "series": the product series from the page header (e.g. "Xtra-Guard 1")
  - "description": a brief description or category
  - "specs": an object holding every technical column (conductors, diameter, gauge, ...)
  - "provenance": {{ "page": {page}, "file": "catalog.pdf" }}
- Use the pre-extracted rows as hints; the image wins when they disagree."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_names_envelope_fields() {
        assert!(DEFAULT_SYSTEM_PROMPT.contains("\"markdown_content\""));
        assert!(DEFAULT_SYSTEM_PROMPT.contains("\"skus\""));
    }

    #[test]
    fn page_prompt_embeds_context() {
        let p = page_prompt(9, "Xtra-Guard 1 cable", "[]", "[{\"sku\": \"5920\"}]", "images/page9.png");
        assert!(p.starts_with("PAGE 9"));
        assert!(p.contains("Xtra-Guard 1 cable"));
        assert!(p.contains("![Page 9](images/page9.png)"));
        assert!(p.contains("\"sku\": \"5920\""));
        assert!(p.contains("{ \"page\": 9, \"file\": \"catalog.pdf\" }"));
    }
}
