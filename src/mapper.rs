//! Catalog mapper: derive sections from the table of contents.
//!
//! The first few pages are scanned for lines shaped like
//!
//! ```text
//! Xtra-Guard Performance Cable      8
//! EcoGen Cable ................. 109
//! ```
//!
//! i.e. a name, a run of at least two dots or two whitespace characters, and
//! a trailing page number. Each accepted line starts a section; a section
//! runs until the page before the next one starts, and the last one runs to
//! the end of the document. This is a best-effort heuristic: a catalog whose
//! TOC is formatted differently silently yields wrong boundaries, and one
//! with no recognisable TOC becomes a single `"Full Catalog"` section.

use crate::config::PlanConfig;
use crate::error::CatalogError;
use crate::pdf;
use crate::state::{CatalogStructure, Section};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Name of the fallback section used when no TOC entries are found.
pub const FULL_CATALOG: &str = "Full Catalog";

static TOC_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(.+?)(?:\.{2,}|\s{2,})(\d+)$").expect("valid regex"));

/// Derive the ordered section list from TOC text.
///
/// `total_pages` must be at least 1.
pub fn map_sections(toc_text: &str, total_pages: usize, config: &PlanConfig) -> Vec<Section> {
    let text = toc_text.replace("\r\n", "\n").replace('\r', "\n");

    let mut seen = HashSet::new();
    let mut starts: Vec<(String, usize)> = Vec::new();

    for caps in TOC_LINE.captures_iter(&text) {
        let name = caps[1].trim();
        let Ok(page) = caps[2].parse::<usize>() else {
            continue;
        };

        if page < config.min_section_page {
            continue;
        }
        if name.chars().count() > config.max_section_name_len {
            continue;
        }
        if page > total_pages {
            debug!("Ignoring TOC entry '{}' → page {} beyond document end", name, page);
            continue;
        }
        if !seen.insert(page) {
            continue;
        }
        starts.push((name.to_string(), page));
    }

    // Stable, so entries sharing nothing but order keep TOC order.
    starts.sort_by_key(|(_, page)| *page);

    if starts.is_empty() {
        warn!("No sections found in TOC; using a single '{}' section", FULL_CATALOG);
        return vec![Section {
            name: FULL_CATALOG.to_string(),
            start_page: 1,
            end_page: total_pages,
        }];
    }

    let next_starts: Vec<usize> = starts.iter().skip(1).map(|(_, p)| *p).collect();
    starts
        .into_iter()
        .enumerate()
        .map(|(i, (name, start_page))| Section {
            name,
            start_page,
            end_page: next_starts.get(i).map_or(total_pages, |next| next - 1),
        })
        .collect()
}

/// Map the catalog at `pdf_path` into sections.
pub async fn map_catalog(pdf_path: &Path, config: &PlanConfig) -> Result<CatalogStructure, CatalogError> {
    let total_pages = pdf::page_count(pdf_path).await?;
    if total_pages == 0 {
        return Err(CatalogError::EmptyDocument {
            path: pdf_path.to_path_buf(),
        });
    }

    let scan = config.toc_scan_pages.min(total_pages);
    let toc_text = pdf::page_texts(pdf_path, 1, scan)
        .await?
        .into_iter()
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let sections = map_sections(&toc_text, total_pages, config);
    info!(
        "Mapped {} section(s) across {} page(s)",
        sections.len(),
        total_pages
    );
    for s in &sections {
        debug!("  {} → pages {}-{}", s.name, s.start_page, s.end_page);
    }

    Ok(CatalogStructure {
        source: pdf_path.to_path_buf(),
        total_pages,
        sections,
    })
}
