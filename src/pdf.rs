//! PDF backend: page counting, text extraction, slicing and rasterisation.
//!
//! Every operation binds pdfium, opens the document and does its work inside
//! `tokio::task::spawn_blocking`. pdfium keeps thread-local state and is
//! CPU-bound, so none of it may run on a Tokio worker thread.
//!
//! Page numbers in this module are 1-based and inclusive, matching the
//! numbering used in `state.json`.

use crate::error::CatalogError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit pdfium shared library.
pub const PDFIUM_LIB_ENV: &str = "PDFIUM_LIB_PATH";

/// Bind to a pdfium library.
///
/// Lookup order: `$PDFIUM_LIB_PATH`, a library next to the working
/// directory, then the system library search path.
pub fn bind_pdfium() -> Result<Pdfium, CatalogError> {
    if let Ok(path) = std::env::var(PDFIUM_LIB_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Pdfium::bind_to_library(&path)
                .map(Pdfium::new)
                .map_err(|e| {
                    CatalogError::PdfiumBindingFailed(format!(
                        "{}={}: {:?}",
                        PDFIUM_LIB_ENV,
                        path.display(),
                        e
                    ))
                });
        }
        warn!(
            "{} is set to '{}' but the file does not exist; falling back",
            PDFIUM_LIB_ENV,
            path.display()
        );
    }

    Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map(Pdfium::new)
        .map_err(|e| CatalogError::PdfiumBindingFailed(format!("{:?}", e)))
}

fn open<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, CatalogError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| CatalogError::CorruptPdf {
            path: path.to_path_buf(),
            detail: format!("{:?}", e),
        })
}

async fn blocking<T, F>(what: &'static str, f: F) -> Result<T, CatalogError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CatalogError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CatalogError::Internal(format!("{} task panicked: {}", what, e)))?
}

/// Number of pages in the document.
pub async fn page_count(path: &Path) -> Result<usize, CatalogError> {
    let path = path.to_path_buf();
    blocking("page count", move || {
        let pdfium = bind_pdfium()?;
        let document = open(&pdfium, &path)?;
        Ok(document.pages().len() as usize)
    })
    .await
}

/// Text of pages `first..=last`, one string per page.
///
/// Pages beyond the end of the document are ignored. A page whose text
/// layer cannot be read yields an empty string.
pub async fn page_texts(path: &Path, first: usize, last: usize) -> Result<Vec<String>, CatalogError> {
    let path = path.to_path_buf();
    blocking("text extraction", move || {
        let pdfium = bind_pdfium()?;
        let document = open(&pdfium, &path)?;
        let pages = document.pages();
        let total = pages.len() as usize;

        let mut texts = Vec::new();
        for number in first.max(1)..=last.min(total) {
            let text = pages
                .get((number - 1) as u16)
                .ok()
                .and_then(|page| page.text().ok().map(|t| t.all()))
                .unwrap_or_else(|| {
                    debug!("No text layer on page {}", number);
                    String::new()
                });
            texts.push(text);
        }
        Ok(texts)
    })
    .await
}

/// Copy pages `start..=end` of `source` into a new PDF at `dest`.
pub async fn slice_pages(source: &Path, start: usize, end: usize, dest: &Path) -> Result<(), CatalogError> {
    let source = source.to_path_buf();
    let dest = dest.to_path_buf();
    blocking("slice", move || {
        let slice_err = |detail: String| CatalogError::SliceFailed { start, end, detail };

        let pdfium = bind_pdfium()?;
        let src = open(&pdfium, &source)?;
        let total = src.pages().len() as usize;
        if start == 0 || start > end || end > total {
            return Err(slice_err(format!("range outside document of {} pages", total)));
        }

        let mut out = pdfium
            .create_new_pdf()
            .map_err(|e| slice_err(format!("{:?}", e)))?;
        out.pages_mut()
            .copy_page_range_from_document(&src, (start - 1) as u16..=(end - 1) as u16, 0)
            .map_err(|e| slice_err(format!("{:?}", e)))?;
        out.save_to_file(&dest)
            .map_err(|e| slice_err(format!("{:?}", e)))?;

        debug!("Sliced pages {}-{} → {}", start, end, dest.display());
        Ok(())
    })
    .await
}

/// Rasterise every page of `path` at `scale` (1.0 = 72 DPI).
///
/// Returns `(page_number_1based, image)` pairs in page order.
pub async fn render_pages(path: &Path, scale: f32) -> Result<Vec<(usize, DynamicImage)>, CatalogError> {
    let path = path.to_path_buf();
    blocking("render", move || {
        let pdfium = bind_pdfium()?;
        let document = open(&pdfium, &path)?;
        let pages = document.pages();
        info!("Rendering {} page(s) of {} at {}x", pages.len(), path.display(), scale);

        let render_config = PdfRenderConfig::new().scale_page_by_factor(scale);
        let mut results = Vec::with_capacity(pages.len() as usize);
        for (idx, page) in pages.iter().enumerate() {
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| CatalogError::CorruptPdf {
                    path: path.clone(),
                    detail: format!("page {}: {:?}", idx + 1, e),
                })?;
            let image = bitmap.as_image();
            debug!("Rendered page {} → {}x{} px", idx + 1, image.width(), image.height());
            results.push((idx + 1, image));
        }
        Ok(results)
    })
    .await
}
