//! Document conversion: chunk PDF → page images, picture crops, structural
//! export and provenance map.
//!
//! Everything a converter produces lands in the chunk directory:
//!
//! ```text
//! runs/<s>_<e>/
//!   images/page<N>.png               N = local page + offset
//!   images/crop_page_<N>_<id>.png
//!   metadata.json                    DoclingDocument-shaped tree
//!   image_provenance_map.json / .md
//! ```

use super::document::{BoundingBox, DocItem, DoclingDocument, PageItem, PageSize, ProvenanceItem, RefItem};
use crate::error::ChunkError;
use crate::pdf;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

pub const IMAGES_DIR: &str = "images";
pub const METADATA_FILE: &str = "metadata.json";
pub const PROVENANCE_JSON: &str = "image_provenance_map.json";
pub const PROVENANCE_MD: &str = "image_provenance_map.md";

/// `page<N>.png`
pub fn page_image_name(page: usize) -> String {
    format!("page{page}.png")
}

/// Links an exported picture crop to its page and bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub filename: String,
    pub page_number: usize,
    pub bbox: Option<[f64; 4]>,
    pub label: String,
    pub self_ref: String,
    pub text_context: String,
    /// Relative to the chunk directory, e.g. `images/crop_page_9_2.png`.
    pub path: String,
}

/// What a conversion left behind.
#[derive(Debug, Clone, Default)]
pub struct ConversionArtifacts {
    /// `(real page number, path)` for every full-page image, in page order.
    pub page_images: Vec<(usize, PathBuf)>,
    pub provenance: Vec<ProvenanceEntry>,
    pub metadata: PathBuf,
}

/// Turns a chunk PDF into images and a structural export.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    fn name(&self) -> &str;

    /// Convert `pdf` into `out_dir`. Page numbers written to disk are
    /// shifted by `page_offset`; page numbers inside `metadata.json` stay
    /// local to the chunk.
    async fn convert(&self, pdf: &Path, out_dir: &Path, page_offset: usize) -> Result<ConversionArtifacts, ChunkError>;
}

/// Which converter the runner should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConverterKind {
    #[default]
    Pdfium,
    Docling,
}

impl FromStr for ConverterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pdfium" => Ok(ConverterKind::Pdfium),
            "docling" => Ok(ConverterKind::Docling),
            other => Err(format!("unknown converter '{other}' (expected pdfium or docling)")),
        }
    }
}

impl fmt::Display for ConverterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConverterKind::Pdfium => "pdfium",
            ConverterKind::Docling => "docling",
        })
    }
}

// ── Shared output helpers ────────────────────────────────────────────────

fn conversion_failed(detail: impl fmt::Display) -> ChunkError {
    ChunkError::ConversionFailed {
        detail: detail.to_string(),
    }
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, ChunkError> + Send + 'static,
) -> Result<T, ChunkError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| conversion_failed(format!("image task panicked: {e}")))?
}

/// Decode arbitrary image bytes and store them as PNG.
fn save_png_bytes(bytes: &[u8], path: &Path) -> Result<(), ChunkError> {
    let img = image::load_from_memory(bytes).map_err(|e| ChunkError::io(path, e))?;
    img.save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| ChunkError::io(path, e))
}

fn bbox_display(bbox: Option<[f64; 4]>) -> String {
    bbox.map_or_else(
        || "N/A".to_string(),
        |[l, t, r, b]| format!("({l:.1}, {t:.1}, {r:.1}, {b:.1})"),
    )
}

/// Human-readable companion of the provenance JSON.
pub fn render_provenance_markdown(source_name: &str, entries: &[ProvenanceEntry]) -> String {
    let mut md = format!(
        "# Image Provenance Map\n\nSource Document: {source_name}\n\n\
         | Image | Page | Context/Caption | Coordinates |\n\
         | :--- | :---: | :--- | :--- |\n"
    );
    for e in entries {
        md.push_str(&format!(
            "| ![]({}) | {} | {} | {} |\n",
            e.path,
            e.page_number,
            e.text_context.replace('|', "\\|").replace('\n', " "),
            bbox_display(e.bbox),
        ));
    }
    md
}

/// Write `image_provenance_map.json` and `.md`.
pub async fn write_provenance(out_dir: &Path, source: &Path, entries: &[ProvenanceEntry]) -> Result<(), ChunkError> {
    let json_path = out_dir.join(PROVENANCE_JSON);
    let json = serde_json::to_string_pretty(entries).map_err(|e| ChunkError::io(&json_path, e))?;
    tokio::fs::write(&json_path, json)
        .await
        .map_err(|e| ChunkError::io(&json_path, e))?;

    let md_path = out_dir.join(PROVENANCE_MD);
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tokio::fs::write(&md_path, render_provenance_markdown(&name, entries))
        .await
        .map_err(|e| ChunkError::io(&md_path, e))
}

/// Load the provenance entries a conversion wrote, or none if absent.
pub async fn read_provenance(out_dir: &Path) -> Result<Vec<ProvenanceEntry>, ChunkError> {
    let path = out_dir.join(PROVENANCE_JSON);
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| ChunkError::InvalidExport {
            path,
            detail: e.to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ChunkError::io(&path, e)),
    }
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// Renders pages with pdfium and exports one text element per page.
///
/// Produces no tables or pictures, so SKU extraction finds nothing and the
/// model works from the page image and raw text alone.
#[derive(Debug, Clone)]
pub struct PdfiumConverter {
    pub scale: f32,
}

impl Default for PdfiumConverter {
    fn default() -> Self {
        Self { scale: 2.0 }
    }
}

impl PdfiumConverter {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }

    /// Render the pages of `pdf` and save them as `page<N>.png`. Pages whose
    /// local number is in `only` (when given) are the only ones written.
    /// Returns `(local page, real page, size in points)` for each page saved.
    async fn render_to(
        &self,
        pdf: &Path,
        images_dir: &Path,
        page_offset: usize,
        only: Option<BTreeSet<usize>>,
    ) -> Result<Vec<(usize, PathBuf, PageSize)>, ChunkError> {
        let rendered = pdf::render_pages(pdf, self.scale)
            .await
            .map_err(conversion_failed)?;
        let images_dir = images_dir.to_path_buf();
        let scale = f64::from(self.scale);

        blocking(move || {
            let mut saved = Vec::new();
            for (local, img) in rendered {
                if only.as_ref().is_some_and(|set| !set.contains(&local)) {
                    continue;
                }
                let path = images_dir.join(page_image_name(local + page_offset));
                img.save_with_format(&path, image::ImageFormat::Png)
                    .map_err(|e| ChunkError::io(&path, e))?;
                let size = PageSize {
                    width: f64::from(img.width()) / scale,
                    height: f64::from(img.height()) / scale,
                };
                saved.push((local, path, size));
            }
            Ok(saved)
        })
        .await
    }
}

#[async_trait]
impl DocumentConverter for PdfiumConverter {
    fn name(&self) -> &str {
        "pdfium"
    }

    async fn convert(&self, pdf: &Path, out_dir: &Path, page_offset: usize) -> Result<ConversionArtifacts, ChunkError> {
        let images_dir = out_dir.join(IMAGES_DIR);
        tokio::fs::create_dir_all(&images_dir)
            .await
            .map_err(|e| ChunkError::io(&images_dir, e))?;

        let saved = self.render_to(pdf, &images_dir, page_offset, None).await?;
        let texts = pdf::page_texts(pdf, 1, saved.len())
            .await
            .map_err(conversion_failed)?;

        let mut doc = DoclingDocument {
            name: pdf
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            body: DocItem {
                self_ref: "#/body".into(),
                label: "unspecified".into(),
                ..Default::default()
            },
            ..Default::default()
        };

        for ((local, _, size), text) in saved.iter().zip(texts) {
            doc.pages.insert(
                local.to_string(),
                PageItem {
                    page_no: *local,
                    size: size.clone(),
                    image: None,
                },
            );
            if text.trim().is_empty() {
                continue;
            }
            let self_ref = format!("#/texts/{}", doc.texts.len());
            doc.body.children.push(RefItem::new(self_ref.clone()));
            doc.texts.push(DocItem {
                self_ref,
                label: "text".into(),
                text,
                prov: vec![ProvenanceItem {
                    page_no: *local,
                    bbox: BoundingBox {
                        l: 0.0,
                        t: size.height,
                        r: size.width,
                        b: 0.0,
                        coord_origin: "BOTTOMLEFT".into(),
                    },
                }],
                ..Default::default()
            });
        }

        let metadata = out_dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(&doc).map_err(|e| ChunkError::io(&metadata, e))?;
        tokio::fs::write(&metadata, json)
            .await
            .map_err(|e| ChunkError::io(&metadata, e))?;
        write_provenance(out_dir, pdf, &[]).await?;

        info!("pdfium converted {} page(s) of {}", saved.len(), pdf.display());
        Ok(ConversionArtifacts {
            page_images: saved
                .into_iter()
                .map(|(local, path, _)| (local + page_offset, path))
                .collect(),
            provenance: Vec::new(),
            metadata,
        })
    }
}

// ── docling ──────────────────────────────────────────────────────────────

/// Runs the external `docling` command and post-processes its JSON export.
///
/// Images are requested embedded as data URIs. Pages that come back
/// without an image are rendered with pdfium instead.
#[derive(Debug, Clone)]
pub struct DoclingConverter {
    pub binary: PathBuf,
    pub fallback: PdfiumConverter,
}

impl DoclingConverter {
    pub fn new(binary: impl Into<PathBuf>, scale: f32) -> Self {
        Self {
            binary: binary.into(),
            fallback: PdfiumConverter::new(scale),
        }
    }

    async fn run_docling(&self, pdf: &Path, export_dir: &Path) -> Result<String, ChunkError> {
        let output = tokio::process::Command::new(&self.binary)
            .arg(pdf)
            .args(["--to", "json", "--image-export-mode", "embedded", "--output"])
            .arg(export_dir)
            .output()
            .await
            .map_err(|e| {
                conversion_failed(format!(
                    "failed to run `{}`: {e}. Is docling installed?",
                    self.binary.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("docling exited with {}: {}", output.status, stderr.trim());
            return Err(conversion_failed(format!(
                "docling exited with {}: {}",
                output.status,
                tail(stderr.trim(), 500)
            )));
        }

        let expected = export_dir.join(format!(
            "{}.json",
            pdf.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default()
        ));
        let path = if expected.exists() {
            expected
        } else {
            first_json_in(export_dir).ok_or_else(|| ChunkError::InvalidExport {
                path: export_dir.to_path_buf(),
                detail: "docling produced no JSON export".into(),
            })?
        };
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ChunkError::io(&path, e))
    }
}

fn tail(s: &str, max: usize) -> &str {
    let start = s.len().saturating_sub(max);
    let start = (start..=s.len()).find(|&i| s.is_char_boundary(i)).unwrap_or(s.len());
    &s[start..]
}

fn first_json_in(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .find(|p| p.extension().is_some_and(|ext| ext == "json"))
}

fn caption_text(doc: &DoclingDocument, item: &DocItem) -> String {
    let index = doc.index();
    let captions: Vec<&str> = item
        .captions
        .iter()
        .filter_map(|c| index.get(&c.target))
        .map(|c| c.text.trim())
        .filter(|t| !t.is_empty())
        .collect();
    if captions.is_empty() {
        item.text.trim().to_string()
    } else {
        captions.join(" ")
    }
}

#[async_trait]
impl DocumentConverter for DoclingConverter {
    fn name(&self) -> &str {
        "docling"
    }

    async fn convert(&self, pdf: &Path, out_dir: &Path, page_offset: usize) -> Result<ConversionArtifacts, ChunkError> {
        let images_dir = out_dir.join(IMAGES_DIR);
        tokio::fs::create_dir_all(&images_dir)
            .await
            .map_err(|e| ChunkError::io(&images_dir, e))?;

        let export_dir = tempfile::tempdir().map_err(|e| ChunkError::io(out_dir, e))?;
        info!("Running docling on {}", pdf.display());
        let raw = self.run_docling(pdf, export_dir.path()).await?;

        let metadata = out_dir.join(METADATA_FILE);
        let doc: DoclingDocument = serde_json::from_str(&raw).map_err(|e| ChunkError::InvalidExport {
            path: metadata.clone(),
            detail: e.to_string(),
        })?;
        tokio::fs::write(&metadata, &raw)
            .await
            .map_err(|e| ChunkError::io(&metadata, e))?;

        // Embedded page images.
        let mut embedded: Vec<(usize, Vec<u8>)> = Vec::new();
        let mut missing: BTreeSet<usize> = BTreeSet::new();
        for page in doc.pages.values() {
            match page.image.as_ref().and_then(|img| img.decode()) {
                Some(bytes) => embedded.push((page.page_no, bytes)),
                None => {
                    missing.insert(page.page_no);
                }
            }
        }

        // Picture crops in reading order.
        let mut crops: Vec<(PathBuf, Vec<u8>)> = Vec::new();
        let mut provenance = Vec::new();
        doc.walk(|item| {
            if item.label != "picture" {
                return true;
            }
            let Some(prov) = item.first_prov() else {
                debug!("Picture {} has no provenance; skipped", item.self_ref);
                return true;
            };
            let Some(bytes) = item.image.as_ref().and_then(|img| img.decode()) else {
                debug!("Picture {} has no embedded image data", item.self_ref);
                return true;
            };
            let real_page = prov.page_no + page_offset;
            let filename = format!("crop_page_{}_{}.png", real_page, item.short_id());
            crops.push((images_dir.join(&filename), bytes));
            provenance.push(ProvenanceEntry {
                path: format!("{IMAGES_DIR}/{filename}"),
                filename,
                page_number: real_page,
                bbox: Some(prov.bbox.as_tuple()),
                label: item.label.clone(),
                self_ref: item.self_ref.clone(),
                text_context: caption_text(&doc, item),
            });
            true
        });

        let dir = images_dir.clone();
        let mut page_images: BTreeMap<usize, PathBuf> = blocking(move || {
            let mut written = BTreeMap::new();
            for (local, bytes) in embedded {
                let path = dir.join(page_image_name(local + page_offset));
                save_png_bytes(&bytes, &path)?;
                written.insert(local, path);
            }
            for (path, bytes) in crops {
                save_png_bytes(&bytes, &path)?;
            }
            Ok(written)
        })
        .await?;

        if doc.pages.is_empty() || !missing.is_empty() {
            let only = (!doc.pages.is_empty()).then_some(missing);
            warn!("Rendering page images docling did not embed with pdfium");
            for (local, path, _) in self.fallback.render_to(pdf, &images_dir, page_offset, only).await? {
                page_images.insert(local, path);
            }
        }

        write_provenance(out_dir, pdf, &provenance).await?;
        info!(
            "docling converted {} page(s), {} picture crop(s)",
            page_images.len(),
            provenance.len()
        );

        Ok(ConversionArtifacts {
            page_images: page_images
                .into_iter()
                .map(|(local, path)| (local + page_offset, path))
                .collect(),
            provenance,
            metadata,
        })
    }
}
