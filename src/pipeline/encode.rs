//! Page-image preparation for the vision model.
//!
//! Pages are rendered at 2× for crisp crops, which is more resolution than
//! the model needs. Before upload each page is scaled by
//! [`crate::config::RunConfig::image_downscale`] and re-encoded as PNG.
//! PNG stays lossless: JPEG ringing around small table text costs more
//! accuracy than the bytes it saves.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Scale `img` by `factor` (no-op at 1.0). Never shrinks below 1×1 px.
pub fn downscale(img: &DynamicImage, factor: f32) -> DynamicImage {
    if (factor - 1.0).abs() < f32::EPSILON {
        return img.clone();
    }
    let w = ((img.width() as f32) * factor).round().max(1.0) as u32;
    let h = ((img.height() as f32) * factor).round().max(1.0) as u32;
    img.resize_exact(w, h, FilterType::Lanczos3)
}

/// Encode an image as a base64 PNG with `detail: "high"`.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded {}x{} image → {} bytes base64", img.width(), img.height(), b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Load a page PNG from disk, downscale and encode it.
pub fn load_for_upload(path: &Path, factor: f32) -> Result<ImageData, image::ImageError> {
    let img = image::open(path)?;
    encode_page(&downscale(&img, factor))
}
