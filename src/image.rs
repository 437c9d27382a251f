//! In-memory thumbnail decode and canonical re-encode.
//!
//! Platform CDNs serve avatar thumbnails in mixed formats. Vision requests
//! carry every image in one canonical format, so each download is decoded
//! and re-encoded before it reaches the model. Thumbnails are small
//! (150x150 class), so everything stays in memory.

use std::io::Cursor;

use image::ImageFormat;

use crate::error::{Error, Result};

/// MIME type of the canonical re-encoded form.
pub const CANONICAL_MIME: &str = "image/png";

/// Decode `bytes` (any supported format) and re-encode as PNG.
pub fn reencode_png(bytes: &[u8]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| Error::Image(format!("decode failed: {e}")))?;

    let mut out = Cursor::new(Vec::new());
    decoded
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| Error::Image(format!("encode failed: {e}")))?;

    Ok(out.into_inner())
}
