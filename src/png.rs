//! PNG encoding for images we hand to external services.

use std::io::Cursor;

use image::{ImageFormat, RgbImage};

use crate::prelude::*;

/// Encode an image as PNG bytes.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .with_context(|| {
            format!(
                "failed to encode {}x{} image as PNG",
                image.width(),
                image.height()
            )
        })?;
    Ok(bytes)
}
