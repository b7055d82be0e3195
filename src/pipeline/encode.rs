//! Rendered page → base64 PNG attachment.
//!
//! PNG keeps diacritics crisp; JPEG ringing around small marks like the
//! Vietnamese hook above (ả) or dot below (ạ) is enough to change a word.

use crate::error::DongyError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode page `page_num` as a high-detail PNG attachment.
pub fn encode_page(page_num: usize, img: &DynamicImage) -> Result<ImageData, DongyError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| DongyError::RasterisationFailed {
            page: page_num,
            detail: format!("PNG encoding failed: {}", e),
        })?;

    let b64 = STANDARD.encode(&buf);
    debug!("Page {} encoded → {} bytes base64", page_num, b64.len());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encodes_png_base64() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 12, Rgba([250, 245, 230, 255])));
        let data = encode_page(3, &img).unwrap();
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).unwrap();
        assert_eq!(&decoded[1..4], b"PNG");
    }
}
