//! Page encoding for model requests, and token estimates.
//!
//! Vision APIs take images as base64 data embedded in the JSON request body.
//! Pages are already PNG (lossless keeps text crisp for OCR), so encoding is
//! just base64 plus `detail: "high"`, which lets GPT-4-class models use the
//! full tile budget instead of a single low-resolution overview.

use super::render::PageImage;
use crate::model::RequestPage;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use tracing::debug;

/// Side of the square patch one vision token covers.
pub const IMAGE_TOKEN_SIZE: u32 = 28;

/// Characters per output token used when the provider reports no usage.
pub const CHARS_PER_TOKEN: usize = 4;

/// Wrap a rendered page for a model request.
pub fn encode_page(page: &PageImage) -> RequestPage {
    let b64 = STANDARD.encode(&page.pixel_data);
    debug!(page = page.page_num, "encoded page → {} bytes base64", b64.len());
    RequestPage {
        page_num: page.page_num,
        image: ImageData::new(b64, "image/png").with_detail("high"),
    }
}

pub fn encode_pages(pages: &[PageImage]) -> Vec<RequestPage> {
    pages.iter().map(encode_page).collect()
}

/// Estimated input tokens for one image: `(w / 28) · (h / 28)`.
pub fn estimate_image_tokens(width: u32, height: u32) -> u64 {
    (width / IMAGE_TOKEN_SIZE) as u64 * (height / IMAGE_TOKEN_SIZE) as u64
}

pub fn estimate_batch_tokens(pages: &[PageImage]) -> u64 {
    pages
        .iter()
        .map(|p| estimate_image_tokens(p.width, p.height))
        .sum()
}

/// Estimated tokens for generated text.
pub fn estimate_text_tokens(text: &str) -> u64 {
    text.chars().count().div_ceil(CHARS_PER_TOKEN) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};

    #[test]
    fn encode_small_page() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let page = PageImage::from_image(7, 130, &img).unwrap();
        let req = encode_page(&page);
        assert_eq!(req.page_num, 7);
        assert_eq!(req.image.mime_type, "image/png");
        let decoded = STANDARD.decode(&req.image.data).expect("valid base64");
        assert_eq!(decoded, page.pixel_data);
    }

    #[test]
    fn image_token_estimate_uses_28px_patches() {
        assert_eq!(estimate_image_tokens(1120, 1456), 40 * 52);
        assert_eq!(estimate_image_tokens(27, 1000), 0);
    }

    #[test]
    fn text_token_estimate_rounds_up() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
    }
}
