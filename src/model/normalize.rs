//! 图片归一化：把上传字节与 base64 文本统一成 `CanonicalImage`
//!
//! 所有输入错误都在这里转换成 `OmrError`，不会向外抛出解码库的错误类型。

use crate::model::error::OmrError;
use crate::model::submission::{sanitize_file_name, ImageSource, MediaKind, Submission};
use crate::util::config::UploadConfig;
use base64::alphabet;
use base64::engine::general_purpose::GeneralPurposeConfig;
use base64::engine::{DecodePaddingMode, GeneralPurpose};
use base64::Engine;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::io::Cursor;

/// base64 输入统一落盘的文件名
pub const ENCODED_STAGING_NAME: &str = "temp_image.jpg";

const BASE64_MARKER: &str = "base64,";

/// 兼容带 / 不带 `=` 填充的 base64
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Copy)]
pub struct NormalizeLimits {
    pub max_bytes: usize,
    pub max_pixels: u64,
}

impl Default for NormalizeLimits {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for NormalizeLimits {
    fn from(upload: &UploadConfig) -> Self {
        Self {
            max_bytes: upload.max_file_bytes(),
            max_pixels: upload.max_pixels,
        }
    }
}

/// 归一化后的图片：解码后的像素 + 暂存时写盘的字节
#[derive(Debug, Clone)]
pub struct CanonicalImage {
    staging_name: String,
    kind: MediaKind,
    pixels: DynamicImage,
    staged_bytes: Vec<u8>,
}

impl CanonicalImage {
    pub fn staging_name(&self) -> &str {
        &self.staging_name
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    pub fn staged_bytes(&self) -> &[u8] {
        &self.staged_bytes
    }
}

impl PartialEq for CanonicalImage {
    fn eq(&self, other: &Self) -> bool {
        self.staging_name == other.staging_name
            && self.kind == other.kind
            && self.width() == other.width()
            && self.height() == other.height()
            && self.pixels.as_bytes() == other.pixels.as_bytes()
    }
}

pub fn normalize(submission: &Submission, limits: &NormalizeLimits) -> Result<CanonicalImage, OmrError> {
    match &submission.source {
        ImageSource::Upload(bytes) => {
            let kind = submission.admit()?.ok_or_else(|| OmrError::UnsupportedFormat {
                name: submission.declared_name.clone(),
            })?;
            check_size(bytes.len(), limits)?;
            let (_, pixels) = decode(bytes, limits)?;
            Ok(CanonicalImage {
                staging_name: sanitize_file_name(&submission.declared_name, kind),
                kind,
                pixels,
                staged_bytes: bytes.clone(),
            })
        }
        ImageSource::Encoded(text) => {
            let bytes = decode_base64(text)?;
            check_size(bytes.len(), limits)?;
            let (_, pixels) = decode(&bytes, limits)?;
            // 引擎按 JPEG 读取 base64 来源的图片
            let mut staged_bytes = Vec::new();
            DynamicImage::ImageRgb8(pixels.to_rgb8())
                .write_to(&mut Cursor::new(&mut staged_bytes), ImageFormat::Jpeg)
                .map_err(|e| OmrError::InvalidEncoding(format!("jpeg encode failed: {}", e)))?;
            Ok(CanonicalImage {
                staging_name: ENCODED_STAGING_NAME.to_string(),
                kind: MediaKind::Jpg,
                pixels,
                staged_bytes,
            })
        }
    }
}

/// 去掉 data-URL 前缀与空白后解码
fn decode_base64(text: &str) -> Result<Vec<u8>, OmrError> {
    let payload = match text.split_once(BASE64_MARKER) {
        Some((_, payload)) => payload,
        None => text,
    };
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(OmrError::InvalidEncoding("empty base64 payload".to_string()));
    }
    LENIENT_BASE64
        .decode(compact.as_bytes())
        .map_err(|e| OmrError::InvalidEncoding(format!("invalid base64: {}", e)))
}

fn check_size(size: usize, limits: &NormalizeLimits) -> Result<(), OmrError> {
    if size > limits.max_bytes {
        return Err(OmrError::TooLarge {
            size,
            limit: limits.max_bytes,
        });
    }
    Ok(())
}

fn decode(bytes: &[u8], limits: &NormalizeLimits) -> Result<(ImageFormat, DynamicImage), OmrError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| OmrError::InvalidEncoding(e.to_string()))?;
    let format = reader
        .format()
        .ok_or_else(|| OmrError::InvalidEncoding("unrecognized image data".to_string()))?;
    if !matches!(
        format,
        ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Bmp | ImageFormat::Tiff
    ) {
        return Err(OmrError::InvalidEncoding(format!(
            "unsupported image format: {:?}",
            format
        )));
    }

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| OmrError::InvalidEncoding(e.to_string()))?;
    let pixels = u64::from(width) * u64::from(height);
    if pixels == 0 || pixels > limits.max_pixels {
        return Err(OmrError::InvalidEncoding(format!(
            "image dimensions {}x{} out of range",
            width, height
        )));
    }

    let pixels = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| OmrError::InvalidEncoding(e.to_string()))?;
    Ok((format, pixels))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    pub(crate) fn sample_image_bytes(format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_fn(16, 12, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([20, 20, 20])
            } else {
                Rgb([240, 240, 240])
            }
        });
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), format)
            .unwrap();
        out
    }

    pub(crate) fn sample_upload(name: &str) -> Submission {
        let kind = MediaKind::from_file_name(name).unwrap_or(MediaKind::Png);
        Submission::upload(name, sample_image_bytes(kind.image_format()))
    }

    #[test]
    fn every_allowed_suffix_normalizes() {
        for kind in MediaKind::ALL {
            let name = format!("sheet.{}", kind.as_str().to_uppercase());
            let image = normalize(&sample_upload(&name), &NormalizeLimits::default()).unwrap();
            assert_eq!((image.width(), image.height()), (16, 12));
            assert_eq!(image.staging_name(), format!("sheet.{}", kind.as_str()));
            assert_eq!(image.kind(), kind);
        }
    }

    #[test]
    fn unknown_suffix_is_unsupported() {
        let sub = Submission::upload("sheet.gif", sample_image_bytes(ImageFormat::Png));
        assert!(matches!(
            normalize(&sub, &NormalizeLimits::default()),
            Err(OmrError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn upload_with_garbage_bytes_is_invalid_encoding() {
        let sub = Submission::upload("sheet.png", b"definitely not a png".to_vec());
        assert!(matches!(
            normalize(&sub, &NormalizeLimits::default()),
            Err(OmrError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let limits = NormalizeLimits {
            max_bytes: 16,
            max_pixels: 1_000_000,
        };
        assert!(matches!(
            normalize(&sample_upload("a.png"), &limits),
            Err(OmrError::TooLarge { limit: 16, .. })
        ));
    }

    #[test]
    fn pixel_limit_applies() {
        let limits = NormalizeLimits {
            max_bytes: 1 << 20,
            max_pixels: 100,
        };
        assert!(matches!(
            normalize(&sample_upload("a.png"), &limits),
            Err(OmrError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn data_url_prefix_is_equivalent() {
        let payload = base64::engine::general_purpose::STANDARD
            .encode(sample_image_bytes(ImageFormat::Png));
        let limits = NormalizeLimits::default();
        let plain = normalize(&Submission::encoded(payload.clone()), &limits).unwrap();
        let prefixed = normalize(
            &Submission::encoded(format!("data:image/png;base64,{}", payload)),
            &limits,
        )
        .unwrap();
        assert_eq!(plain, prefixed);
        assert_eq!(plain.staging_name(), ENCODED_STAGING_NAME);
        assert_eq!(&plain.staged_bytes()[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn unpadded_base64_is_accepted() {
        let payload = base64::engine::general_purpose::STANDARD_NO_PAD
            .encode(sample_image_bytes(ImageFormat::Bmp));
        assert!(normalize(&Submission::encoded(payload), &NormalizeLimits::default()).is_ok());
    }

    #[test]
    fn malformed_base64_is_invalid_encoding() {
        let limits = NormalizeLimits::default();
        for text in ["!!!not-base64!!!", "", "data:image/png;base64,", "aGVsbG8gd29ybGQ="] {
            assert!(
                matches!(
                    normalize(&Submission::encoded(text), &limits),
                    Err(OmrError::InvalidEncoding(_))
                ),
                "{text:?} should be rejected"
            );
        }
    }
}
