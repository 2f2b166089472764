//! 提交单元：一张待识别的答题卡
//!
//! 上传文件按扩展名做准入检查，base64 文本在解码阶段再判断格式。

use crate::model::error::OmrError;
use std::fmt;

/// 允许的图片扩展名（大小写不敏感）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Png,
    Jpg,
    Jpeg,
    Bmp,
    Tiff,
}

impl MediaKind {
    pub const ALL: [MediaKind; 5] = [
        MediaKind::Png,
        MediaKind::Jpg,
        MediaKind::Jpeg,
        MediaKind::Bmp,
        MediaKind::Tiff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Png => "png",
            MediaKind::Jpg => "jpg",
            MediaKind::Jpeg => "jpeg",
            MediaKind::Bmp => "bmp",
            MediaKind::Tiff => "tiff",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        Self::ALL.into_iter().find(|kind| kind.as_str() == ext)
    }

    /// 取最后一个 `.` 之后的部分作为扩展名
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        Self::from_extension(ext)
    }

    pub fn image_format(&self) -> image::ImageFormat {
        match self {
            MediaKind::Png => image::ImageFormat::Png,
            MediaKind::Jpg | MediaKind::Jpeg => image::ImageFormat::Jpeg,
            MediaKind::Bmp => image::ImageFormat::Bmp,
            MediaKind::Tiff => image::ImageFormat::Tiff,
        }
    }

    pub fn allowed_types() -> Vec<&'static str> {
        Self::ALL.iter().map(MediaKind::as_str).collect()
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub enum ImageSource {
    /// multipart 上传的原始字节
    Upload(Vec<u8>),
    /// base64 文本，可带 `data:image/...;base64,` 前缀
    Encoded(String),
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Upload(bytes) => write!(f, "Upload({} bytes)", bytes.len()),
            ImageSource::Encoded(text) => write!(f, "Encoded({} chars)", text.len()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    /// 客户端声明的文件名，不可信，可能为空
    pub declared_name: String,
    pub source: ImageSource,
}

impl Submission {
    pub fn upload(declared_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            declared_name: declared_name.into(),
            source: ImageSource::Upload(bytes),
        }
    }

    pub fn encoded(text: impl Into<String>) -> Self {
        Self {
            declared_name: String::new(),
            source: ImageSource::Encoded(text.into()),
        }
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        MediaKind::from_file_name(&self.declared_name)
    }

    /// 准入检查，上传文件的扩展名必须在允许列表中
    pub fn admit(&self) -> Result<Option<MediaKind>, OmrError> {
        match self.source {
            ImageSource::Upload(_) => match self.media_kind() {
                Some(kind) => Ok(Some(kind)),
                None => Err(OmrError::UnsupportedFormat {
                    name: self.declared_name.clone(),
                }),
            },
            ImageSource::Encoded(_) => Ok(None),
        }
    }
}

const MAX_STEM_CHARS: usize = 64;

/// 生成可安全落盘的文件名：去掉路径部分，只保留字母数字、`-`、`_`
pub fn sanitize_file_name(declared: &str, kind: MediaKind) -> String {
    let base = declared
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    let stem = match base.rsplit_once('.') {
        Some((stem, _)) => stem,
        None => base,
    };
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_CHARS)
        .collect();
    let cleaned = cleaned.trim_matches('_');
    let stem = if cleaned.is_empty() { "upload" } else { cleaned };
    format!("{}.{}", stem, kind.as_str())
}
