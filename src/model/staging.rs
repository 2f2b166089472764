//! 识别引擎只接受文件路径，图片需要先暂存到磁盘
//!
//! 每次暂存独占一个临时子目录，`StagedImage` 析构时整个目录被删除，
//! 并发请求即使声明了同名文件也互不覆盖。

use crate::model::normalize::CanonicalImage;
use crate::util::logging::standards::events;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[derive(Debug, Clone)]
pub struct Staging {
    root: PathBuf,
}

impl Staging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stage(&self, image: &CanonicalImage) -> io::Result<StagedImage> {
        std::fs::create_dir_all(&self.root)?;
        let dir = tempfile::Builder::new()
            .prefix("omr-")
            .tempdir_in(&self.root)?;
        let path = dir.path().join(image.staging_name());
        // 写入失败时 dir 随之析构，不会留下空目录
        std::fs::write(&path, image.staged_bytes())?;
        tracing::debug!(
            event = events::STAGING_CREATED,
            path = %path.display(),
            bytes = image.staged_bytes().len()
        );
        Ok(StagedImage {
            dir: Some(dir),
            path,
        })
    }
}

/// 暂存文件的作用域守卫
#[derive(Debug)]
pub struct StagedImage {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl StagedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedImage {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let dir_path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => tracing::debug!(event = events::STAGING_RELEASED, path = %self.path.display()),
            Err(e) => tracing::warn!(
                event = events::STAGING_RELEASED,
                path = %dir_path.display(),
                error = %e,
                "暂存目录清理失败"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::normalize::tests::sample_upload;
    use crate::model::normalize::{normalize, NormalizeLimits};

    #[test]
    fn staged_file_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let staging = Staging::new(root.path().join("uploads"));
        let image = normalize(&sample_upload("sheet.png"), &NormalizeLimits::default()).unwrap();

        let staged = staging.stage(&image).unwrap();
        let path = staged.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(path.file_name().unwrap(), "sheet.png");
        assert_eq!(std::fs::read(&path).unwrap(), image.staged_bytes());

        drop(staged);
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(staging.root()).unwrap().count(), 0);
    }

    #[test]
    fn same_name_stages_do_not_collide() {
        let root = tempfile::tempdir().unwrap();
        let staging = Staging::new(root.path());
        let image = normalize(&sample_upload("sheet.jpg"), &NormalizeLimits::default()).unwrap();

        let first = staging.stage(&image).unwrap();
        let second = staging.stage(&image).unwrap();
        assert_ne!(first.path(), second.path());

        drop(first);
        assert!(second.path().exists());
    }
}
