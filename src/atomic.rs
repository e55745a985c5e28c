//! 暂存文件写入与原子替换。

use axum::body::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::error;
use uuid::Uuid;

use crate::error::ApiError;
use crate::form::UploadSink;

pub const TEMP_PREFIX: &str = ".upload_";

/// 位于文档根目录内的临时文件，完成后原子重命名到目标路径。
///
/// 临时文件与目标处于同一文件系统，重命名不会出现跨设备错误。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在 `staging_dir` 中创建临时文件。
    pub async fn new_in(staging_dir: &Path, target: &Path) -> Result<Self, ApiError> {
        let temp_path = staging_dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4().simple()));
        let file = File::create(&temp_path).await.map_err(|err| {
            error!(error = %err, "failed to create a temporary file");
            ApiError::Internal(err.to_string())
        })?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步临时文件，创建缺失的父目录后原子替换目标文件。
    pub async fn finalize(self) -> Result<(), ApiError> {
        let AtomicFile {
            target,
            temp_path,
            mut file,
        } = self;

        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = synced {
            let _ = fs::remove_file(&temp_path).await;
            error!(path = ?temp_path, error = %err, "failed to flush the temporary file");
            return Err(ApiError::Internal(err.to_string()));
        }

        if let Some(parent) = target.parent()
            && let Err(err) = fs::create_dir_all(parent).await
        {
            let _ = fs::remove_file(&temp_path).await;
            error!(path = ?target, error = %err, "failed to create directories");
            return Err(ApiError::Internal(err.to_string()));
        }

        if let Err(err) = rename_over(&temp_path, &target).await {
            let _ = fs::remove_file(&temp_path).await;
            error!(
                path = ?target,
                error = %err,
                "failed to rename temp file to final filename for upload"
            );
            return Err(ApiError::Internal(err.to_string()));
        }

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }

        Ok(())
    }
}

impl UploadSink for AtomicFile {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), ApiError> {
        self.file.write_all(&chunk).await.map_err(|err| {
            error!(path = ?self.temp_path, error = %err, "failed to write body to the file");
            ApiError::Internal(err.to_string())
        })
    }
}

async fn rename_over(from: &Path, to: &Path) -> io::Result<()> {
    let result = fs::rename(from, to).await;
    #[cfg(windows)]
    {
        if result.is_err() && fs::remove_file(to).await.is_ok() {
            return fs::rename(from, to).await;
        }
    }
    result
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
