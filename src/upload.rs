//! POST 上传：整体读入内存后直接写入文档根目录。

use axum::body::{Body as AxumBody, Bytes};
use axum::http::Request;
use axum::response::Response;
use sha1::{Digest, Sha1};
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::auth::Admission;
use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::form::{UploadSink, multipart_from, receive_file};
use crate::http::uploaded;
use crate::routes::{Route, classify, decoded_path};
use crate::storage::{Storage, StorageError};

/// POST 内容整体缓冲在内存中。
struct UploadBuffer<'a> {
    path: &'a str,
    body: Vec<u8>,
}

impl UploadSink for UploadBuffer<'_> {
    async fn begin(&mut self) -> Result<(), ApiError> {
        check_upload_route(self.path)
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), ApiError> {
        self.body.write_chunk(chunk).await
    }
}

fn check_upload_route(path: &str) -> Result<(), ApiError> {
    if classify(path) != Route::Upload {
        info!(path, "invalid path");
        return Err(ApiError::path_not_found(path));
    }
    Ok(())
}

/// 处理 `POST /upload`。
///
/// 等待表单令牌时，路径检查推迟到令牌核对之后。
pub async fn create_file(
    config: &ServerConfig,
    storage: &Storage,
    req: Request<AxumBody>,
    admission: Admission<'_>,
) -> Result<Response, ApiError> {
    let path = decoded_path(req.uri());
    if admission.is_settled() {
        check_upload_route(&path)?;
    }

    let mut multipart = multipart_from(req)
        .await
        .map_err(|err| admission.screen(err))?;
    let mut buffer = UploadBuffer {
        path: &path,
        body: Vec::new(),
    };
    let received = receive_file(&mut multipart, admission, config.max_upload_size, &mut buffer)
        .await
        .inspect_err(|err| {
            if let ApiError::Internal(msg) = err {
                error!(error = %msg, "failed to acquire the uploaded content");
            }
        })?;
    let body = buffer.body;

    let file_name = match received.file_name.as_deref().filter(|name| !name.is_empty()) {
        Some(name) => client_file_name(name)?,
        None => content_digest(&body),
    };
    let target = storage.resolve_path_checked(&file_name, true).await?;
    write_direct(&target, &body, received.size).await?;

    let url = storage.url_for(&target)?;
    info!(path = ?target, url, size = received.size, "file uploaded by POST");
    Ok(uploaded(config, url))
}

/// 客户端文件名只取最后一段；没有可用的最后一段（如 `..`）视为非法。
fn client_file_name(name: &str) -> Result<String, StorageError> {
    Path::new(name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or(StorageError::InvalidPath)
}

/// 内容的小写十六进制 SHA-1。
pub fn content_digest(body: &[u8]) -> String {
    hex::encode(Sha1::digest(body))
}

/// 截断写入目标文件；写入不完整或失败时删除部分写入的文件。
async fn write_direct(target: &Path, body: &[u8], size: u64) -> Result<(), ApiError> {
    let mut file = File::create(target).await.map_err(|err| {
        error!(path = ?target, error = %err, "failed to open the file");
        ApiError::Internal(err.to_string())
    })?;

    let outcome = async {
        let mut written = 0usize;
        while written < body.len() {
            match file.write(&body[written..]).await? {
                0 => break,
                n => written += n,
            }
        }
        file.flush().await?;
        Ok::<_, std::io::Error>(written as u64)
    }
    .await;
    drop(file);

    let err = match outcome {
        Ok(written) if written == size => return Ok(()),
        Ok(written) => {
            error!(size, written, "uploaded file size and written size differ");
            ApiError::Internal(format!(
                "the size of uploaded content is {size}, but {written} bytes written"
            ))
        }
        Err(err) => {
            error!(path = ?target, error = %err, "failed to write the content");
            ApiError::Internal(err.to_string())
        }
    };
    let _ = fs::remove_file(target).await;
    Err(err)
}
