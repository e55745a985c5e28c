//! 多部分表单读取：定位 `file` 字段、校验表单令牌并按大小上限写入目标。

use axum::body::{Body as AxumBody, Bytes};
use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{FromRequest, Multipart};
use axum::http::Request;
use tracing::{debug, info};

use crate::auth::{Admission, TOKEN_PARAM};
use crate::error::ApiError;

pub const FILE_FIELD: &str = "file";

/// 非文件字段（令牌）的读取上限。
const MAX_TEXT_FIELD: usize = 4 * 1024;

/// 上传内容的写入目标。
pub trait UploadSink {
    /// 找到文件字段且请求已通过认证后调用一次；路径检查放在这里。
    async fn begin(&mut self) -> Result<(), ApiError> {
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), ApiError>;
}

impl UploadSink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), ApiError> {
        self.extend_from_slice(&chunk);
        Ok(())
    }
}

/// 已接收文件字段的概要。
#[derive(Debug)]
pub struct ReceivedFile {
    pub file_name: Option<String>,
    pub size: u64,
}

/// 从请求中取出多部分表单。
pub async fn multipart_from(req: Request<AxumBody>) -> Result<Multipart, ApiError> {
    Multipart::from_request(req, &())
        .await
        .map_err(|rejection| ApiError::Internal(rejection.body_text()))
}

fn multipart_error(err: MultipartError) -> ApiError {
    ApiError::Internal(err.body_text())
}

/// 读取文本字段；超过上限时返回 `None`，不再缓冲剩余内容。
async fn read_text_field(field: &mut Field<'_>) -> Result<Option<String>, MultipartError> {
    let mut buf = Vec::new();
    while let Some(chunk) = field.chunk().await? {
        if buf.len() + chunk.len() > MAX_TEXT_FIELD {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// 读取表单直到 `file` 字段，并将其内容写入 `sink`。
///
/// 位于 `file` 之前的 `token` 字段用于完成延迟的认证，认证完成前的任何读取
/// 错误都按缺少令牌返回。大小在读取过程中累计，超过 `max_size` 立即以 413
/// 中止，超限的分片不会交给 `sink`。
pub async fn receive_file<S: UploadSink>(
    multipart: &mut Multipart,
    admission: Admission<'_>,
    max_size: u64,
    sink: &mut S,
) -> Result<ReceivedFile, ApiError> {
    let mut form_token: Option<String> = None;

    let unverified = |err: MultipartError| admission.screen(multipart_error(err));

    while let Some(mut field) = multipart.next_field().await.map_err(unverified)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some(FILE_FIELD) => {
                admission.verify(form_token.as_deref())?;
                let file_name = field.file_name().map(str::to_owned);
                debug!(
                    file_name = file_name.as_deref().unwrap_or(""),
                    content_type = field.content_type().unwrap_or(""),
                    "file part received"
                );

                sink.begin().await?;
                let mut size: u64 = 0;
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    size += chunk.len() as u64;
                    if size > max_size {
                        info!(size, limit = max_size, "file size exceeded");
                        return Err(ApiError::PayloadTooLarge);
                    }
                    if !chunk.is_empty() {
                        sink.write_chunk(chunk).await?;
                    }
                }
                return Ok(ReceivedFile { file_name, size });
            }
            Some(TOKEN_PARAM) if form_token.is_none() => {
                let token = read_text_field(&mut field).await.map_err(unverified)?;
                if token.is_none() {
                    debug!(limit = MAX_TEXT_FIELD, "token part exceeds the limit");
                }
                // 超限的令牌按空令牌处理
                form_token = Some(token.unwrap_or_default());
            }
            _ => {}
        }
    }

    admission.verify(form_token.as_deref())?;
    Err(ApiError::Internal(format!(
        "no \"{FILE_FIELD}\" part in the multipart form"
    )))
}
