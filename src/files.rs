//! `/files` 下的下载（GET/HEAD）与替换写入（PUT）处理器。

use axum::body::{Body as AxumBody, Bytes};
use axum::http::{Request, Uri};
use axum::response::Response;
use std::path::PathBuf;
use tower_http::services::ServeDir;
use tracing::{debug, info};

use crate::atomic::{AtomicFile, TEMP_PREFIX};
use crate::auth::Admission;
use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::form::{UploadSink, multipart_from, receive_file};
use crate::http::{allow_any_origin, uploaded};
use crate::routes::{FILES_PREFIX, Route, classify, decoded_path};
use crate::storage::Storage;

/// 下载文件，字节输出交给 `ServeDir`（Range、Last-Modified、Content-Type）。
pub async fn serve_file(
    config: &ServerConfig,
    storage: &Storage,
    req: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let path = decoded_path(req.uri());
    let Route::Files(files_path) = classify(&path) else {
        return Err(ApiError::path_not_found(&path));
    };
    // 正在写入的 PUT 临时文件不对外可见
    if files_path.file_name.starts_with(TEMP_PREFIX) {
        return Err(ApiError::path_not_found(&path));
    }
    storage
        .resolve_path_checked(&files_path.relative(), true)
        .await?;

    let req = strip_files_prefix(req, &path)?;
    let mut serve_dir = ServeDir::new(storage.root_path()).append_index_html_on_directories(false);
    let mut response = serve_dir
        .try_call(req)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .map(AxumBody::new);

    if config.enable_cors {
        allow_any_origin(response.headers_mut());
    }
    debug!(path, status = %response.status(), "serve file");
    Ok(response)
}

/// 去掉 `/files` 前缀后交给文件服务，保留原始编码与查询串。
fn strip_files_prefix(mut req: Request<AxumBody>, path: &str) -> Result<Request<AxumBody>, ApiError> {
    let rest = req
        .uri()
        .path()
        .strip_prefix(FILES_PREFIX)
        .ok_or_else(|| ApiError::path_not_found(path))?;
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{rest}?{query}"),
        None => rest.to_string(),
    };
    let uri = path_and_query
        .parse::<Uri>()
        .map_err(|_| ApiError::path_not_found(path))?;
    *req.uri_mut() = uri;
    Ok(req)
}

/// 在文档根目录中暂存 PUT 内容。
///
/// 目标路径在认证通过后才解析，找到文件字段后才创建临时文件。
struct StagedReplace<'a> {
    storage: &'a Storage,
    path: &'a str,
    target: Option<PathBuf>,
    file: Option<AtomicFile>,
}

impl<'a> StagedReplace<'a> {
    fn new(storage: &'a Storage, path: &'a str) -> Self {
        Self {
            storage,
            path,
            target: None,
            file: None,
        }
    }

    /// 路由并在沙箱内解析目标路径，结果缓存。
    async fn resolve_target(&mut self) -> Result<PathBuf, ApiError> {
        if let Some(target) = &self.target {
            return Ok(target.clone());
        }
        let Route::Files(files_path) = classify(self.path) else {
            info!(path = self.path, "invalid path");
            return Err(ApiError::path_not_found(self.path));
        };
        let target = self
            .storage
            .resolve_path_checked(&files_path.relative(), true)
            .await?;
        self.target = Some(target.clone());
        Ok(target)
    }

    async fn discard(self) {
        if let Some(file) = self.file {
            file.cleanup().await;
        }
    }

    async fn commit(self) -> Result<(), ApiError> {
        match self.file {
            Some(file) => file.finalize().await,
            None => Err(ApiError::Internal("upload was not staged".into())),
        }
    }
}

impl UploadSink for StagedReplace<'_> {
    async fn begin(&mut self) -> Result<(), ApiError> {
        let target = self.resolve_target().await?;
        let file = AtomicFile::new_in(self.storage.root_path(), &target).await?;
        debug!(temp = ?file.temp_path(), target = ?target, "staging upload");
        self.file = Some(file);
        Ok(())
    }

    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), ApiError> {
        match self.file.as_mut() {
            Some(file) => file.write_chunk(chunk).await,
            None => Err(ApiError::Internal("upload was not staged".into())),
        }
    }
}

/// 处理 `PUT /files/...`：流式写入临时文件，再原子重命名到请求路径。
///
/// 等待表单令牌时，路由与沙箱检查推迟到令牌核对之后。
pub async fn replace_file(
    config: &ServerConfig,
    storage: &Storage,
    req: Request<AxumBody>,
    admission: Admission<'_>,
) -> Result<Response, ApiError> {
    let path = decoded_path(req.uri());
    let mut staged = StagedReplace::new(storage, &path);
    if admission.is_settled() {
        staged.resolve_target().await?;
    }

    let mut multipart = multipart_from(req)
        .await
        .map_err(|err| admission.screen(err))?;
    let received =
        match receive_file(&mut multipart, admission, config.max_upload_size, &mut staged).await {
            Ok(received) => received,
            Err(err) => {
                staged.discard().await;
                return Err(err);
            }
        };
    staged.commit().await?;

    info!(path, size = received.size, "file uploaded by PUT");
    Ok(uploaded(config, path))
}
