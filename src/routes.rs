//! 请求路径分类：`/upload` 与 `/files/<子路径>/<文件名>`。

use axum::http::Uri;
use percent_encoding::percent_decode_str;

pub const UPLOAD_PATH: &str = "/upload";
pub const FILES_PREFIX: &str = "/files";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Upload,
    Files(FilesPath<'a>),
    Unknown,
}

/// `/files` 之后的子路径（可为空）与最后一段文件名。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesPath<'a> {
    pub sub_path: &'a str,
    pub file_name: &'a str,
}

impl FilesPath<'_> {
    /// 相对文档根目录的路径。
    pub fn relative(&self) -> String {
        let sub_path = self.sub_path.trim_start_matches('/');
        if sub_path.is_empty() {
            self.file_name.to_string()
        } else {
            format!("{sub_path}/{}", self.file_name)
        }
    }
}

/// 对已解码的请求路径进行分类。
pub fn classify(path: &str) -> Route<'_> {
    if path == UPLOAD_PATH {
        return Route::Upload;
    }
    let Some(rest) = path.strip_prefix(FILES_PREFIX) else {
        return Route::Unknown;
    };
    if !rest.starts_with('/') || rest.contains('\n') {
        return Route::Unknown;
    }
    match rest.rsplit_once('/') {
        Some((sub_path, file_name)) if !file_name.is_empty() => {
            Route::Files(FilesPath { sub_path, file_name })
        }
        _ => Route::Unknown,
    }
}

/// 百分号解码后的请求路径。
pub fn decoded_path(uri: &Uri) -> String {
    percent_decode_str(uri.path())
        .decode_utf8_lossy()
        .into_owned()
}
