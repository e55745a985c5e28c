//! 令牌认证：从查询串或表单参数读取令牌并与共享密钥比对。

use axum::body::{Body as AxumBody, to_bytes};
use axum::extract::Query;
use axum::http::{HeaderMap, Method, Request, Uri, header};
use serde::Deserialize;
use std::fmt;

use crate::config::ServerConfig;
use crate::error::ApiError;

pub const TOKEN_PARAM: &str = "token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    TokenMismatch,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingToken => f.write_str("missing token"),
            AuthError::TokenMismatch => f.write_str("token mismatched"),
        }
    }
}

impl std::error::Error for AuthError {}

#[derive(Deserialize)]
struct TokenParams {
    token: Option<String>,
}

/// 认证门的结论。
///
/// 多部分表单的令牌只有读到对应字段后才能校验，因此以 `AwaitingFormToken`
/// 的形式交给处理器。校验完成之前处理器不做路径检查，也不写入任何内容。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission<'a> {
    Granted,
    AwaitingFormToken { secret: &'a str },
}

impl Admission<'_> {
    /// 用表单中读到的令牌完成校验。
    pub fn verify(self, form_token: Option<&str>) -> Result<(), AuthError> {
        match self {
            Admission::Granted => Ok(()),
            Admission::AwaitingFormToken { secret } => check_token(secret, form_token),
        }
    }

    /// 是否已无需等待表单令牌。
    pub fn is_settled(&self) -> bool {
        matches!(self, Admission::Granted)
    }

    /// 表单令牌尚未核对时，先于核对发生的失败一律按缺少令牌处理。
    pub fn screen(self, err: ApiError) -> ApiError {
        match self {
            Admission::Granted => err,
            Admission::AwaitingFormToken { .. } => AuthError::MissingToken.into(),
        }
    }
}

/// 精确比较令牌；空令牌视为缺失。
pub fn check_token(secret: &str, token: Option<&str>) -> Result<(), AuthError> {
    match token {
        None | Some("") => Err(AuthError::MissingToken),
        Some(token) if token != secret => Err(AuthError::TokenMismatch),
        Some(_) => Ok(()),
    }
}

/// 读取查询串中的 `token` 参数。
pub fn query_token(uri: &Uri) -> Option<String> {
    Query::<TokenParams>::try_from_uri(uri)
        .ok()
        .and_then(|Query(params)| params.token)
        .filter(|token| !token.is_empty())
}

fn urlencoded_token(body: &[u8]) -> Option<String> {
    serde_urlencoded::from_bytes::<TokenParams>(body)
        .ok()
        .and_then(|params| params.token)
        .filter(|token| !token.is_empty())
}

enum FormKind {
    UrlEncoded,
    Multipart,
}

fn form_kind(headers: &HeaderMap) -> Option<FormKind> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())?;
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "application/x-www-form-urlencoded" => Some(FormKind::UrlEncoded),
        "multipart/form-data" => Some(FormKind::Multipart),
        _ => None,
    }
}

fn carries_form_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// 认证门：在分发前对每个请求执行。
///
/// 仅当方法受保护时失败才会以 401 返回；否则校验结果被忽略。
/// 返回的请求可能已被重建（urlencoded 表单体需要先缓冲读取）。
pub async fn authenticate<'a>(
    config: &'a ServerConfig,
    req: Request<AxumBody>,
) -> Result<(Request<AxumBody>, Admission<'a>), ApiError> {
    let required = config.is_auth_required(req.method());

    if let Some(token) = query_token(req.uri()) {
        return match check_token(&config.secure_token, Some(&token)) {
            Err(err) if required => Err(err.into()),
            _ => Ok((req, Admission::Granted)),
        };
    }
    if !required {
        return Ok((req, Admission::Granted));
    }
    if !carries_form_body(req.method()) {
        return Err(AuthError::MissingToken.into());
    }

    match form_kind(req.headers()) {
        Some(FormKind::UrlEncoded) => {
            let (parts, body) = req.into_parts();
            let limit = usize::try_from(config.max_upload_size).unwrap_or(usize::MAX);
            // 读取失败或超限时按缺少令牌处理
            let bytes = to_bytes(body, limit).await.unwrap_or_default();
            check_token(&config.secure_token, urlencoded_token(&bytes).as_deref())?;
            Ok((Request::from_parts(parts, AxumBody::from(bytes)), Admission::Granted))
        }
        Some(FormKind::Multipart) => Ok((
            req,
            Admission::AwaitingFormToken {
                secret: &config.secure_token,
            },
        )),
        None => Err(AuthError::MissingToken.into()),
    }
}
