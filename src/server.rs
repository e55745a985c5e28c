//! 路由构建与按方法分发。

use axum::body::Body as AxumBody;
use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::{Method, Request};
use axum::response::{IntoResponse, Response};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span, warn};

use crate::auth::authenticate;
use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::files::{replace_file, serve_file};
use crate::http::{add_security_headers, preflight, resolve_client_ip};
use crate::routes::{Route, classify, decoded_path};
use crate::storage::Storage;
use crate::upload::create_file;

/// 构建应用路由：所有请求都进入同一个分发器。
///
/// 上传大小由文件字段逐块累计限制，因此关闭默认的请求体上限。
pub fn build_router(config: Arc<ServerConfig>, storage: Arc<Storage>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(config))
}

/// 先经过认证门，再按方法选择唯一的处理器。
pub async fn dispatch(
    Extension(config): Extension<Arc<ServerConfig>>,
    Extension(storage): Extension<Arc<Storage>>,
    req: Request<AxumBody>,
) -> Response {
    let (req, admission) = match authenticate(&config, req).await {
        Ok(admitted) => admitted,
        Err(err) => return rejected(err),
    };

    let method = req.method().clone();
    let result = match method {
        Method::GET | Method::HEAD => serve_file(&config, &storage, req).await,
        Method::POST => create_file(&config, &storage, req, admission).await,
        Method::PUT => replace_file(&config, &storage, req, admission).await,
        Method::OPTIONS => handle_options(&req),
        // 没有处理器会读取表单令牌
        other => Err(admission.screen(ApiError::MethodNotAllowed(other))),
    };
    result.unwrap_or_else(rejected)
}

fn rejected(err: ApiError) -> Response {
    if let ApiError::Unauthorized(reason) = &err {
        warn!(error = %reason, "request rejected by token check");
    }
    err.into_response()
}

/// CORS 预检：按路径形状返回允许的方法。
fn handle_options(req: &Request<AxumBody>) -> Result<Response, ApiError> {
    let path = decoded_path(req.uri());
    match classify(&path) {
        Route::Files(_) => Ok(preflight(&[Method::PUT, Method::GET, Method::HEAD])),
        Route::Upload => Ok(preflight(&[Method::POST])),
        Route::Unknown => Err(ApiError::NotFound("not found".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::test_support::{Part, multipart_request};
    use axum::http::header::{
        ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ALLOW, CONTENT_TYPE,
    };
    use axum::http::{HeaderValue, StatusCode};
    use http_body_util::BodyExt;
    use std::collections::HashSet;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestServer {
        _temp: TempDir,
        root: std::path::PathBuf,
        router: Router,
    }

    impl TestServer {
        fn new(max_upload_size: u64, protected: &[Method]) -> Self {
            let temp = TempDir::new().expect("tempdir");
            let root = temp.path().join("root");
            std::fs::create_dir_all(&root).expect("create root");
            let root = root.canonicalize().expect("canonicalize root");
            let config = Arc::new(ServerConfig {
                document_root: root.clone(),
                max_upload_size,
                secure_token: "s3cret".into(),
                enable_cors: true,
                protected_methods: protected.iter().cloned().collect::<HashSet<_>>(),
            });
            let storage = Arc::new(Storage::new(root.clone()));
            Self {
                _temp: temp,
                root,
                router: build_router(config, storage),
            }
        }

        async fn send(&self, req: Request<AxumBody>) -> Response {
            self.router.clone().oneshot(req).await.expect("response")
        }

        async fn get(&self, uri: &str) -> Response {
            self.send(empty_request(Method::GET, uri)).await
        }

        /// 文档根目录下的所有条目（含残留的临时文件）。
        fn entries(&self) -> Vec<String> {
            let mut entries = std::fs::read_dir(&self.root)
                .expect("read root")
                .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            entries.sort();
            entries
        }
    }

    fn empty_request(method: Method, uri: &str) -> Request<AxumBody> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(AxumBody::empty())
            .expect("request")
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
            .to_vec()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).expect("json body")
    }

    #[tokio::test]
    async fn post_then_get_returns_the_same_bytes() {
        let server = TestServer::new(1024, &[]);
        let response = server
            .send(multipart_request(
                Method::POST,
                "/upload",
                &[Part::file(Some("a.txt"), b"hi")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN),
            Some(&HeaderValue::from_static("*"))
        );
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"url": "/files/a.txt"})
        );

        let response = server.get("/files/a.txt").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN),
            Some(&HeaderValue::from_static("*"))
        );
        assert_eq!(body_bytes(response).await, b"hi");
    }

    #[tokio::test]
    async fn post_without_file_name_uses_content_digest() {
        let server = TestServer::new(1024, &[]);
        let response = server
            .send(multipart_request(
                Method::POST,
                "/upload",
                &[Part::file(None, b"anonymous payload")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"url": "/files/256b0146f06b1332bcaeb9be090f43c286d3e4f6"})
        );
        assert_eq!(
            std::fs::read(server.root.join("256b0146f06b1332bcaeb9be090f43c286d3e4f6"))
                .expect("read stored file"),
            b"anonymous payload"
        );
    }

    #[tokio::test]
    async fn post_strips_directories_from_client_file_name() {
        let server = TestServer::new(1024, &[]);
        let response = server
            .send(multipart_request(
                Method::POST,
                "/upload",
                &[Part::file(Some("../../escape.txt"), b"x")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"url": "/files/escape.txt"})
        );
        assert!(server.root.join("escape.txt").exists());
    }

    #[tokio::test]
    async fn oversize_uploads_are_rejected_without_writing() {
        let server = TestServer::new(4, &[]);
        std::fs::write(server.root.join("keep.txt"), b"old").expect("seed");

        let response = server
            .send(multipart_request(
                Method::POST,
                "/upload",
                &[Part::file(Some("big.txt"), b"12345")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            body_json(response).await["message"],
            "uploaded file size exceeds the limit"
        );

        let response = server
            .send(multipart_request(
                Method::PUT,
                "/files/keep.txt",
                &[Part::file(Some("keep.txt"), b"12345")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        assert_eq!(server.entries(), vec!["keep.txt".to_string()]);
        assert_eq!(
            std::fs::read(server.root.join("keep.txt")).expect("read"),
            b"old"
        );
    }

    #[tokio::test]
    async fn put_overwrites_existing_file() {
        let server = TestServer::new(1024, &[]);
        for content in [&b"first version"[..], &b"v2"[..]] {
            let response = server
                .send(multipart_request(
                    Method::PUT,
                    "/files/doc.txt",
                    &[Part::file(Some("ignored.txt"), content)],
                ))
                .await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                body_json(response).await,
                serde_json::json!({"url": "/files/doc.txt"})
            );
        }

        let response = server.get("/files/doc.txt").await;
        assert_eq!(body_bytes(response).await, b"v2");
        assert_eq!(server.entries(), vec!["doc.txt".to_string()]);
    }

    #[tokio::test]
    async fn put_creates_missing_directories() {
        let server = TestServer::new(1024, &[]);
        let response = server
            .send(multipart_request(
                Method::PUT,
                "/files/a/b/c/deep.bin",
                &[Part::file(Some("deep.bin"), b"\x00\x01\x02")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            std::fs::read(server.root.join("a/b/c/deep.bin")).expect("read"),
            b"\x00\x01\x02"
        );

        let response = server.get("/files/a/b/c/deep.bin").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"\x00\x01\x02");
    }

    #[tokio::test]
    async fn put_echoes_decoded_request_path() {
        let server = TestServer::new(1024, &[]);
        let response = server
            .send(multipart_request(
                Method::PUT,
                "/files/dir/my%20file.txt",
                &[Part::file(None, b"spaced")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"url": "/files/dir/my file.txt"})
        );
        assert!(server.root.join("dir").join("my file.txt").exists());
    }

    #[tokio::test]
    async fn put_rejects_traversal() {
        let server = TestServer::new(1024, &[]);
        let response = server
            .send(multipart_request(
                Method::PUT,
                "/files/%2E%2E/escape.txt",
                &[Part::file(None, b"x")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(server.entries().is_empty());
        assert!(!server.root.parent().expect("parent").join("escape.txt").exists());
    }

    #[tokio::test]
    async fn get_rejects_traversal() {
        let server = TestServer::new(1024, &[]);
        let response = server.get("/files/sub/%2E%2E/%2E%2E/secret").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_missing_file_is_not_found() {
        let server = TestServer::new(1024, &[]);
        let response = server.get("/files/missing.txt").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn head_returns_headers_without_body() {
        let server = TestServer::new(1024, &[]);
        std::fs::write(server.root.join("h.txt"), b"hello").expect("seed");
        let response = server.send(empty_request(Method::HEAD, "/files/h.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-length"),
            Some(&HeaderValue::from_static("5"))
        );
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let server = TestServer::new(1024, &[]);
        let response = server.get("/elsewhere").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );
        assert_eq!(
            body_json(response).await["message"],
            "\"/elsewhere\" is not found"
        );

        let response = server
            .send(multipart_request(
                Method::POST,
                "/files/a.txt",
                &[Part::file(Some("a.txt"), b"x")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(server.entries().is_empty());
    }

    #[tokio::test]
    async fn wrong_token_is_unauthorized_without_mutation() {
        let server = TestServer::new(1024, &[Method::POST, Method::PUT]);
        let response = server
            .send(multipart_request(
                Method::POST,
                "/upload?token=wrong",
                &[Part::file(Some("a.txt"), b"x")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["message"], "token mismatched");

        let response = server
            .send(multipart_request(
                Method::PUT,
                "/files/a.txt",
                &[Part::text("token", "wrong"), Part::file(Some("a.txt"), b"x")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = server
            .send(multipart_request(
                Method::PUT,
                "/files/a.txt",
                &[Part::file(Some("a.txt"), b"x")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["message"], "missing token");

        assert!(server.entries().is_empty());
    }

    #[tokio::test]
    async fn pending_form_token_is_checked_before_path_and_body() {
        let server = TestServer::new(1024, &[Method::POST, Method::PUT]);

        let response = server
            .send(
                Request::builder()
                    .method(Method::PUT)
                    .uri("/files/a.txt")
                    .header(CONTENT_TYPE, "multipart/form-data")
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = server
            .send(multipart_request(
                Method::POST,
                "/files/a.txt",
                &[Part::file(Some("a.txt"), b"x")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = server
            .send(multipart_request(
                Method::PUT,
                "/files/%2E%2E/x.txt",
                &[Part::file(Some("x.txt"), b"x")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["message"], "missing token");

        // 令牌核对通过后才给出路径错误
        let response = server
            .send(multipart_request(
                Method::POST,
                "/files/a.txt",
                &[Part::text("token", "s3cret"), Part::file(Some("a.txt"), b"x")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = server
            .send(multipart_request(
                Method::PUT,
                "/files/%2E%2E/x.txt",
                &[Part::text("token", "s3cret"), Part::file(Some("x.txt"), b"x")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert!(server.entries().is_empty());
    }

    #[tokio::test]
    async fn pending_form_token_on_other_methods_is_unauthorized() {
        let server = TestServer::new(1024, &[Method::PATCH]);
        let response = server
            .send(multipart_request(
                Method::PATCH,
                "/files/a.txt",
                &[Part::text("token", "s3cret"), Part::file(Some("a.txt"), b"x")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = server
            .send(multipart_request(
                Method::PATCH,
                "/files/a.txt?token=s3cret",
                &[Part::file(Some("a.txt"), b"x")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn staging_files_are_not_served() {
        let server = TestServer::new(1024, &[]);
        std::fs::write(server.root.join(".upload_0123abcd"), b"partial").expect("seed");
        let response = server.get("/files/.upload_0123abcd").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn valid_token_from_query_or_form_is_accepted() {
        let server = TestServer::new(1024, &[Method::POST, Method::PUT]);
        let response = server
            .send(multipart_request(
                Method::POST,
                "/upload?token=s3cret",
                &[Part::file(Some("q.txt"), b"q")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = server
            .send(multipart_request(
                Method::PUT,
                "/files/f.txt",
                &[Part::text("token", "s3cret"), Part::file(None, b"f")],
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(
            server.entries(),
            vec!["f.txt".to_string(), "q.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn unprotected_get_ignores_token() {
        let server = TestServer::new(1024, &[Method::POST]);
        std::fs::write(server.root.join("open.txt"), b"open").expect("seed");
        let response = server.get("/files/open.txt?token=wrong").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"open");
    }

    #[tokio::test]
    async fn options_reports_methods_per_path_shape() {
        let server = TestServer::new(1024, &[]);
        let response = server
            .send(empty_request(Method::OPTIONS, "/files/anything"))
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN),
            Some(&HeaderValue::from_static("*"))
        );
        let methods = response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_METHODS)
            .and_then(|value| value.to_str().ok())
            .expect("allow methods")
            .split(',')
            .map(str::to_owned)
            .collect::<HashSet<_>>();
        let expected = ["PUT", "GET", "HEAD"]
            .into_iter()
            .map(str::to_owned)
            .collect::<HashSet<_>>();
        assert_eq!(methods, expected);

        let response = server.send(empty_request(Method::OPTIONS, "/upload")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers().get(ACCESS_CONTROL_ALLOW_METHODS),
            Some(&HeaderValue::from_static("POST"))
        );

        let response = server.send(empty_request(Method::OPTIONS, "/nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["message"], "not found");
    }

    #[tokio::test]
    async fn other_methods_are_not_allowed() {
        let server = TestServer::new(1024, &[]);
        let response = server
            .send(empty_request(Method::DELETE, "/files/a.txt"))
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            response.headers().get(ALLOW),
            Some(&HeaderValue::from_static("GET,HEAD,POST,PUT"))
        );
        assert_eq!(
            body_json(response).await["message"],
            "method \"DELETE\" is not allowed"
        );
    }

    #[tokio::test]
    async fn responses_carry_security_headers() {
        let server = TestServer::new(1024, &[]);
        let response = server.get("/elsewhere").await;
        assert_eq!(
            response.headers().get("x-content-type-options"),
            Some(&HeaderValue::from_static("nosniff"))
        );
    }
}
