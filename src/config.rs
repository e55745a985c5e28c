//! 命令行参数、环境变量与服务器只读配置。

use axum::http::Method;
use clap::{ArgAction, Parser};
use shadow_rs::formatcp;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_PORT: u16 = 25478;
pub const DEFAULT_UPLOAD_LIMIT: u64 = 5 * 1024 * 1024;
pub const DEFAULT_PROTECTED_METHODS: &str = "POST,PUT";
pub const GENERATED_TOKEN_LEN: usize = 20;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "simple-upload", version = VERSION_INFO, about = "Simple file upload server")]
pub struct Args {
    #[arg(
        env = "SIMPLE_UPLOAD_ROOT",
        default_value = ".",
        help = "Document root for uploaded and served files"
    )]
    pub document_root: String,
    #[arg(
        short = 'b',
        long,
        env = "SIMPLE_UPLOAD_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub bind: String,
    #[arg(
        short = 'p',
        long,
        env = "SIMPLE_UPLOAD_PORT",
        default_value_t = DEFAULT_PORT,
        help = "Listen port"
    )]
    pub port: u16,
    #[arg(
        short = 't',
        long,
        env = "SIMPLE_UPLOAD_TOKEN",
        default_value = "",
        help = "Shared secret token (generated when empty)"
    )]
    pub token: String,
    #[arg(
        long,
        env = "SIMPLE_UPLOAD_LIMIT",
        default_value_t = DEFAULT_UPLOAD_LIMIT,
        help = "Max upload size in bytes"
    )]
    pub upload_limit: u64,
    #[arg(
        long,
        env = "SIMPLE_UPLOAD_ENABLE_CORS",
        default_value_t = true,
        action = ArgAction::Set,
        help = "Send Access-Control-Allow-Origin on GET/POST/PUT"
    )]
    pub enable_cors: bool,
    #[arg(
        long = "protected-method",
        env = "SIMPLE_UPLOAD_PROTECTED_METHODS",
        value_delimiter = ',',
        default_value = DEFAULT_PROTECTED_METHODS,
        help = "Comma separated methods that require the token"
    )]
    pub protected_methods: Vec<String>,
    #[arg(short = 'c', long, env = "SIMPLE_UPLOAD_TLS_CERT", help = "TLS cert path")]
    pub cert: Option<String>,
    #[arg(short = 'k', long, env = "SIMPLE_UPLOAD_TLS_KEY", help = "TLS key path")]
    pub key: Option<String>,
    #[arg(
        long,
        env = "SIMPLE_UPLOAD_LOG_LEVEL",
        default_value = "info",
        help = "Default log filter when RUST_LOG is unset"
    )]
    pub log_level: String,
}

/// 服务器运行期间只读的配置。
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub document_root: PathBuf,
    pub max_upload_size: u64,
    pub secure_token: String,
    pub enable_cors: bool,
    pub protected_methods: HashSet<Method>,
}

impl ServerConfig {
    /// 由命令行参数构建配置：创建并规范化文档根目录，必要时生成令牌。
    pub async fn from_args(args: &Args) -> io::Result<Self> {
        let document_root = prepare_document_root(Path::new(&args.document_root)).await?;
        let protected_methods = parse_methods(&args.protected_methods)?;
        let secure_token = if args.token.is_empty() {
            let token = generate_token();
            warn!(token, "no token specified, generated one");
            token
        } else {
            args.token.clone()
        };

        Ok(Self {
            document_root,
            max_upload_size: args.upload_limit,
            secure_token,
            enable_cors: args.enable_cors,
            protected_methods,
        })
    }

    /// 判断该方法是否需要令牌。
    pub fn is_auth_required(&self, method: &Method) -> bool {
        self.protected_methods.contains(method)
    }
}

async fn prepare_document_root(path: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(path).await?;
    fs::canonicalize(path).await
}

fn parse_methods(values: &[String]) -> io::Result<HashSet<Method>> {
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| {
            Method::from_bytes(value.to_ascii_uppercase().as_bytes()).map_err(|err| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid protected method {value:?}: {err}"),
                )
            })
        })
        .collect()
}

fn generate_token() -> String {
    let mut token = Uuid::new_v4().simple().to_string();
    token.truncate(GENERATED_TOKEN_LEN);
    token
}
