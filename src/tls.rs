//! TLS 证书加载。

use axum_server::tls_rustls::RustlsConfig;
use std::io;
use tokio::fs;
use tracing::info;

use crate::config::Args;

/// 同时给出证书与私钥时构建 Rustls 配置；只给出其一视为配置错误。
pub async fn build_rustls_config(args: &Args) -> Result<Option<RustlsConfig>, io::Error> {
    let (cert_path, key_path) = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => (cert, key),
        (None, None) => return Ok(None),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "both --cert and --key are required to enable TLS",
            ));
        }
    };

    let cert = fs::read(cert_path).await?;
    let key = fs::read(key_path).await?;
    info!(cert = cert_path, key = key_path, "loaded TLS certificate");
    RustlsConfig::from_pem(cert, key).await.map(Some)
}
