// Copyright 2025 The systemk authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The HTTPS listener in front of [`super::KubeletApi`].

use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use super::KubeletApi;
use crate::provider::Config;
use crate::shared::error::{Result, SystemkError};

/// Bind and serve the kubelet API. TLS is used when both a certificate and
/// a key are configured; failing to load them is a startup failure.
pub async fn serve(api: Arc<KubeletApi>, config: &Config) -> Result<()> {
    let acceptor = match (&config.server_cert_path, &config.server_key_path) {
        (Some(cert), Some(key)) => Some(tls_acceptor(cert, key)?),
        _ => None,
    };

    let listener = TcpListener::bind(&config.listen_address).await?;
    info!(
        address = %config.listen_address,
        tls = acceptor.is_some(),
        "kubelet API listening"
    );

    loop {
        let (stream, _peer) = listener.accept().await?;
        let api = api.clone();
        match acceptor.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_connection(TokioIo::new(tls_stream), api).await,
                        Err(err) => debug!(%err, "TLS handshake failed"),
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    serve_connection(TokioIo::new(stream), api).await;
                });
            }
        }
    }
}

async fn serve_connection<I>(io: TokioIo<I>, api: Arc<KubeletApi>)
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let api = api.clone();
        async move { Ok::<_, Infallible>(api.handle(req).await) }
    });
    if let Err(err) = auto::Builder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
    {
        debug!(%err, "connection error");
    }
}

fn tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<std::io::Result<Vec<_>>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| SystemkError::Tls(format!("no private key in {}", key_path.display())))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SystemkError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
