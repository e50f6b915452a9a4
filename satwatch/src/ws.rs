//! WebSocket transport: connects to the telemetry feed and yields raw frames.

use std::{fs::File, io::BufReader, sync::Arc};

use futures_util::{stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    connect_async_tls_with_config, tungstenite::Message, Connector as TlsConnector, WebSocketStream,
};
use url::Url;

use crate::connection::{Connector, Frame, FrameStream};
use crate::error::{ConfigError, TransportError};

#[derive(Clone)]
pub struct WsConnector {
    url: Url,
    tls: Option<TlsConnector>,
}

impl WsConnector {
    pub fn new(url: &str) -> Result<Self, ConfigError> {
        let parsed = Url::parse(url).map_err(|source| ConfigError::Url {
            url: url.to_string(),
            source,
        })?;
        let tls = match parsed.scheme() {
            "ws" => None,
            // public web PKI until a CA bundle is supplied
            "wss" => Some(TlsConnector::Rustls(Arc::new(client_config(public_roots())))),
            other => return Err(ConfigError::Scheme(other.to_string())),
        };
        Ok(Self { url: parsed, tls })
    }

    /// Trust only the certificates in `ca_path` (PEM) for `wss://` endpoints.
    pub fn with_tls_ca(mut self, ca_path: &str) -> Result<Self, TransportError> {
        let config = client_config_with_ca(ca_path)?;
        self.tls = Some(TlsConnector::Rustls(Arc::new(config)));
        Ok(self)
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

impl Connector for WsConnector {
    async fn connect(&mut self) -> Result<FrameStream, TransportError> {
        let (ws, _) = connect_async_tls_with_config(self.url.as_str(), None, false, self.tls.clone())
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(frames(ws))
    }
}

/// Text and binary frames pass through; control frames are skipped and a close
/// frame ends the stream.
pub fn frames<S>(ws: WebSocketStream<S>) -> FrameStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    stream::unfold(ws, |mut ws| async move {
        loop {
            match ws.next().await? {
                Ok(Message::Text(text)) => return Some((Ok(Frame::Text(text)), ws)),
                Ok(Message::Binary(bytes)) => return Some((Ok(Frame::Binary(bytes)), ws)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some((Err(err.into()), ws)),
            }
        }
    })
    .boxed()
}

fn client_config_with_ca(ca_path: &str) -> Result<rustls::ClientConfig, TransportError> {
    let file = File::open(ca_path).map_err(|e| TransportError::Tls(format!("{ca_path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| TransportError::Tls(format!("{ca_path}: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(format!("{ca_path}: {e}")))?;
    }
    if roots.is_empty() {
        return Err(TransportError::Tls(format!("{ca_path}: no certificates found")));
    }
    Ok(client_config(roots))
}

fn public_roots() -> rustls::RootCertStore {
    rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

fn client_config(roots: rustls::RootCertStore) -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}
