//! Transport adapter: a TLS-capable WebSocket listener and dialer carrying
//! UTF-8 text frames. Everything above this module sees only text frames
//! and close codes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async_tls_with_config, Connector, WebSocketStream};
use tracing::debug;

use crate::error::{OverlayError, OverlayResult};

/// WebSocket normal-closure code; anything else triggers reconnect.
pub const NORMAL_CLOSE: u16 = 1000;
/// Synthetic code for a connection dropped without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

/// Byte stream the session layer runs over.
pub trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIo for T {}

/// TLS certificate and key files for the listener.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Listening side of the transport.
pub struct Listener {
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    /// Bind on all interfaces. With a `TlsIdentity` the listener speaks
    /// `wss`, otherwise plain `ws`.
    pub async fn bind(port: u16, tls: Option<&TlsIdentity>) -> OverlayResult<Self> {
        let tcp = TcpListener::bind(("0.0.0.0", port)).await?;
        let tls = match tls {
            Some(identity) => Some(build_acceptor(identity)?),
            None => None,
        };
        Ok(Self { tcp, tls })
    }

    /// The actually bound port (meaningful when configured with port 0).
    pub fn local_port(&self) -> OverlayResult<u16> {
        Ok(self.tcp.local_addr()?.port())
    }

    /// Accept one connection and complete the WebSocket upgrade.
    pub async fn accept(
        &self,
    ) -> OverlayResult<(WebSocketStream<Box<dyn StreamIo>>, SocketAddr)> {
        let (stream, addr) = self.tcp.accept().await?;
        let io: Box<dyn StreamIo> = match &self.tls {
            Some(acceptor) => Box::new(
                acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| OverlayError::Tls(e.to_string()))?,
            ),
            None => Box::new(stream),
        };
        let ws = accept_async(io).await?;
        debug!("accepted connection from {}", addr);
        Ok((ws, addr))
    }
}

/// Dial a `ws://` or `wss://` URL and complete the upgrade.
pub async fn dial(
    url: &str,
) -> OverlayResult<WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>> {
    let connector = if url.starts_with("wss://") {
        Some(Connector::Rustls(Arc::new(ring_client_config())))
    } else {
        None
    };
    let (ws, _response) = connect_async_tls_with_config(url, None, false, connector).await?;
    debug!("dialed {}", url);
    Ok(ws)
}

/// Build a close frame with the given code.
pub fn close_message(code: u16, reason: &str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

/// Extract the close code from a received close frame.
pub fn close_code(frame: Option<&CloseFrame<'_>>) -> u16 {
    frame.map(|f| u16::from(f.code)).unwrap_or(ABNORMAL_CLOSE)
}

fn build_acceptor(identity: &TlsIdentity) -> OverlayResult<TlsAcceptor> {
    let cert_file = std::fs::File::open(&identity.cert)?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .map_err(|e| OverlayError::Tls(format!("certificate file: {}", e)))?;

    let key_file = std::fs::File::open(&identity.key)?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| OverlayError::Tls(format!("key file: {}", e)))?
        .ok_or_else(|| OverlayError::Tls("no private key in key file".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| OverlayError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Ring peers present self-signed certificates; authenticity comes from the
/// ring handshake, not WebPKI, so the dialer accepts any server cert.
#[derive(Debug)]
struct RingCertVerifier;

impl ServerCertVerifier for RingCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

fn ring_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(RingCertVerifier))
        .with_no_client_auth()
}
