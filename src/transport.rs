//! Transport layer abstraction for MQTT connections.
//!
//! A unified byte-stream interface over the four concrete transports:
//! - TCP (plain)
//! - TLS over TCP
//! - WebSocket over TCP
//! - WebSocket over TLS
//!
//! WebSocket transports carry MQTT packets inside binary messages; the
//! [`WsByteStream`] bridge reassembles them into a plain byte stream, so a
//! single MQTT packet may span several WS frames and one WS frame may hold
//! several MQTT packets.

use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Error, Result};

/// The WebSocket subprotocol MQTT mandates.
pub const WS_SUBPROTOCOL: &str = "mqtt";

/// Transport type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Plain TCP connection.
    Tcp,
    /// TLS encrypted connection.
    Tls,
    /// WebSocket connection.
    WebSocket,
    /// WebSocket over TLS connection.
    WebSocketTls,
}

impl TransportType {
    /// Parse transport type from URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_lowercase().as_str() {
            "tcp" | "mqtt" | "" => Some(TransportType::Tcp),
            "tls" | "mqtts" | "ssl" => Some(TransportType::Tls),
            "ws" => Some(TransportType::WebSocket),
            "wss" => Some(TransportType::WebSocketTls),
            _ => None,
        }
    }

    /// Get default port for this transport type.
    pub fn default_port(&self) -> u16 {
        match self {
            TransportType::Tcp => 1883,
            TransportType::Tls => 8883,
            TransportType::WebSocket => 80,
            TransportType::WebSocketTls => 443,
        }
    }

    fn is_tls(&self) -> bool {
        matches!(self, TransportType::Tls | TransportType::WebSocketTls)
    }
}

/// Boxed byte stream, used as the inner IO of WebSocket connections so the
/// same bridge serves plain and TLS sockets on both sides.
pub type BoxStream = Box<dyn AsyncStream>;

/// Object-safe alias for `AsyncRead + AsyncWrite`.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

enum TransportStream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::TlsStream<TcpStream>>),
    Ws(Box<WsByteStream>),
}

/// A unified transport with a known peer address.
pub struct Transport {
    stream: TransportStream,
    peer: SocketAddr,
}

impl Transport {
    /// Wrap an accepted plain TCP stream.
    pub fn tcp(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: TransportStream::Tcp(stream),
            peer,
        }
    }

    /// Perform the server-side TLS handshake on an accepted stream.
    pub async fn accept_tls(
        acceptor: &TlsAcceptor,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Self> {
        let tls = acceptor.accept(stream).await?;
        Ok(Self {
            stream: TransportStream::Tls(Box::new(tls.into())),
            peer,
        })
    }

    /// Perform the server-side WebSocket handshake on an accepted stream
    /// (plain or TLS), requiring the `mqtt` subprotocol.
    pub async fn accept_ws(stream: BoxStream, peer: SocketAddr) -> Result<Self> {
        let callback = |req: &Request, mut resp: Response| {
            let offered = req
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .map(|v| {
                    v.split(',')
                        .any(|p| p.trim().eq_ignore_ascii_case(WS_SUBPROTOCOL))
                })
                .unwrap_or(false);

            if offered {
                resp.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static(WS_SUBPROTOCOL),
                );
                Ok(resp)
            } else {
                let mut err = ErrorResponse::new(Some("mqtt subprotocol required".to_string()));
                *err.status_mut() = StatusCode::BAD_REQUEST;
                Err(err)
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(ws_to_error)?;

        Ok(Self {
            stream: TransportStream::Ws(Box::new(WsByteStream::new(ws))),
            peer,
        })
    }

    /// Connect to a broker URI such as `mqtt://host:1883`, `mqtts://host`,
    /// `ws://host:8080/mqtt` or `wss://host/mqtt`.
    pub async fn connect(uri: &str, tls: Option<&TlsConfig>) -> Result<Self> {
        let (transport_type, host, port, path) = parse_uri(uri)?;

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.set_nodelay(true)?;
        let peer = tcp.peer_addr()?;

        match transport_type {
            TransportType::Tcp => Ok(Self {
                stream: TransportStream::Tcp(tcp),
                peer,
            }),
            TransportType::Tls => {
                let config = match tls {
                    Some(config) => config.clone(),
                    None => TlsConfig::new()?,
                };
                let stream = config.connect(tcp, &host).await?;
                Ok(Self {
                    stream: TransportStream::Tls(Box::new(stream.into())),
                    peer,
                })
            }
            TransportType::WebSocket | TransportType::WebSocketTls => {
                let inner: BoxStream = if transport_type.is_tls() {
                    let config = match tls {
                        Some(config) => config.clone(),
                        None => TlsConfig::new()?,
                    };
                    Box::new(config.connect(tcp, &host).await?)
                } else {
                    Box::new(tcp)
                };

                let scheme = if transport_type.is_tls() { "wss" } else { "ws" };
                let url = format!("{scheme}://{host}:{port}{path}");
                let mut request = url.into_client_request().map_err(ws_to_error)?;
                request.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static(WS_SUBPROTOCOL),
                );
                let (ws, _) = tokio_tungstenite::client_async(request, inner)
                    .await
                    .map_err(ws_to_error)?;
                Ok(Self {
                    stream: TransportStream::Ws(Box::new(WsByteStream::new(ws))),
                    peer,
                })
            }
        }
    }

    /// Peer address of the underlying socket.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Close the transport. Idempotent; errors from an already-closed
    /// stream are swallowed.
    pub async fn close(&mut self) {
        let _ = self.shutdown().await;
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            TransportStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            TransportStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            TransportStream::Ws(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            TransportStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            TransportStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            TransportStream::Ws(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            TransportStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            TransportStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            TransportStream::Ws(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            TransportStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            TransportStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            TransportStream::Ws(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Byte-stream bridge over a WebSocket connection.
///
/// Reads concatenate binary frame payloads; writes emit one binary frame
/// per `poll_write`. Control frames are handled by tungstenite itself.
pub struct WsByteStream {
    inner: WebSocketStream<BoxStream>,
    read_buf: BytesMut,
}

impl WsByteStream {
    pub fn new(inner: WebSocketStream<BoxStream>) -> Self {
        Self {
            inner,
            read_buf: BytesMut::new(),
        }
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = buf.remaining().min(this.read_buf.len());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(WsMessage::Binary(data)))) => {
                    this.read_buf.extend_from_slice(&data);
                }
                Poll::Ready(Some(Ok(WsMessage::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(())); // EOF
                }
                Poll::Ready(Some(Ok(_))) => continue, // ping/pong/text
                Poll::Ready(Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed))) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                Pin::new(&mut this.inner)
                    .start_send(WsMessage::Binary(buf.to_vec()))
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.get_mut().inner).poll_close(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            // Close is idempotent.
            Poll::Ready(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn ws_to_error(e: WsError) -> Error {
    match e {
        WsError::Io(e) => Error::Io(e),
        WsError::ConnectionClosed | WsError::AlreadyClosed => Error::ConnectionClosed,
        other => Error::ProtocolViolation(format!("websocket: {other}")),
    }
}

/// Parse a broker URI into `(transport, host, port, ws_path)`.
fn parse_uri(uri: &str) -> Result<(TransportType, String, u16, String)> {
    let (scheme, rest) = match uri.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("tcp", uri),
    };

    let transport_type = TransportType::from_scheme(scheme)
        .ok_or_else(|| Error::InvalidConfig(format!("unknown scheme: {scheme}")))?;

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::InvalidConfig(format!("invalid port in {uri}")))?;
            (host.to_string(), port)
        }
        None => (authority.to_string(), transport_type.default_port()),
    };

    if host.is_empty() {
        return Err(Error::InvalidConfig(format!("missing host in {uri}")));
    }

    Ok((transport_type, host, port, path))
}

/// TLS configuration for client connections.
#[derive(Clone)]
pub struct TlsConfig {
    connector: TlsConnector,
}

impl TlsConfig {
    /// Create a new TLS config trusting the webpki root set.
    pub fn new() -> io::Result<Self> {
        let root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Create a TLS config trusting the given CA certificate PEM file.
    pub fn with_ca_file(cafile: impl AsRef<Path>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut BufReader::new(std::fs::File::open(cafile)?)) {
            roots
                .add(cert?)
                .map_err(|e| Error::InvalidConfig(format!("bad ca certificate: {e}")))?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Create a TLS config that skips certificate verification.
    /// **WARNING: insecure, for testing only.**
    pub fn insecure() -> Self {
        use tokio_rustls::rustls::client::danger::{
            HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
        };
        use tokio_rustls::rustls::pki_types::{CertificateDer, UnixTime};
        use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};

        #[derive(Debug)]
        struct InsecureVerifier;

        impl ServerCertVerifier for InsecureVerifier {
            fn verify_server_cert(
                &self,
                _end_entity: &CertificateDer<'_>,
                _intermediates: &[CertificateDer<'_>],
                _server_name: &ServerName<'_>,
                _ocsp_response: &[u8],
                _now: UnixTime,
            ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
                Ok(ServerCertVerified::assertion())
            }

            fn verify_tls12_signature(
                &self,
                _message: &[u8],
                _cert: &CertificateDer<'_>,
                _dss: &DigitallySignedStruct,
            ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
                Ok(HandshakeSignatureValid::assertion())
            }

            fn verify_tls13_signature(
                &self,
                _message: &[u8],
                _cert: &CertificateDer<'_>,
                _dss: &DigitallySignedStruct,
            ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
                Ok(HandshakeSignatureValid::assertion())
            }

            fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
                vec![
                    SignatureScheme::RSA_PKCS1_SHA256,
                    SignatureScheme::RSA_PKCS1_SHA384,
                    SignatureScheme::RSA_PKCS1_SHA512,
                    SignatureScheme::ECDSA_NISTP256_SHA256,
                    SignatureScheme::ECDSA_NISTP384_SHA384,
                    SignatureScheme::RSA_PSS_SHA256,
                    SignatureScheme::RSA_PSS_SHA384,
                    SignatureScheme::RSA_PSS_SHA512,
                    SignatureScheme::ED25519,
                ]
            }
        }

        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth();

        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Connect to a TLS server.
    pub async fn connect(
        &self,
        stream: TcpStream,
        domain: &str,
    ) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let domain = ServerName::try_from(domain.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid domain name"))?;

        self.connector.connect(domain, stream).await
    }
}

/// TLS configuration for broker listeners, built from PEM files.
#[derive(Clone)]
pub struct TlsAcceptorConfig {
    acceptor: TlsAcceptor,
}

impl TlsAcceptorConfig {
    /// Build a server-side TLS acceptor. When `cafile` is set, client
    /// certificates are required and verified against it.
    pub fn from_pem_files(
        certfile: impl AsRef<Path>,
        keyfile: impl AsRef<Path>,
        cafile: Option<&Path>,
    ) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut BufReader::new(std::fs::File::open(certfile)?))
            .collect::<io::Result<Vec<_>>>()?;
        if certs.is_empty() {
            return Err(Error::InvalidConfig("no certificates in certfile".to_string()));
        }
        let key = rustls_pemfile::private_key(&mut BufReader::new(std::fs::File::open(keyfile)?))?
            .ok_or_else(|| Error::InvalidConfig("no private key in keyfile".to_string()))?;

        let builder = ServerConfig::builder();
        let config = match cafile {
            Some(cafile) => {
                let mut roots = RootCertStore::empty();
                for cert in rustls_pemfile::certs(&mut BufReader::new(std::fs::File::open(cafile)?))
                {
                    roots
                        .add(cert?)
                        .map_err(|e| Error::InvalidConfig(format!("bad ca certificate: {e}")))?;
                }
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| Error::InvalidConfig(format!("client verifier: {e}")))?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key),
        }
        .map_err(|e| Error::InvalidConfig(format!("tls config: {e}")))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_parsing() {
        assert_eq!(TransportType::from_scheme("mqtt"), Some(TransportType::Tcp));
        assert_eq!(TransportType::from_scheme("mqtts"), Some(TransportType::Tls));
        assert_eq!(TransportType::from_scheme("ws"), Some(TransportType::WebSocket));
        assert_eq!(TransportType::from_scheme("wss"), Some(TransportType::WebSocketTls));
        assert_eq!(TransportType::from_scheme("ftp"), None);
    }

    #[test]
    fn test_parse_uri() {
        let (t, host, port, path) = parse_uri("mqtt://broker.local:1884").unwrap();
        assert_eq!(t, TransportType::Tcp);
        assert_eq!(host, "broker.local");
        assert_eq!(port, 1884);
        assert_eq!(path, "/");

        let (t, host, port, path) = parse_uri("ws://127.0.0.1:8080/mqtt").unwrap();
        assert_eq!(t, TransportType::WebSocket);
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 8080);
        assert_eq!(path, "/mqtt");

        let (t, _, port, _) = parse_uri("mqtts://broker.local").unwrap();
        assert_eq!(t, TransportType::Tls);
        assert_eq!(port, 8883);

        // Bare host:port defaults to tcp.
        let (t, host, port, _) = parse_uri("127.0.0.1:1883").unwrap();
        assert_eq!(t, TransportType::Tcp);
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 1883);

        assert!(parse_uri("ftp://x").is_err());
        assert!(parse_uri("mqtt://:1883").is_err());
    }
}
