//! TCP/TLS transport with tuned sockets and retryable negotiation

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use rand::Rng;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

/// TCP connection timeout
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// TLS handshake timeout
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection attempts before giving up
const CONNECT_RETRIES: u32 = 3;

/// Initial reconnect backoff in milliseconds
const CONNECT_BACKOFF_MS: u64 = 250;

/// Receive buffer sized for high-bandwidth article downloads (4MB)
const RECV_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Send buffer sized for command pipelining (1MB)
const SEND_BUFFER_SIZE: usize = 1024 * 1024;

/// A TLS protocol version, highest preference first when negotiating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProtocol {
    /// TLS 1.3
    Tls13,
    /// TLS 1.2
    Tls12,
}

impl TlsProtocol {
    fn version(&self) -> &'static tokio_rustls::rustls::SupportedProtocolVersion {
        match self {
            TlsProtocol::Tls13 => &tokio_rustls::rustls::version::TLS13,
            TlsProtocol::Tls12 => &tokio_rustls::rustls::version::TLS12,
        }
    }
}

/// Protocols tried in order when none is pinned
const TLS_FALLBACK: &[TlsProtocol] = &[TlsProtocol::Tls13, TlsProtocol::Tls12];

/// Certificate verifier that accepts any chain
///
/// Only installed when `verify_cert` is disabled; the connection is then
/// open to interception and must only target trusted hosts.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
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
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// The transport beneath one NNTP connection
#[derive(Debug)]
pub enum NntpStream {
    /// Unencrypted TCP
    Plain(TcpStream),
    /// TLS over TCP
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for NntpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NntpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            NntpStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NntpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            NntpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            NntpStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NntpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            NntpStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NntpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            NntpStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Per-batch write stall budget: `max(bytes / 10800, 15) + 10` seconds
pub fn write_stall_budget(remaining: usize) -> Duration {
    let base = ((remaining as u64) / 10800).max(15);
    Duration::from_secs(base + 10)
}

/// Open a tuned TCP connection to the server
async fn connect_tcp(config: &ServerConfig) -> Result<TcpStream> {
    use std::net::ToSocketAddrs;

    let addr = format!("{}:{}", config.host, config.port);
    let host = config.host.clone();
    let socket_addr = tokio::task::spawn_blocking(move || addr.to_socket_addrs())
        .await
        .map_err(|e| Error::Other(format!("resolver task failed: {}", e)))??
        .next()
        .ok_or_else(|| Error::Other(format!("no address resolved for {}", host)))?;

    use socket2::{Domain, Protocol, Socket, Type};
    let domain = if socket_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        warn!("failed to set receive buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_SIZE) {
        warn!("failed to set send buffer size: {}", e);
    }

    // connect while still blocking, then flip to non-blocking for tokio
    let std_stream = timeout(
        TCP_CONNECT_TIMEOUT,
        tokio::task::spawn_blocking(move || -> std::io::Result<std::net::TcpStream> {
            socket.connect(&socket_addr.into())?;
            socket.set_nonblocking(true)?;
            Ok(socket.into())
        }),
    )
    .await
    .map_err(|_| Error::Timeout)?
    .map_err(|e| Error::Other(format!("connect task failed: {}", e)))??;

    Ok(TcpStream::from_std(std_stream)?)
}

/// Negotiate TLS over an established TCP stream
async fn negotiate_tls(
    config: &ServerConfig,
    tcp: TcpStream,
    protocol: TlsProtocol,
) -> Result<TlsStream<TcpStream>> {
    use tokio_rustls::rustls::crypto::{CryptoProvider, ring};
    let _ = CryptoProvider::install_default(ring::default_provider());

    let builder = ClientConfig::builder_with_protocol_versions(&[protocol.version()]);
    let tls_config = if config.verify_cert {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        warn!("certificate validation disabled for {}", config.host);
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth()
    };

    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = ServerName::try_from(config.host.as_str())
        .map_err(|e| Error::Tls(format!("invalid server name: {}", e)))?
        .to_owned();

    timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Tls(format!("handshake failed: {}", e)))
}

/// Connect with retry and, for TLS, protocol fallback
///
/// With `protocol` unset and `secure` enabled, protocol versions are tried
/// highest-first; pinning a protocol disables fallback and a handshake
/// failure surfaces as [`Error::NoProtocolLeft`].
pub async fn connect(config: &ServerConfig, protocol: Option<TlsProtocol>) -> Result<NntpStream> {
    let mut backoff_ms = CONNECT_BACKOFF_MS;
    let mut last_error = None;

    for attempt in 0..CONNECT_RETRIES {
        match connect_once(config, protocol).await {
            Ok(stream) => return Ok(stream),
            Err(e @ (Error::NoProtocolLeft(_) | Error::Tls(_))) => return Err(e),
            Err(e) => {
                warn!(
                    "connect to {}:{} failed (attempt {}/{}): {}",
                    config.host,
                    config.port,
                    attempt + 1,
                    CONNECT_RETRIES,
                    e
                );
                last_error = Some(e);
            }
        }

        if attempt + 1 < CONNECT_RETRIES {
            let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 2);
            tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
            backoff_ms *= 2;
        }
    }

    Err(last_error.unwrap_or(Error::Timeout))
}

async fn connect_once(config: &ServerConfig, protocol: Option<TlsProtocol>) -> Result<NntpStream> {
    if !config.secure {
        let tcp = connect_tcp(config).await?;
        debug!("connected to {}:{} (plain)", config.host, config.port);
        return Ok(NntpStream::Plain(tcp));
    }

    // pinned protocol: one attempt, no fallback
    if let Some(pinned) = protocol {
        let tcp = connect_tcp(config).await?;
        return match negotiate_tls(config, tcp, pinned).await {
            Ok(tls) => Ok(NntpStream::Tls(Box::new(tls))),
            Err(Error::Timeout) => Err(Error::Timeout),
            Err(_) => Err(Error::NoProtocolLeft(config.host.clone())),
        };
    }

    let mut last_error = None;
    for &candidate in TLS_FALLBACK {
        let tcp = connect_tcp(config).await?;
        match negotiate_tls(config, tcp, candidate).await {
            Ok(tls) => {
                debug!(
                    "connected to {}:{} ({:?})",
                    config.host, config.port, candidate
                );
                return Ok(NntpStream::Tls(Box::new(tls)));
            }
            Err(e) => {
                warn!("{:?} negotiation with {} failed: {}", candidate, config.host, e);
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(Error::Timeout) => Err(Error::Timeout),
        _ => Err(Error::NoProtocolLeft(config.host.clone())),
    }
}

/// Write all of `data`, failing if a batch stalls past its budget
pub async fn send(stream: &mut NntpStream, data: &[u8]) -> Result<usize> {
    let mut written = 0;
    while written < data.len() {
        let budget = write_stall_budget(data.len() - written);
        let n = timeout(budget, stream.write(&data[written..]))
            .await
            .map_err(|_| Error::WriteTimeout(written))??;
        if n == 0 {
            return Err(Error::ConnectionLost);
        }
        written += n;
    }
    stream.flush().await?;
    Ok(written)
}
