//! QUIC transport using quinn
//!
//! One QUIC connection per peer session, one unidirectional QUIC stream
//! per logical stream. TLS 1.3 via rustls with the ring provider.
//!
//! ```text
//! QuicTransport
//!       |
//!       +-> client Endpoint (ephemeral UDP port) --dial--> QuicSession
//!       +-> server Endpoint (listen address)    --accept-> QuicSession
//!                                                            |
//!                                            open_uni / accept_uni
//!                                                            v
//!                                          QuicFrameSender / QuicFrameReceiver
//! ```

use super::{
    Acceptor, FrameReceiver, FrameSender, Result, Session, Transport, TransportError,
    read_frame, write_frame,
};
use crate::Frame;
use async_trait::async_trait;
use quinn::{Connection, ConnectionError, Endpoint, RecvStream, SendStream, VarInt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Default ALPN protocol
pub const DEFAULT_ALPN: &str = "mvirt-overlay";

/// Default handshake timeout in seconds
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Default idle timeout in seconds
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// Default keep-alive interval in seconds
const DEFAULT_KEEP_ALIVE_INTERVAL_SECS: u64 = 10;

/// Completed inbound sessions waiting for `accept`
const ACCEPT_BACKLOG: usize = 64;

/// Application close code sent on orderly shutdown
const CLOSE_CODE_SHUTDOWN: u32 = 0;

/// QUIC transport configuration.
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// PEM certificate chain presented to peers
    pub cert_path: PathBuf,
    /// PEM private key for `cert_path`
    pub key_path: PathBuf,
    /// PEM certificates trusted when dialling (defaults to `cert_path`)
    pub ca_path: Option<PathBuf>,
    /// Server name sent in SNI and checked against peer certificates
    pub server_name: String,
    pub alpn: String,
    /// Accept any peer certificate (INSECURE - for testing only)
    pub insecure_skip_verify: bool,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub keep_alive_interval: Duration,
}

impl QuicConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: None,
            server_name: DEFAULT_ALPN.to_string(),
            alpn: DEFAULT_ALPN.to_string(),
            insecure_skip_verify: false,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            keep_alive_interval: Duration::from_secs(DEFAULT_KEEP_ALIVE_INTERVAL_SECS),
        }
    }

    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    #[must_use]
    pub fn with_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// quinn-backed `Transport`.
pub struct QuicTransport {
    client: Endpoint,
    client_config: quinn::ClientConfig,
    server_config: quinn::ServerConfig,
    server_name: String,
    handshake_timeout: Duration,
}

impl QuicTransport {
    /// Load TLS material and bind the client endpoint.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &QuicConfig) -> Result<Self> {
        let certs = load_certs(&config.cert_path)?;
        let key = load_private_key(&config.key_path)?;
        let trusted = match &config.ca_path {
            Some(path) => load_certs(path)?,
            None => certs.clone(),
        };

        let server_config = build_server_config(config, certs, key)?;
        let client_config = build_client_config(config, trusted)?;

        let bind: SocketAddr = ([0, 0, 0, 0], 0).into();
        let client = Endpoint::client(bind)?;

        debug!(
            local = ?client.local_addr().ok(),
            server_name = %config.server_name,
            "QUIC client endpoint created"
        );

        Ok(Self {
            client,
            client_config,
            server_config,
            server_name: config.server_name.clone(),
            handshake_timeout: config.handshake_timeout,
        })
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn listen(&self, local: SocketAddr) -> Result<Box<dyn Acceptor>> {
        let endpoint = Endpoint::server(self.server_config.clone(), local)?;
        debug!(local = ?endpoint.local_addr().ok(), "QUIC listener bound");

        let (ready_tx, ready) = mpsc::channel(ACCEPT_BACKLOG);
        let handshakes = tokio::spawn(complete_handshakes(
            endpoint.clone(),
            ready_tx,
            self.handshake_timeout,
        ));
        Ok(Box::new(QuicAcceptor {
            endpoint,
            ready,
            handshakes,
        }))
    }

    async fn dial(&self, remote: SocketAddr) -> Result<Arc<dyn Session>> {
        let connecting = self
            .client
            .connect_with(self.client_config.clone(), remote, &self.server_name)
            .map_err(|e| TransportError::connection_failed(remote, e))?;

        let conn = match tokio::time::timeout(self.handshake_timeout, connecting).await {
            Err(_) | Ok(Err(ConnectionError::TimedOut)) => {
                return Err(TransportError::HandshakeTimeout);
            }
            Ok(Err(e)) => return Err(TransportError::connection_failed(remote, e)),
            Ok(Ok(conn)) => conn,
        };

        debug!(%remote, stable_id = conn.stable_id(), "QUIC session established");
        Ok(Arc::new(QuicSession { conn }))
    }
}

/// Listener whose handshakes run in a background task.
///
/// `accept` only waits on the channel of completed sessions, so dropping a
/// pending `accept` never loses a connection and a slow handshake does not
/// hold up the others.
struct QuicAcceptor {
    endpoint: Endpoint,
    ready: mpsc::Receiver<Arc<dyn Session>>,
    handshakes: JoinHandle<()>,
}

#[async_trait]
impl Acceptor for QuicAcceptor {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    async fn accept(&mut self) -> Result<Arc<dyn Session>> {
        self.ready
            .recv()
            .await
            .ok_or_else(|| TransportError::Closed("listener closed".to_string()))
    }

    fn close(&self) {
        self.endpoint
            .close(VarInt::from_u32(CLOSE_CODE_SHUTDOWN), b"shutdown");
        self.handshakes.abort();
    }
}

impl Drop for QuicAcceptor {
    fn drop(&mut self) {
        self.handshakes.abort();
    }
}

/// Accept connection attempts and finish each handshake in its own task.
///
/// Ends when the endpoint is closed. Pending handshakes are aborted then.
async fn complete_handshakes(
    endpoint: Endpoint,
    ready: mpsc::Sender<Arc<dyn Session>>,
    handshake_timeout: Duration,
) {
    let mut pending = JoinSet::new();

    while let Some(incoming) = endpoint.accept().await {
        while pending.try_join_next().is_some() {}

        let ready = ready.clone();
        pending.spawn(async move {
            let remote = incoming.remote_address();
            let conn = match tokio::time::timeout(handshake_timeout, incoming).await {
                Ok(Ok(conn)) => conn,
                // A failed inbound handshake only affects that peer
                Ok(Err(e)) => {
                    warn!(%remote, error = %e, "Inbound handshake failed");
                    return;
                }
                Err(_) => {
                    warn!(%remote, "Inbound handshake timed out");
                    return;
                }
            };

            debug!(%remote, stable_id = conn.stable_id(), "Inbound QUIC session established");
            let session: Arc<dyn Session> = Arc::new(QuicSession { conn });
            if let Err(mpsc::error::SendError(session)) = ready.send(session).await {
                session.close();
            }
        });
    }

    debug!(pending = pending.len(), "QUIC listener closed");
}

struct QuicSession {
    conn: Connection,
}

#[async_trait]
impl Session for QuicSession {
    fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    async fn open_stream(&self) -> Result<Box<dyn FrameSender>> {
        let send = self
            .conn
            .open_uni()
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))?;
        Ok(Box::new(QuicFrameSender { send }))
    }

    async fn accept_stream(&self) -> Result<Box<dyn FrameReceiver>> {
        let recv = self
            .conn
            .accept_uni()
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))?;
        Ok(Box::new(QuicFrameReceiver { recv }))
    }

    fn close(&self) {
        self.conn
            .close(VarInt::from_u32(CLOSE_CODE_SHUTDOWN), b"shutdown");
    }
}

struct QuicFrameSender {
    send: SendStream,
}

#[async_trait]
impl FrameSender for QuicFrameSender {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        write_frame(&mut self.send, frame).await
    }
}

struct QuicFrameReceiver {
    recv: RecvStream,
}

#[async_trait]
impl FrameReceiver for QuicFrameReceiver {
    async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        read_frame(&mut self.recv).await
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn transport_config(config: &QuicConfig) -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        config
            .idle_timeout
            .try_into()
            .map_err(|_| TransportError::Tls("invalid idle timeout".to_string()))?,
    ));
    transport.keep_alive_interval(Some(config.keep_alive_interval));
    Ok(transport)
}

fn build_server_config(
    config: &QuicConfig,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut tls = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    tls.alpn_protocols = vec![config.alpn.as_bytes().to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .map_err(|e| TransportError::Tls(format!("failed to create QUIC crypto config: {e}")))?;

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(Arc::new(transport_config(config)?));
    Ok(server_config)
}

fn build_client_config(
    config: &QuicConfig,
    trusted: Vec<CertificateDer<'static>>,
) -> Result<quinn::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let mut tls = if config.insecure_skip_verify {
        warn!("Peer certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        for cert in trusted {
            roots
                .add(cert)
                .map_err(|e| TransportError::Tls(e.to_string()))?;
        }
        builder
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    tls.alpn_protocols = vec![config.alpn.as_bytes().to_vec()];

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| TransportError::Tls(format!("failed to create QUIC crypto config: {e}")))?;

    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport_config(config)?));
    Ok(client_config)
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("{}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first PEM private key (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Tls(format!("{}: {e}", path.display())))?
        .ok_or_else(|| TransportError::Tls(format!("{}: no private key found", path.display())))
}

/// Certificate verifier that accepts any certificate
///
/// # Warning
///
/// Only for lab setups with throwaway certificates.
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    /// Throwaway self-signed certificate for `localhost`, written as PEM.
    fn test_config() -> (tempfile::TempDir, QuicConfig) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();

        let config = QuicConfig::new(&cert_path, &key_path).with_server_name("localhost");
        (dir, config)
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_dial_unanswered_is_handshake_timeout() {
        let (_dir, config) = test_config();
        let transport =
            QuicTransport::new(&config.with_handshake_timeout(Duration::from_millis(300))).unwrap();

        // Bound but never read: the handshake goes unanswered
        let silent = std::net::UdpSocket::bind(loopback()).unwrap();

        let started = Instant::now();
        let Err(e) = transport.dial(silent.local_addr().unwrap()).await else {
            panic!("dial to a silent socket succeeded");
        };
        assert!(e.is_handshake_timeout(), "unexpected error: {e}");
        assert!(started.elapsed() < WAIT);
    }

    #[tokio::test]
    async fn test_loopback_session_keeps_frame_order() {
        let (_dir, config) = test_config();
        let server = QuicTransport::new(&config).unwrap();
        let client = QuicTransport::new(&config).unwrap();

        let mut acceptor = server.listen(loopback()).await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let session = client.dial(addr).await.unwrap();
        let inbound = tokio::time::timeout(WAIT, acceptor.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.remote_addr(), addr);

        let mut tx = session.open_stream().await.unwrap();
        for seq in 0..20u8 {
            tx.send_frame(&[seq; 100]).await.unwrap();
        }

        let mut rx = inbound.accept_stream().await.unwrap();
        for seq in 0..20u8 {
            assert_eq!(rx.recv_frame().await.unwrap().unwrap(), vec![seq; 100]);
        }

        session.close();
        acceptor.close();
    }

    #[tokio::test]
    async fn test_second_peer_connects_while_first_session_closes() {
        let (_dir, config) = test_config();
        let server = QuicTransport::new(&config).unwrap();
        let first = QuicTransport::new(&config).unwrap();
        let second = QuicTransport::new(&config).unwrap();

        let mut acceptor = server.listen(loopback()).await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let s1 = first.dial(addr).await.unwrap();
        let inbound1 = acceptor.accept().await.unwrap();

        let dial = tokio::spawn(async move { second.dial(addr).await.map(|s| s.remote_addr()) });
        s1.close();

        // Dropping pending accepts must not lose the second handshake
        let inbound2 = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(res) = tokio::time::timeout(Duration::from_millis(1), acceptor.accept()).await {
                    return res.unwrap();
                }
            }
        })
        .await
        .expect("second session was never accepted");

        assert_eq!(dial.await.unwrap().unwrap(), addr);
        assert_ne!(inbound2.remote_addr(), inbound1.remote_addr());
        assert!(inbound1.accept_stream().await.is_err());

        acceptor.close();
    }

    #[test]
    fn test_config_defaults() {
        let config = QuicConfig::new("/tmp/cert.pem", "/tmp/key.pem");
        assert_eq!(config.alpn, DEFAULT_ALPN);
        assert_eq!(config.server_name, DEFAULT_ALPN);
        assert!(!config.insecure_skip_verify);
        assert!(config.ca_path.is_none());
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_closed_listener_fails_accept() {
        let (_dir, config) = test_config();
        let server = QuicTransport::new(&config).unwrap();

        let mut acceptor = server.listen(loopback()).await.unwrap();
        acceptor.close();

        let res = tokio::time::timeout(WAIT, acceptor.accept()).await.unwrap();
        assert!(matches!(res, Err(TransportError::Closed(_))));
    }

    #[test]
    fn test_load_certs_missing_file() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[test]
    fn test_load_certs_without_pem_blocks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let err = load_certs(file.path()).unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }

    #[test]
    fn test_load_private_key_without_pem_blocks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "still not a key").unwrap();

        let err = load_private_key(file.path()).unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }
}
