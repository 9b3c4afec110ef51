//! End-to-end certificate rotation tests.
//!
//! Drives a real listener with real TLS handshakes: rotate the on-disk
//! cert/key pair and verify that new handshakes present the new
//! certificate while established connections keep working.

use certswap_server::{Config, EchoHandler, SecureListener};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

const CERT_A: &str = include_str!("certs/cert_a.pem");
const KEY_A: &str = include_str!("certs/key_a.pem");
const CERT_B: &str = include_str!("certs/cert_b.pem");
const KEY_B: &str = include_str!("certs/key_b.pem");

/// Short debounce so the tests stay fast; long enough that both files of a
/// pair land within one window.
const ROTATION_DELAY_SECS: u64 = 1;

struct CertDir {
    _dir: TempDir,
    cert: PathBuf,
    key: PathBuf,
}

impl CertDir {
    fn new(cert_pem: &str, key_pem: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("server.pem");
        let key = dir.path().join("server.key");
        std::fs::write(&cert, cert_pem).unwrap();
        std::fs::write(&key, key_pem).unwrap();
        Self {
            _dir: dir,
            cert,
            key,
        }
    }

    /// Replaces a file the way certificate managers do: write a staging
    /// file, then rename it over the target (new inode, same path).
    fn replace(path: &Path, contents: &str) {
        let staged = path.with_extension("staged");
        std::fs::write(&staged, contents).unwrap();
        std::fs::rename(&staged, path).unwrap();
    }

    fn config(&self) -> Config {
        let mut config = Config::default();
        config.network.port = 0; // ephemeral
        config.tls.cert_path = Some(self.cert.clone());
        config.tls.key_path = Some(self.key.clone());
        config.tls.rotation_delay_secs = ROTATION_DELAY_SECS;
        config
    }
}

/// Accepts any server certificate; the tests assert on the presented
/// certificate bytes instead of trusting a CA.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

async fn connect_tls(addr: SocketAddr) -> TlsStream<TcpStream> {
    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));

    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    connector.connect(server_name, tcp).await.unwrap()
}

/// DER bytes of the certificate the server presented during the handshake.
fn presented_cert(stream: &TlsStream<TcpStream>) -> Vec<u8> {
    stream.get_ref().1.peer_certificates().unwrap()[0].to_vec()
}

/// DER bytes of the first certificate in a PEM bundle.
fn cert_der(pem: &str) -> Vec<u8> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .unwrap()
        .unwrap()
        .to_vec()
}

async fn wait_for_rotations(listener: &SecureListener, n: u64) {
    for _ in 0..100 {
        if listener.rotation_count() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!(
        "expected {} rotation(s), have {}",
        n,
        listener.rotation_count()
    );
}

async fn echo_roundtrip(stream: &mut TlsStream<TcpStream>, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn test_rotation_presents_new_certificate() {
    let certs = CertDir::new(CERT_A, KEY_A);
    let mut listener = SecureListener::new(certs.config(), Arc::new(EchoHandler)).unwrap();
    listener.start().await.unwrap();
    let addr = listener.local_addr().unwrap();
    assert!(listener.is_secure());

    // Handshake before rotation presents pair A
    let mut early = connect_tls(addr).await;
    assert_eq!(presented_cert(&early), cert_der(CERT_A));

    // Rotate: cert first, key shortly after, like cert managers do
    CertDir::replace(&certs.cert, CERT_B);
    CertDir::replace(&certs.key, KEY_B);
    wait_for_rotations(&listener, 1).await;

    // New handshake presents pair B
    let late = connect_tls(addr).await;
    assert_eq!(presented_cert(&late), cert_der(CERT_B));

    // The pre-rotation connection is unaffected
    echo_roundtrip(&mut early, b"still alive").await;

    listener.stop(true).await;
}

#[tokio::test]
async fn test_changes_within_window_rebuild_once() {
    let certs = CertDir::new(CERT_A, KEY_A);
    let mut listener = SecureListener::new(certs.config(), Arc::new(EchoHandler)).unwrap();
    listener.start().await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Two file replacements inside one debounce window
    CertDir::replace(&certs.cert, CERT_B);
    tokio::time::sleep(Duration::from_millis(200)).await;
    CertDir::replace(&certs.key, KEY_B);

    wait_for_rotations(&listener, 1).await;

    // No second rebuild after the window has passed
    tokio::time::sleep(Duration::from_secs(2 * ROTATION_DELAY_SECS)).await;
    assert_eq!(listener.rotation_count(), 1);

    // The single rebuild used the final contents of both files
    let stream = connect_tls(addr).await;
    assert_eq!(presented_cert(&stream), cert_der(CERT_B));

    listener.stop(true).await;
}

#[tokio::test]
async fn test_failed_rotation_keeps_previous_context() {
    let certs = CertDir::new(CERT_A, KEY_A);
    let mut listener = SecureListener::new(certs.config(), Arc::new(EchoHandler)).unwrap();
    listener.start().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let before = listener.tls_context().unwrap();

    // Truncated key makes the rebuild fail
    CertDir::replace(&certs.key, &KEY_A[..KEY_A.len() / 2]);
    tokio::time::sleep(Duration::from_secs(ROTATION_DELAY_SECS + 2)).await;

    assert_eq!(listener.rotation_count(), 0);
    let after = listener.tls_context().unwrap();
    assert!(Arc::ptr_eq(&before, &after));

    // Handshakes still use pair A
    let stream = connect_tls(addr).await;
    assert_eq!(presented_cert(&stream), cert_der(CERT_A));

    listener.stop(true).await;
}

#[tokio::test]
async fn test_failed_rotation_then_valid_pair_recovers() {
    let certs = CertDir::new(CERT_A, KEY_A);
    let mut listener = SecureListener::new(certs.config(), Arc::new(EchoHandler)).unwrap();
    listener.start().await.unwrap();
    let addr = listener.local_addr().unwrap();

    CertDir::replace(&certs.key, "garbage");
    tokio::time::sleep(Duration::from_secs(ROTATION_DELAY_SECS + 2)).await;
    assert_eq!(listener.rotation_count(), 0);

    // A later consistent pair rotates normally
    CertDir::replace(&certs.cert, CERT_B);
    CertDir::replace(&certs.key, KEY_B);
    wait_for_rotations(&listener, 1).await;

    let stream = connect_tls(addr).await;
    assert_eq!(presented_cert(&stream), cert_der(CERT_B));

    listener.stop(true).await;
}
