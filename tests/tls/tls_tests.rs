//! TLS tests
//!
//! Invalid combinations must fail before any socket I/O; missing or empty
//! certificate material fails at connect time. Working handshakes run
//! against certificates generated per test.

use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use tempfile::TempDir;

use collab_sync::client::{Client, ClientOptions, ServerDescriptor};
use collab_sync::config::ServerConfig;
use collab_sync::model::Repository;
use collab_sync::server::Server;
use collab_sync::tls::{ListenerTls, ServerSslMode, TlsSettings};
use collab_sync::SyncError;

use crate::common::TestServer;

/// A throwaway CA with one server and one client certificate, as PEM files
struct Pki {
    dir: TempDir,
}

impl Pki {
    fn generate() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "collab-sync test CA");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = ca_params.self_signed(&ca_key).unwrap();
        std::fs::write(dir.path().join("CA.crt"), ca.pem()).unwrap();

        let server = leaf(
            vec!["localhost".to_string(), "127.0.0.1".to_string()],
            ExtendedKeyUsagePurpose::ServerAuth,
            &ca,
            &ca_key,
        );
        std::fs::write(dir.path().join("server.pem"), server).unwrap();

        let client = leaf(
            vec!["alice".to_string()],
            ExtendedKeyUsagePurpose::ClientAuth,
            &ca,
            &ca_key,
        );
        std::fs::write(dir.path().join("client.pem"), client).unwrap();

        Self { dir }
    }

    fn ca(&self) -> PathBuf {
        self.dir.path().join("CA.crt")
    }

    fn server_identity(&self) -> PathBuf {
        self.dir.path().join("server.pem")
    }

    fn client_identity(&self) -> PathBuf {
        self.dir.path().join("client.pem")
    }

    fn listener(&self, require_client_cert: bool) -> ServerConfig {
        ServerConfig {
            tls: ListenerTls {
                server_identity_path: Some(self.server_identity()),
                client_ca_path: require_client_cert.then(|| self.ca()),
            },
            ..ServerConfig::default()
        }
    }
}

/// Certificate and key signed by `ca`, concatenated in one PEM
fn leaf(
    names: Vec<String>,
    usage: ExtendedKeyUsagePurpose,
    ca: &Certificate,
    ca_key: &KeyPair,
) -> String {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(names).unwrap();
    params.extended_key_usages = vec![usage];
    let cert = params.signed_by(&key, ca, ca_key).unwrap();
    format!("{}{}", cert.pem(), key.serialize_pem())
}

fn over_tls(server: &TestServer, tls: TlsSettings) -> ServerDescriptor {
    server.descriptor().with_tls(tls)
}

fn assert_exists(path: &Path) {
    assert!(path.exists(), "{} was not written", path.display());
}

#[tokio::test]
async fn test_client_cert_without_server_tls() {
    // Port 1 is never contacted: validation fails first
    let server = ServerDescriptor::new("127.0.0.1", 1)
        .with_tls(TlsSettings::plaintext().with_client_cert("/etc/collab/client.pem"));
    let result = Client::connect(&server, ClientOptions::default()).await;
    assert!(matches!(result, Err(SyncError::Config { .. })));
}

#[tokio::test]
async fn test_custom_ca_without_path() {
    let tls = TlsSettings {
        server_ssl_mode: ServerSslMode::CustomCa,
        ..TlsSettings::plaintext()
    };
    let server = ServerDescriptor::new("127.0.0.1", 1).with_tls(tls);
    let result = Client::connect(&server, ClientOptions::default()).await;
    assert!(matches!(result, Err(SyncError::Config { .. })));
}

#[tokio::test]
async fn test_missing_ca_file_fails_to_connect() {
    let server = TestServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let descriptor = server
        .descriptor()
        .with_tls(TlsSettings::custom_ca(dir.path().join("CAserver.crt")));
    let result = Client::connect(&descriptor, ClientOptions::default()).await;
    assert!(matches!(result, Err(SyncError::ConnectionFailed { .. })));

    // Nothing reached the server
    assert_eq!(server.handle.stats().sessions, 0);
    server.shutdown().await;
}

#[tokio::test]
async fn test_empty_ca_file_fails_to_connect() {
    let dir = tempfile::tempdir().unwrap();
    let ca_path = dir.path().join("CAserver.crt");
    std::fs::write(&ca_path, "").unwrap();

    let descriptor =
        ServerDescriptor::new("127.0.0.1", 1).with_tls(TlsSettings::custom_ca(&ca_path));
    let result = Client::connect(&descriptor, ClientOptions::default()).await;
    assert!(matches!(result, Err(SyncError::ConnectionFailed { .. })));
}

#[tokio::test]
async fn test_listener_client_ca_requires_identity() {
    let config = ServerConfig {
        port: 0,
        tls: ListenerTls {
            server_identity_path: None,
            client_ca_path: Some(PathBuf::from("/etc/collab/CAclient.crt")),
        },
        ..ServerConfig::default()
    };
    assert!(matches!(
        Server::bind(config).await,
        Err(SyncError::Config { .. })
    ));
}

#[tokio::test]
async fn test_listener_rejects_identity_without_key() {
    let dir = tempfile::tempdir().unwrap();
    let identity = dir.path().join("server.pem");
    std::fs::write(&identity, "not a pem file").unwrap();

    let config = ServerConfig {
        port: 0,
        tls: ListenerTls {
            server_identity_path: Some(identity),
            client_ca_path: None,
        },
        ..ServerConfig::default()
    };
    assert!(matches!(
        Server::bind(config).await,
        Err(SyncError::Config { .. })
    ));
}

// ============================================================================
// WORKING HANDSHAKES
// ============================================================================

#[tokio::test]
async fn test_custom_ca_connect_and_query() {
    let pki = Pki::generate();
    assert_exists(&pki.ca());
    let server = TestServer::start_with(pki.listener(false)).await;

    let client = Client::connect(
        &over_tls(&server, TlsSettings::custom_ca(pki.ca())),
        ClientOptions::default(),
    )
    .await
    .unwrap();
    assert!(client.handshake().tls);
    assert!(!client.handshake().peer_certificates.is_empty());

    client
        .new_repository(Repository::new("proj1", "d41d8cd9", "proj1.i64", "ELF64"))
        .await
        .unwrap();
    assert_eq!(client.repositories().await.unwrap().len(), 1);

    client.disconnect().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_mutual_tls_with_client_certificate() {
    let pki = Pki::generate();
    let server = TestServer::start_with(pki.listener(true)).await;

    let tls = TlsSettings::custom_ca(pki.ca()).with_client_cert(pki.client_identity());
    let client = Client::connect(&over_tls(&server, tls), ClientOptions::default())
        .await
        .unwrap();
    assert!(client.repositories().await.unwrap().is_empty());
    assert_eq!(server.handle.stats().sessions, 1);

    client.disconnect().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_client_without_certificate_is_refused() {
    let pki = Pki::generate();
    let server = TestServer::start_with(pki.listener(true)).await;

    // Under TLS 1.3 the refusal may only surface after the handshake
    match Client::connect(
        &over_tls(&server, TlsSettings::custom_ca(pki.ca())),
        ClientOptions::default(),
    )
    .await
    {
        Err(e) => assert!(matches!(e, SyncError::ConnectionFailed { .. }), "{:?}", e),
        Ok(client) => assert!(client.repositories().await.is_err()),
    }
    assert_eq!(server.handle.stats().sessions, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_server_outside_custom_ca_is_refused() {
    let pki = Pki::generate();
    let other = Pki::generate();
    let server = TestServer::start_with(pki.listener(false)).await;

    let result = Client::connect(
        &over_tls(&server, TlsSettings::custom_ca(other.ca())),
        ClientOptions::default(),
    )
    .await;
    assert!(matches!(result, Err(SyncError::ConnectionFailed { .. })));

    server.shutdown().await;
}
