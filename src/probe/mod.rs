//! TLS probe
//!
//! Opens a TCP connection to the broker's TLS listener, runs a client
//! handshake validating the peer chain against a supplied trust
//! anchor, and classifies what happened. The classification layer is
//! deliberate: a harness must not conflate "wrong CA correctly
//! rejected" with "server is broken", so certificate-chain failures
//! are kept apart from every other TLS-layer error.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Error type for probe setup
///
/// Distinct from [`ProbeOutcome`]: these are local harness failures
/// (unreadable trust anchor, bad host name), not observations about
/// the broker under test.
#[derive(Debug)]
pub enum ProbeError {
    /// Trust anchor bundle could not be read or parsed
    TrustAnchor(PathBuf, String),
    /// Host is not a valid TLS server name
    InvalidServerName(String),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::TrustAnchor(path, msg) => {
                write!(f, "trust anchor {}: {}", path.display(), msg)
            }
            ProbeError::InvalidServerName(host) => {
                write!(f, "invalid TLS server name: {}", host)
            }
        }
    }
}

impl std::error::Error for ProbeError {}

/// Classified result of one probe attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Handshake completed; the peer chain validated against the trust anchor
    HandshakeSucceeded {
        /// Negotiated protocol version, e.g. "TLSv1_3"
        tls_version: String,
    },
    /// Handshake failed because the peer chain does not validate
    /// against the trust anchor
    HandshakeFailedTrust { detail: String },
    /// Handshake failed for any other TLS-layer reason
    HandshakeFailedOther { detail: String },
    /// No response within the probe timeout
    ConnectionTimedOut,
    /// The OS refused the connection (no listener)
    ConnectionRefused,
}

impl ProbeOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ProbeOutcome::HandshakeSucceeded { .. } => OutcomeKind::HandshakeSucceeded,
            ProbeOutcome::HandshakeFailedTrust { .. } => OutcomeKind::HandshakeFailedTrust,
            ProbeOutcome::HandshakeFailedOther { .. } => OutcomeKind::HandshakeFailedOther,
            ProbeOutcome::ConnectionTimedOut => OutcomeKind::ConnectionTimedOut,
            ProbeOutcome::ConnectionRefused => OutcomeKind::ConnectionRefused,
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::HandshakeSucceeded { tls_version } => {
                write!(f, "handshake succeeded ({})", tls_version)
            }
            ProbeOutcome::HandshakeFailedTrust { detail } => {
                write!(f, "handshake failed, chain verification: {}", detail)
            }
            ProbeOutcome::HandshakeFailedOther { detail } => {
                write!(f, "handshake failed: {}", detail)
            }
            ProbeOutcome::ConnectionTimedOut => write!(f, "connection timed out"),
            ProbeOutcome::ConnectionRefused => write!(f, "connection refused"),
        }
    }
}

/// Discriminant of [`ProbeOutcome`], used to state scenario expectations
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeKind {
    HandshakeSucceeded,
    HandshakeFailedTrust,
    HandshakeFailedOther,
    ConnectionTimedOut,
    ConnectionRefused,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeKind::HandshakeSucceeded => "handshake-succeeded",
            OutcomeKind::HandshakeFailedTrust => "handshake-failed-trust",
            OutcomeKind::HandshakeFailedOther => "handshake-failed-other",
            OutcomeKind::ConnectionTimedOut => "connection-timed-out",
            OutcomeKind::ConnectionRefused => "connection-refused",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "handshake-succeeded" => Ok(Self::HandshakeSucceeded),
            "handshake-failed-trust" => Ok(Self::HandshakeFailedTrust),
            "handshake-failed-other" => Ok(Self::HandshakeFailedOther),
            "connection-timed-out" => Ok(Self::ConnectionTimedOut),
            "connection-refused" => Ok(Self::ConnectionRefused),
            other => Err(format!("unknown probe outcome: {}", other)),
        }
    }
}

/// Attempt one TLS handshake against `host:port`, validating the peer
/// chain against the PEM trust anchor bundle at `trust_anchor`.
///
/// Every await is bounded by `probe_timeout`; the socket is dropped
/// (closed) on every exit path.
pub async fn attempt(
    host: &str,
    port: u16,
    trust_anchor: &Path,
    probe_timeout: Duration,
) -> Result<ProbeOutcome, ProbeError> {
    let connector = build_connector(trust_anchor)?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| ProbeError::InvalidServerName(host.to_string()))?;

    debug!(host, port, anchor = %trust_anchor.display(), "probing TLS listener");

    let stream = match timeout(probe_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Ok(classify_io_error(&e)),
        Err(_) => return Ok(ProbeOutcome::ConnectionTimedOut),
    };

    match timeout(probe_timeout, connector.connect(server_name, stream)).await {
        Ok(Ok(tls)) => {
            let (_, session) = tls.get_ref();
            let tls_version = session
                .protocol_version()
                .map(|v| format!("{:?}", v))
                .unwrap_or_else(|| "unknown".to_string());
            Ok(ProbeOutcome::HandshakeSucceeded { tls_version })
        }
        Ok(Err(e)) => Ok(classify_io_error(&e)),
        Err(_) => Ok(ProbeOutcome::ConnectionTimedOut),
    }
}

/// Build a TLS connector that requires the peer chain to validate
/// against the given PEM bundle.
fn build_connector(trust_anchor: &Path) -> Result<TlsConnector, ProbeError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(trust_anchor)
        .map_err(|e| ProbeError::TrustAnchor(trust_anchor.to_path_buf(), e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProbeError::TrustAnchor(trust_anchor.to_path_buf(), e.to_string()))?;

    if certs.is_empty() {
        return Err(ProbeError::TrustAnchor(
            trust_anchor.to_path_buf(),
            "no certificates found".to_string(),
        ));
    }

    let mut root_store = RootCertStore::empty();
    for cert in certs {
        root_store
            .add(cert)
            .map_err(|e| ProbeError::TrustAnchor(trust_anchor.to_path_buf(), e.to_string()))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Stable classification layer over whatever the TLS backend reports.
///
/// rustls surfaces handshake failures as `io::Error` values wrapping a
/// `rustls::Error`. Every `InvalidCertificate` variant is a
/// chain-verification failure against the supplied trust anchor; all
/// other TLS-layer errors (version mismatch, malformed record, peer
/// reset mid-handshake) classify as Other.
fn classify_io_error(e: &std::io::Error) -> ProbeOutcome {
    use tokio_rustls::rustls::Error as TlsError;

    if let Some(tls_err) = e.get_ref().and_then(|inner| inner.downcast_ref::<TlsError>()) {
        return match tls_err {
            TlsError::InvalidCertificate(cert_err) => ProbeOutcome::HandshakeFailedTrust {
                detail: format!("{:?}", cert_err),
            },
            other => ProbeOutcome::HandshakeFailedOther {
                detail: other.to_string(),
            },
        };
    }

    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => ProbeOutcome::ConnectionRefused,
        std::io::ErrorKind::TimedOut => ProbeOutcome::ConnectionTimedOut,
        _ => ProbeOutcome::HandshakeFailedOther {
            detail: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Error, ErrorKind};

    use tokio_rustls::rustls::{AlertDescription, CertificateError, Error as TlsError};

    use super::*;

    fn wrap(err: TlsError) -> Error {
        Error::new(ErrorKind::InvalidData, err)
    }

    #[test]
    fn unknown_issuer_classifies_as_trust_failure() {
        let outcome = classify_io_error(&wrap(TlsError::InvalidCertificate(
            CertificateError::UnknownIssuer,
        )));
        assert_eq!(outcome.kind(), OutcomeKind::HandshakeFailedTrust);
    }

    #[test]
    fn expired_certificate_classifies_as_trust_failure() {
        let outcome = classify_io_error(&wrap(TlsError::InvalidCertificate(
            CertificateError::Expired,
        )));
        assert_eq!(outcome.kind(), OutcomeKind::HandshakeFailedTrust);
    }

    #[test]
    fn alert_classifies_as_other_failure() {
        let outcome = classify_io_error(&wrap(TlsError::AlertReceived(
            AlertDescription::HandshakeFailure,
        )));
        assert_eq!(outcome.kind(), OutcomeKind::HandshakeFailedOther);
    }

    #[test]
    fn refused_and_timeout_map_to_their_outcomes() {
        let refused = Error::from(ErrorKind::ConnectionRefused);
        assert_eq!(classify_io_error(&refused), ProbeOutcome::ConnectionRefused);

        let timed_out = Error::from(ErrorKind::TimedOut);
        assert_eq!(classify_io_error(&timed_out), ProbeOutcome::ConnectionTimedOut);
    }

    #[test]
    fn reset_without_tls_detail_is_other() {
        let reset = Error::from(ErrorKind::ConnectionReset);
        assert_eq!(
            classify_io_error(&reset).kind(),
            OutcomeKind::HandshakeFailedOther
        );
    }

    #[test]
    fn outcome_kind_parses_kebab_case() {
        assert_eq!(
            "handshake-failed-trust".parse::<OutcomeKind>().unwrap(),
            OutcomeKind::HandshakeFailedTrust
        );
        assert!("nonsense".parse::<OutcomeKind>().is_err());
    }

    #[tokio::test]
    async fn probing_a_closed_port_is_refused() {
        // Bind then drop to get a port with no listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let outcome = attempt(
            "127.0.0.1",
            port,
            Path::new("testdata/ssl/test-alt-ca.crt"),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(outcome, ProbeOutcome::ConnectionRefused);
    }

    #[tokio::test]
    async fn silent_listener_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            // Accept and hold sockets without ever writing a byte.
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let outcome = attempt(
            "127.0.0.1",
            port,
            Path::new("testdata/ssl/test-alt-ca.crt"),
            Duration::from_millis(300),
        )
        .await
        .unwrap();
        assert_eq!(outcome, ProbeOutcome::ConnectionTimedOut);
        hold.abort();
    }

    #[tokio::test]
    async fn non_tls_peer_is_other_failure() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 not a tls server\r\n").await.unwrap();
        });

        let outcome = attempt(
            "127.0.0.1",
            port,
            Path::new("testdata/ssl/test-alt-ca.crt"),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(outcome.kind(), OutcomeKind::HandshakeFailedOther);
        let _ = server.await;
    }

    #[tokio::test]
    async fn missing_trust_anchor_is_a_probe_error() {
        let result = attempt(
            "127.0.0.1",
            1,
            Path::new("testdata/ssl/does-not-exist.crt"),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ProbeError::TrustAnchor(_, _))));
    }
}
