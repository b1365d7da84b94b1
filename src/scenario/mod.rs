//! Scenario driver
//!
//! Ties the harness together: start the broker under test, run the TLS
//! probe, compare the classified outcome against the scenario's
//! expectation, stop the broker, and reduce everything to a process
//! exit status. The broker is stopped on every code path, including
//! probe failure, so a failing scenario cannot leak its subprocess or
//! its listening port into the next run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, info};

use crate::broker::{self, BrokerConfig};
use crate::codec::{connack_bytes, connect_bytes};
use crate::probe::{self, OutcomeKind, ProbeOutcome};
use crate::protocol::{ConnAckSpec, ConnectReturnCode, ConnectSpec};

/// Error type for scenario definition files
#[derive(Debug)]
pub enum ScenarioError {
    /// IO error reading the scenario file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioError::Io(e) => write!(f, "IO error: {}", e),
            ScenarioError::Parse(e) => write!(f, "Parse error: {}", e),
        }
    }
}

impl std::error::Error for ScenarioError {}

impl From<std::io::Error> for ScenarioError {
    fn from(e: std::io::Error) -> Self {
        ScenarioError::Io(e)
    }
}

impl From<toml::de::Error> for ScenarioError {
    fn from(e: toml::de::Error) -> Self {
        ScenarioError::Parse(e)
    }
}

/// CONNECT fixture parameters in a scenario file
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectFixture {
    /// Client identifier
    pub client_id: String,
    /// Keep alive in seconds
    pub keep_alive: u16,
}

impl Default for ConnectFixture {
    fn default() -> Self {
        Self {
            client_id: "connect-success-test".to_string(),
            keep_alive: 10,
        }
    }
}

/// One self-contained test case: configuration, action, expected outcome
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    /// Scenario name, used in diagnostics
    pub name: String,
    /// Broker configuration fixture (resolved against the fixture dir
    /// unless absolute)
    pub fixture: PathBuf,
    /// PEM trust anchor the probe validates against (resolved against
    /// the ssl dir unless absolute)
    pub trust_anchor: PathBuf,
    /// Host to probe
    #[serde(default = "default_host")]
    pub host: String,
    /// TLS listener port to probe
    pub port: u16,
    /// Probe timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Expected probe outcome
    pub expect: OutcomeKind,
    /// CONNECT fixture the scenario family sends once a handshake
    /// completes
    #[serde(default)]
    pub connect: ConnectFixture,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

impl Scenario {
    /// Load a scenario definition from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Resolve the fixture and trust anchor against base directories.
    /// Absolute paths in the scenario file win.
    pub fn resolve_paths(&mut self, fixture_dir: &Path, ssl_dir: &Path) {
        if self.fixture.is_relative() {
            self.fixture = fixture_dir.join(&self.fixture);
        }
        if self.trust_anchor.is_relative() {
            self.trust_anchor = ssl_dir.join(&self.trust_anchor);
        }
    }

    /// Run the scenario end-to-end against a broker launched from
    /// `broker_config`.
    pub async fn run(&self, broker_config: &BrokerConfig) -> ScenarioReport {
        // Build the fixture packets up front. The wrong-CA scenario
        // never exchanges application bytes, but an encoding failure
        // is a harness bug and must surface before the broker starts.
        let connect = ConnectSpec::new(self.connect.client_id.clone())
            .keep_alive(self.connect.keep_alive);
        let connack = ConnAckSpec::new(ConnectReturnCode::Accepted);

        let connect_packet = match connect_bytes(&connect) {
            Ok(bytes) => bytes,
            Err(e) => {
                return ScenarioReport::harness_error(self, format!("encoding CONNECT: {}", e))
            }
        };
        let connack_packet = connack_bytes(&connack);
        debug!(
            connect = connect_packet.len(),
            connack = connack_packet.len(),
            "fixture packets built"
        );

        info!(scenario = %self.name, expect = %self.expect, "starting scenario");

        let mut broker = match broker::start(broker_config).await {
            Ok(broker) => broker,
            Err(e) => {
                // No probe on startup failure.
                return ScenarioReport::harness_error(self, format!("broker startup: {}", e));
            }
        };

        let probe_result =
            probe::attempt(&self.host, self.port, &self.trust_anchor, self.timeout).await;

        // Stop unconditionally before looking at the probe result.
        let stop_result = broker.stop().await;

        let observed = match probe_result {
            Ok(outcome) => outcome,
            Err(e) => return ScenarioReport::harness_error(self, format!("probe: {}", e)),
        };
        if let Err(e) = stop_result {
            error!(error = %e, "broker did not stop cleanly");
            return ScenarioReport::harness_error(self, format!("broker stop: {}", e));
        }

        ScenarioReport {
            name: self.name.clone(),
            expected: self.expect,
            observed: Some(observed),
            error: None,
        }
    }
}

/// Result of one scenario run
#[derive(Debug)]
pub struct ScenarioReport {
    /// Scenario name
    pub name: String,
    /// Outcome the scenario expected
    pub expected: OutcomeKind,
    /// Outcome the probe observed, if the probe ran
    pub observed: Option<ProbeOutcome>,
    /// Harness-level failure (startup, probe setup, stop)
    pub error: Option<String>,
}

impl ScenarioReport {
    fn harness_error(scenario: &Scenario, message: String) -> Self {
        Self {
            name: scenario.name.clone(),
            expected: scenario.expect,
            observed: None,
            error: Some(message),
        }
    }

    /// True when the observed outcome matches the expectation and no
    /// harness-level failure occurred
    pub fn passed(&self) -> bool {
        self.error.is_none()
            && self
                .observed
                .as_ref()
                .is_some_and(|outcome| outcome.kind() == self.expected)
    }

    /// Process exit status: 0 for the expected outcome, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(error) = &self.error {
            return write!(f, "{}: FAIL ({})", self.name, error);
        }
        match &self.observed {
            Some(outcome) if self.passed() => {
                write!(f, "{}: PASS ({})", self.name, outcome)
            }
            Some(outcome) => {
                write!(
                    f,
                    "{}: FAIL (expected {}, observed {})",
                    self.name, self.expected, outcome
                )
            }
            None => write!(f, "{}: FAIL (probe did not run)", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    use pretty_assertions::assert_eq;

    use super::*;

    fn report(expected: OutcomeKind, observed: Option<ProbeOutcome>) -> ScenarioReport {
        ScenarioReport {
            name: "t".to_string(),
            expected,
            observed,
            error: None,
        }
    }

    #[test]
    fn matching_outcome_exits_zero() {
        let r = report(
            OutcomeKind::HandshakeFailedTrust,
            Some(ProbeOutcome::HandshakeFailedTrust {
                detail: "UnknownIssuer".to_string(),
            }),
        );
        assert!(r.passed());
        assert_eq!(r.exit_code(), 0);
    }

    #[test]
    fn any_other_outcome_exits_nonzero() {
        // Success is a failure when the scenario expects rejection.
        let r = report(
            OutcomeKind::HandshakeFailedTrust,
            Some(ProbeOutcome::HandshakeSucceeded {
                tls_version: "TLSv1_3".to_string(),
            }),
        );
        assert!(!r.passed());
        assert_eq!(r.exit_code(), 1);

        let r = report(
            OutcomeKind::HandshakeFailedTrust,
            Some(ProbeOutcome::HandshakeFailedOther {
                detail: "alert".to_string(),
            }),
        );
        assert_eq!(r.exit_code(), 1);

        let r = report(OutcomeKind::HandshakeFailedTrust, None);
        assert_eq!(r.exit_code(), 1);
    }

    #[test]
    fn harness_error_exits_nonzero() {
        let mut r = report(OutcomeKind::ConnectionRefused, None);
        r.error = Some("broker startup: fixture missing".to_string());
        assert_eq!(r.exit_code(), 1);
        assert!(r.to_string().contains("fixture missing"));
    }

    #[test]
    fn scenario_file_parses_with_defaults() {
        let scenario: Scenario = toml::from_str(
            r#"
            name = "ssl-connect-no-auth-wrong-ca"
            fixture = "08-ssl-connect-no-auth-wrong-ca.conf"
            trust_anchor = "test-alt-ca.crt"
            port = 1888
            expect = "handshake-failed-trust"
            "#,
        )
        .unwrap();

        assert_eq!(scenario.host, "localhost");
        assert_eq!(scenario.timeout, Duration::from_secs(20));
        assert_eq!(scenario.expect, OutcomeKind::HandshakeFailedTrust);
        assert_eq!(scenario.connect.client_id, "connect-success-test");
        assert_eq!(scenario.connect.keep_alive, 10);
    }

    #[test]
    fn relative_paths_resolve_against_base_dirs() {
        let mut scenario: Scenario = toml::from_str(
            r#"
            name = "s"
            fixture = "a.conf"
            trust_anchor = "/abs/ca.crt"
            port = 1888
            expect = "handshake-failed-trust"
            "#,
        )
        .unwrap();
        scenario.resolve_paths(Path::new("/fixtures"), Path::new("/ssl"));
        assert_eq!(scenario.fixture, PathBuf::from("/fixtures/a.conf"));
        assert_eq!(scenario.trust_anchor, PathBuf::from("/abs/ca.crt"));
    }

    fn sleeper_binary(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("fake-broker");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\nsleep 30").unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn startup_failure_skips_probe_and_fails() {
        let scenario = Scenario {
            name: "missing-fixture".to_string(),
            fixture: PathBuf::from("/nonexistent.conf"),
            trust_anchor: PathBuf::from("testdata/ssl/test-alt-ca.crt"),
            host: "127.0.0.1".to_string(),
            port: 1888,
            timeout: Duration::from_secs(1),
            expect: OutcomeKind::HandshakeFailedTrust,
            connect: ConnectFixture::default(),
        };
        let broker_config = BrokerConfig {
            config_fixture: scenario.fixture.clone(),
            ..Default::default()
        };

        let report = scenario.run(&broker_config).await;
        assert!(report.observed.is_none(), "probe must not run");
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn refused_port_matches_refused_expectation() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = dir.path().join("scenario.conf");
        std::fs::write(&fixture, "listener 1888\n").unwrap();

        // Port bound then dropped: guaranteed to refuse.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let scenario = Scenario {
            name: "refused".to_string(),
            fixture: fixture.clone(),
            trust_anchor: PathBuf::from("testdata/ssl/test-alt-ca.crt"),
            host: "127.0.0.1".to_string(),
            port,
            timeout: Duration::from_secs(2),
            expect: OutcomeKind::ConnectionRefused,
            connect: ConnectFixture::default(),
        };
        let broker_config = BrokerConfig {
            binary: sleeper_binary(&dir),
            config_fixture: fixture,
            host: "127.0.0.1".to_string(),
            listener_ports: vec![],
            grace_period: Duration::from_secs(2),
            ..Default::default()
        };

        let report = scenario.run(&broker_config).await;
        assert_eq!(
            report.observed.as_ref().map(|o| o.kind()),
            Some(OutcomeKind::ConnectionRefused)
        );
        assert_eq!(report.exit_code(), 0);
    }
}
