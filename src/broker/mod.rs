//! Broker-under-test process lifecycle
//!
//! Spawns the external broker binary with a configuration fixture,
//! waits for its listeners to come up, and tears it down again. The
//! readiness wait is a bounded connect-poll loop rather than a fixed
//! settle delay, so scenarios do not race the listener bind. Exactly
//! one live [`BrokerProcess`] may hold the listening ports at a time;
//! `stop` releases them before the next scenario starts.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Error type for broker startup
#[derive(Debug)]
pub enum StartupError {
    /// Configuration fixture does not exist
    FixtureMissing(PathBuf),
    /// Broker binary could not be spawned
    Spawn(std::io::Error),
    /// Broker exited before its listeners came up
    ExitedEarly {
        status: ExitStatus,
        output: String,
    },
    /// Listeners did not come up within the startup timeout
    ReadyTimeout {
        elapsed: Duration,
        output: String,
    },
    /// IO error while supervising the broker
    Io(std::io::Error),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::FixtureMissing(path) => {
                write!(f, "configuration fixture not found: {}", path.display())
            }
            StartupError::Spawn(e) => write!(f, "failed to spawn broker: {}", e),
            StartupError::ExitedEarly { status, output } => {
                write!(f, "broker exited before ready ({}): {}", status, output)
            }
            StartupError::ReadyTimeout { elapsed, output } => {
                write!(
                    f,
                    "broker listeners not ready after {:?}: {}",
                    elapsed, output
                )
            }
            StartupError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for StartupError {}

impl From<std::io::Error> for StartupError {
    fn from(e: std::io::Error) -> Self {
        StartupError::Io(e)
    }
}

/// Error type for broker shutdown
#[derive(Debug)]
pub enum StopError {
    /// IO error waiting for the broker to exit
    Io(std::io::Error),
}

impl std::fmt::Display for StopError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopError::Io(e) => write!(f, "IO error stopping broker: {}", e),
        }
    }
}

impl std::error::Error for StopError {}

impl From<std::io::Error> for StopError {
    fn from(e: std::io::Error) -> Self {
        StopError::Io(e)
    }
}

/// How to launch and supervise one broker instance
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Path to the broker binary under test
    pub binary: PathBuf,
    /// Configuration fixture passed to the broker via `-c`
    pub config_fixture: PathBuf,
    /// Host the listeners bind on
    pub host: String,
    /// Ports that must accept connections before `start` returns
    pub listener_ports: Vec<u16>,
    /// Total budget for the readiness poll
    pub startup_timeout: Duration,
    /// Backoff between readiness probes
    pub poll_interval: Duration,
    /// How long to wait after SIGTERM before force-killing
    pub grace_period: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("mosquitto"),
            config_fixture: PathBuf::new(),
            host: "localhost".to_string(),
            listener_ports: Vec::new(),
            startup_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// A running broker subprocess
///
/// Holds the child handle and the ports it is expected to own. The
/// caller must invoke [`stop`](BrokerProcess::stop) on every code path
/// before the harness exits; `kill_on_drop` is set as a last resort so
/// an aborted scenario cannot leak the subprocess.
#[derive(Debug)]
pub struct BrokerProcess {
    child: Child,
    host: String,
    listener_ports: Vec<u16>,
    grace_period: Duration,
    stopped: bool,
}

/// Spawn the broker with the given configuration fixture and wait for
/// its listeners to accept connections.
pub async fn start(config: &BrokerConfig) -> Result<BrokerProcess, StartupError> {
    if !config.config_fixture.is_file() {
        return Err(StartupError::FixtureMissing(config.config_fixture.clone()));
    }

    info!(
        broker = %config.binary.display(),
        fixture = %config.config_fixture.display(),
        "starting broker"
    );

    let mut child = Command::new(&config.binary)
        .arg("-c")
        .arg(&config.config_fixture)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(StartupError::Spawn)?;

    // Drain both pipes continuously so a broker that logs more than
    // the pipe buffer before binding cannot block mid-startup.
    let captured = Arc::new(Mutex::new(Vec::new()));
    let mut drains = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        drains.push(spawn_drain(stdout, captured.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        drains.push(spawn_drain(stderr, captured.clone()));
    }

    let started = Instant::now();
    loop {
        // A broker that died during startup beats a readiness timeout
        // as a diagnostic, so check for that first.
        if let Some(status) = child.try_wait()? {
            return Err(StartupError::ExitedEarly {
                status,
                output: collect_output(drains, &captured).await,
            });
        }

        if ports_accepting(&config.host, &config.listener_ports, config.poll_interval).await {
            debug!(elapsed = ?started.elapsed(), "broker listeners ready");
            return Ok(BrokerProcess {
                child,
                host: config.host.clone(),
                listener_ports: config.listener_ports.clone(),
                grace_period: config.grace_period,
                stopped: false,
            });
        }

        if started.elapsed() >= config.startup_timeout {
            let elapsed = started.elapsed();
            let _ = child.start_kill();
            child.wait().await?;
            return Err(StartupError::ReadyTimeout {
                elapsed,
                output: collect_output(drains, &captured).await,
            });
        }

        sleep(config.poll_interval).await;
    }
}

/// Copy a child pipe into the shared capture buffer until EOF.
fn spawn_drain<R>(reader: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.lock().await.extend_from_slice(&chunk[..n]),
            }
        }
    })
}

/// Wait for the drain tasks to hit EOF, then snapshot the capture.
async fn collect_output(drains: Vec<JoinHandle<()>>, captured: &Mutex<Vec<u8>>) -> String {
    for drain in drains {
        let _ = drain.await;
    }
    String::from_utf8_lossy(&captured.lock().await)
        .trim()
        .to_string()
}

impl BrokerProcess {
    /// OS process id, if the broker is still running
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether `stop` has already completed
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Ports this broker instance holds
    pub fn listener_ports(&self) -> &[u16] {
        &self.listener_ports
    }

    /// Terminate the broker: SIGTERM, bounded grace wait, SIGKILL
    /// fallback, then wait for the listening ports to be released.
    /// Idempotent; calling `stop` on a stopped broker is a no-op.
    pub async fn stop(&mut self) -> Result<(), StopError> {
        if self.stopped {
            return Ok(());
        }

        if let Some(pid) = self.child.id() {
            // ESRCH here just means the broker already exited.
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM not delivered");
            }
        }

        match timeout(self.grace_period, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(%status, "broker exited");
            }
            Err(_) => {
                warn!(grace = ?self.grace_period, "broker ignored SIGTERM, force-killing");
                self.child.start_kill()?;
                self.child.wait().await?;
            }
        }

        self.wait_ports_released().await;
        self.stopped = true;
        info!("broker stopped");
        Ok(())
    }

    /// Wait (bounded) until no listener port accepts connections, so
    /// the next scenario cannot race a lingering socket.
    async fn wait_ports_released(&self) {
        if self.listener_ports.is_empty() {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while ports_accepting(&self.host, &self.listener_ports, Duration::from_millis(50)).await
        {
            if Instant::now() >= deadline {
                warn!(ports = ?self.listener_ports, "listener ports still accepting after stop");
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}

/// True when every port in the set accepts a TCP connection.
/// An empty set is trivially accepting.
async fn ports_accepting(host: &str, ports: &[u16], per_port_timeout: Duration) -> bool {
    for port in ports {
        match timeout(per_port_timeout, TcpStream::connect((host, *port))).await {
            Ok(Ok(_)) => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn script(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{}", body).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn fixture(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("broker.conf");
        std::fs::write(&path, "listener 1888\n").unwrap();
        path
    }

    #[tokio::test]
    async fn start_fails_when_fixture_missing() {
        let config = BrokerConfig {
            binary: PathBuf::from("/bin/true"),
            config_fixture: PathBuf::from("/nonexistent/broker.conf"),
            ..Default::default()
        };
        match start(&config).await {
            Err(StartupError::FixtureMissing(path)) => {
                assert_eq!(path, PathBuf::from("/nonexistent/broker.conf"));
            }
            other => panic!("expected FixtureMissing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn start_fails_when_binary_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            binary: PathBuf::from("/nonexistent/broker"),
            config_fixture: fixture(&dir),
            ..Default::default()
        };
        assert!(matches!(start(&config).await, Err(StartupError::Spawn(_))));
    }

    #[tokio::test]
    async fn start_reports_early_exit_with_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            binary: script(&dir, "broken-broker", "echo 'bad config' >&2\nexit 3"),
            config_fixture: fixture(&dir),
            listener_ports: vec![39999],
            startup_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        match start(&config).await {
            Err(StartupError::ExitedEarly { status, output }) => {
                assert_eq!(status.code(), Some(3));
                assert!(output.contains("bad config"), "output: {}", output);
            }
            other => panic!("expected ExitedEarly, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn start_captures_output_larger_than_the_pipe_buffer() {
        let dir = tempfile::tempdir().unwrap();
        // Writes well past the ~64 KiB pipe buffer before exiting; an
        // undrained pipe would block the broker here and surface as a
        // readiness timeout instead of the early exit.
        let body = "i=0\n\
                    while [ $i -lt 300 ]; do printf '%01024d' $i >&2; i=$((i+1)); done\n\
                    echo 'final marker' >&2\n\
                    exit 3";
        let config = BrokerConfig {
            binary: script(&dir, "chatty-broker", body),
            config_fixture: fixture(&dir),
            listener_ports: vec![39997],
            startup_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        match start(&config).await {
            Err(StartupError::ExitedEarly { status, output }) => {
                assert_eq!(status.code(), Some(3));
                assert!(output.len() > 64 * 1024, "captured {} bytes", output.len());
                assert!(output.contains("final marker"), "capture truncated");
            }
            other => panic!("expected ExitedEarly, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn consecutive_start_stop_cycles_leave_the_port_unbound() {
        let dir = tempfile::tempdir().unwrap();
        let binary = script(&dir, "cycled-broker", "sleep 30");
        let fixture = fixture(&dir);

        let mut port = 0u16;
        for cycle in 0..2 {
            // Rebinding the same port on the second cycle asserts the
            // first cycle released it.
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
                .await
                .unwrap_or_else(|e| panic!("cycle {}: port still bound: {}", cycle, e));
            port = listener.local_addr().unwrap().port();

            let config = BrokerConfig {
                binary: binary.clone(),
                config_fixture: fixture.clone(),
                host: "127.0.0.1".to_string(),
                listener_ports: vec![port],
                startup_timeout: Duration::from_secs(5),
                grace_period: Duration::from_secs(2),
                ..Default::default()
            };

            let mut broker = start(&config).await.unwrap();
            drop(listener);
            broker.stop().await.unwrap();

            let connect = TcpStream::connect(("127.0.0.1", port)).await;
            assert!(
                connect.is_err(),
                "cycle {}: port {} accepts after stop",
                cycle,
                port
            );
        }
    }

    #[tokio::test]
    async fn start_times_out_when_listener_never_binds() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            binary: script(&dir, "deaf-broker", "sleep 30"),
            config_fixture: fixture(&dir),
            listener_ports: vec![39998],
            startup_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        assert!(matches!(
            start(&config).await,
            Err(StartupError::ReadyTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn start_waits_for_listener_then_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = BrokerConfig {
            binary: script(&dir, "slow-broker", "sleep 30"),
            config_fixture: fixture(&dir),
            host: "127.0.0.1".to_string(),
            listener_ports: vec![port],
            startup_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(2),
            ..Default::default()
        };

        let mut broker = start(&config).await.unwrap();
        assert!(broker.pid().is_some());
        assert!(!broker.is_stopped());

        // Release the stand-in listener so stop can observe the port free.
        drop(listener);

        broker.stop().await.unwrap();
        assert!(broker.is_stopped());
        assert!(broker.pid().is_none());

        // Second stop is a no-op.
        broker.stop().await.unwrap();
        assert!(broker.is_stopped());
    }

    #[tokio::test]
    async fn stop_force_kills_a_broker_that_traps_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            binary: script(&dir, "stubborn-broker", "trap '' TERM\nsleep 30"),
            config_fixture: fixture(&dir),
            listener_ports: vec![],
            grace_period: Duration::from_millis(200),
            ..Default::default()
        };

        let mut broker = start(&config).await.unwrap();
        broker.stop().await.unwrap();
        assert!(broker.is_stopped());
    }
}
