//! ConformQ - MQTT broker conformance harness
//!
//! Usage:
//!   conformq --scenario <FILE> [OPTIONS]
//!   conformq --fixture <CONF> --ca <CRT> --port <PORT> --expect <OUTCOME>
//!
//! Exit status: 0 when the observed probe outcome matches the
//! scenario's expectation, 1 for any other outcome (including broker
//! startup failure).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use conformq::broker::BrokerConfig;
use conformq::config::HarnessConfig;
use conformq::probe::OutcomeKind;
use conformq::scenario::{ConnectFixture, Scenario};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// ConformQ - MQTT broker conformance harness
#[derive(Parser, Debug)]
#[command(name = "conformq")]
#[command(author = "ConformQ Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Protocol conformance test harness for MQTT brokers")]
struct Args {
    /// Harness configuration file path (TOML format)
    #[arg(short, long, default_value = "conformq.toml")]
    config: PathBuf,

    /// Scenario definition file (TOML format)
    #[arg(short, long)]
    scenario: Option<PathBuf>,

    /// Broker configuration fixture, resolved against paths.fixtures
    /// unless absolute (overrides the scenario file)
    #[arg(long)]
    fixture: Option<PathBuf>,

    /// PEM trust anchor for the probe, resolved against paths.ssl
    /// unless absolute (overrides the scenario file)
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Host to probe
    #[arg(long)]
    host: Option<String>,

    /// TLS listener port to probe
    #[arg(short, long)]
    port: Option<u16>,

    /// Probe timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Expected probe outcome
    #[arg(short, long)]
    expect: Option<OutcomeKind>,

    /// Broker binary under test
    #[arg(long)]
    broker: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let harness_config = match HarnessConfig::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // Setup logging - CLI overrides config, config overrides default (warn)
    let log_level = args.log_level.unwrap_or_else(|| {
        match harness_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Scenario file first, CLI flags override its fields.
    let mut scenario = match &args.scenario {
        Some(path) => match Scenario::load(path) {
            Ok(scenario) => scenario,
            Err(e) => {
                eprintln!("Error loading scenario {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => {
            let (Some(fixture), Some(ca), Some(port), Some(expect)) =
                (&args.fixture, &args.ca, args.port, args.expect)
            else {
                eprintln!(
                    "Either --scenario or all of --fixture, --ca, --port, --expect are required"
                );
                std::process::exit(1);
            };
            Scenario {
                name: fixture
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "ad-hoc".to_string()),
                fixture: fixture.clone(),
                trust_anchor: ca.clone(),
                host: harness_config.broker.host.clone(),
                port,
                timeout: harness_config.probe.timeout,
                expect,
                connect: ConnectFixture::default(),
            }
        }
    };

    if let Some(fixture) = args.fixture {
        scenario.fixture = fixture;
    }
    if let Some(ca) = args.ca {
        scenario.trust_anchor = ca;
    }
    if let Some(host) = args.host {
        scenario.host = host;
    }
    if let Some(port) = args.port {
        scenario.port = port;
    }
    if let Some(timeout) = args.timeout {
        scenario.timeout = Duration::from_secs(timeout);
    }
    if let Some(expect) = args.expect {
        scenario.expect = expect;
    }
    scenario.resolve_paths(&harness_config.paths.fixtures, &harness_config.paths.ssl);

    let broker_config = BrokerConfig {
        binary: args.broker.unwrap_or(harness_config.broker.binary),
        config_fixture: scenario.fixture.clone(),
        host: harness_config.broker.host.clone(),
        listener_ports: vec![scenario.port],
        startup_timeout: harness_config.broker.startup_timeout,
        poll_interval: harness_config.broker.poll_interval,
        grace_period: harness_config.broker.grace_period,
    };

    info!(scenario = %scenario.name, "running scenario");
    let report = scenario.run(&broker_config).await;
    println!("{}", report);

    std::process::exit(report.exit_code());
}
