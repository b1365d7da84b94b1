//! ConformQ - protocol conformance test harness for MQTT brokers
//!
//! Starts an external broker under test with a known configuration
//! fixture, probes its TLS listener, and asserts the classified
//! outcome. The reusable core is the fixture packet codec, the broker
//! process lifecycle controller, and the TLS probe; scenarios glue
//! them together and reduce to a process exit status.

pub mod broker;
pub mod codec;
pub mod config;
pub mod probe;
pub mod protocol;
pub mod scenario;

pub use broker::{BrokerConfig, BrokerProcess, StartupError};
pub use config::HarnessConfig;
pub use probe::{OutcomeKind, ProbeOutcome};
pub use protocol::{ConnAckSpec, ConnectReturnCode, ConnectSpec};
pub use scenario::{Scenario, ScenarioReport};
