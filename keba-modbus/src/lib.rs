//! Modbus/TCP polling engine for KEBA KeContact charging stations.
//!
//! The engine reads a fixed map of holding registers from one charging
//! station, decodes each 32-bit value, applies the register's unit scaling and
//! hands the result to a [`MetricSink`]. It then disconnects, sleeps and starts
//! over.
//!
//! # Modules
//!
//! - [`registers`] - The register map (`RegisterTable`, `RegisterSpec`)
//! - [`frame`] - Modbus/TCP request encoding and response decoding
//! - [`transport`] - Device connections (`Transport`, `Session`, `TcpTransport`)
//! - [`sink`] - Metric sink trait and register-to-gauge dispatch
//! - [`clock`] - Injectable time source
//! - [`config`] - Engine configuration
//! - [`poller`] - The polling engine
//! - `simulator` - In-process fake charging station (feature `simulator`)

pub mod clock;
pub mod config;
pub mod frame;
pub mod poller;
pub mod registers;
#[cfg(feature = "simulator")]
pub mod simulator;
pub mod sink;
pub mod transport;

pub use clock::{Clock, TokioClock};
pub use config::{DeviceConfig, EngineConfig, FailurePolicy, PollingConfig};
pub use frame::{DecodeError, FrameValidation, ReadRequest, decode_register_value};
pub use poller::{PollerError, PollingEngine};
pub use registers::{Phase, RegisterSpec, RegisterTable};
pub use sink::{CycleSummary, MetricSink, RegisterReading, publish, publish_raw};
pub use transport::{DeviceAddress, Session, TcpTransport, Transport, TransportError};
