//! Prometheus exporter for KEBA KeContact charging stations.
//!
//! The exporter polls the station's Modbus/TCP holding registers with
//! [`keba_modbus::PollingEngine`] and exposes the decoded values via an HTTP
//! `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ Charging station│────>│  GaugeRegistry  │────>│   HTTP Server   │
//! │  (Modbus/TCP)   │     │    (gauges)     │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! wallboxName=192.168.1.50 keba-exporter-prometheus
//! keba-exporter-prometheus --host 192.168.1.50 --config config.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod gauges;
pub mod http;

pub use config::{CliOverrides, ConfigError, ExporterConfig};
pub use gauges::{ExporterStatus, GaugeRegistry, SharedRegistry};
pub use http::HttpServer;
