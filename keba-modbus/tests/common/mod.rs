//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use keba_modbus::frame::{
    FUNCTION_READ_HOLDING_REGISTERS, encode_exception_response, encode_read_response,
};
use keba_modbus::{
    Clock, CycleSummary, DeviceAddress, DeviceConfig, EngineConfig, MetricSink, PollingConfig,
    ReadRequest, Session, Transport, TransportError,
};

pub fn engine_config(host: &str) -> EngineConfig {
    EngineConfig {
        device: DeviceConfig {
            host: host.to_string(),
            ..Default::default()
        },
        polling: PollingConfig::default(),
    }
}

type SeriesKey = (String, Vec<(String, String)>);

fn series_key(name: &str, labels: &[(&str, &str)]) -> SeriesKey {
    (
        name.to_string(),
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

/// Sink that remembers the last value per series.
#[derive(Default)]
pub struct RecordingSink {
    values: Mutex<HashMap<SeriesKey, f64>>,
    cycles: Mutex<Vec<CycleSummary>>,
}

impl RecordingSink {
    pub fn get(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.values
            .lock()
            .unwrap()
            .get(&series_key(name, labels))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.values.lock().unwrap().len()
    }

    pub fn cycles(&self) -> Vec<CycleSummary> {
        self.cycles.lock().unwrap().clone()
    }
}

impl MetricSink for RecordingSink {
    fn set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.values
            .lock()
            .unwrap()
            .insert(series_key(name, labels), value);
    }

    fn cycle_completed(&self, summary: &CycleSummary) {
        self.cycles.lock().unwrap().push(*summary);
    }
}

/// Clock that records every sleep and returns immediately.
///
/// After `limit` sleeps it never wakes up again, which parks an endless
/// polling loop so the test can observe it.
#[derive(Clone)]
pub struct RecordingClock {
    sleeps: Arc<Mutex<Vec<Duration>>>,
    limit: usize,
}

impl RecordingClock {
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            sleeps: Arc::new(Mutex::new(Vec::new())),
            limit,
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        let parked = {
            let mut sleeps = self.sleeps.lock().unwrap();
            sleeps.push(duration);
            sleeps.len() >= self.limit
        };

        if parked {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Default)]
struct MockState {
    values: HashMap<u16, i32>,
    connects: usize,
    disconnects: usize,
    reads: Vec<ReadRequest>,
    /// Connects beyond this count fail.
    max_connects: Option<usize>,
    fail_read_on: Option<u16>,
    exception_on: Option<u16>,
}

/// Transport answering from an in-memory register map.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn with_values(values: &[(u16, i32)]) -> Self {
        let transport = Self::default();
        transport.state.lock().unwrap().values = values.iter().copied().collect();
        transport
    }

    pub fn fail_connects_after(&self, count: usize) {
        self.state.lock().unwrap().max_connects = Some(count);
    }

    pub fn fail_read_on(&self, address: u16) {
        self.state.lock().unwrap().fail_read_on = Some(address);
    }

    pub fn exception_on(&self, address: u16) {
        self.state.lock().unwrap().exception_on = Some(address);
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    pub fn reads(&self) -> Vec<ReadRequest> {
        self.state.lock().unwrap().reads.clone()
    }
}

pub struct MockSession {
    state: Arc<Mutex<MockState>>,
}

impl Transport for MockTransport {
    type Session = MockSession;

    async fn connect(&self, _address: &DeviceAddress) -> Result<MockSession, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;

        if state.max_connects.is_some_and(|max| state.connects > max) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        Ok(MockSession {
            state: self.state.clone(),
        })
    }
}

impl Session for MockSession {
    async fn read(&mut self, request: &ReadRequest) -> Result<Bytes, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.reads.push(*request);

        if state.fail_read_on == Some(request.address) {
            return Err(TransportError::ResponseTimeout(request.timeout));
        }

        if state.exception_on == Some(request.address) {
            return Ok(encode_exception_response(
                request.transaction_id,
                request.unit_id,
                FUNCTION_READ_HOLDING_REGISTERS,
                0x02,
            ));
        }

        let value = state.values.get(&request.address).copied().unwrap_or(0);
        Ok(encode_read_response(
            request.transaction_id,
            request.unit_id,
            value,
        ))
    }

    async fn disconnect(self) -> Result<(), TransportError> {
        self.state.lock().unwrap().disconnects += 1;
        Ok(())
    }
}
