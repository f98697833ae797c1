//! The polling engine: connect, read every register, publish, disconnect, sleep.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{EngineConfig, FailurePolicy};
use crate::frame::{DecodeError, ReadRequest, decode_response};
use crate::registers::{RegisterSpec, RegisterTable};
use crate::sink::{CycleSummary, MetricSink, RegisterReading, publish};
use crate::transport::{DeviceAddress, Session, Transport, TransportError};

/// Register units requested per read.
pub const READ_COUNT: u16 = 1;

/// Error type for polling operations.
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Connection to {address} failed: {source}")]
    Connection {
        address: DeviceAddress,
        #[source]
        source: TransportError,
    },

    #[error("Read of register {address} ({name}) failed: {source}")]
    Read {
        address: u16,
        name: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Decode of register {address} ({name}) failed: {source}")]
    Decode {
        address: u16,
        name: &'static str,
        #[source]
        source: DecodeError,
    },
}

/// Polls one charging station and feeds a metric sink.
pub struct PollingEngine<T, S, C> {
    config: EngineConfig,
    address: DeviceAddress,
    table: RegisterTable,
    transport: T,
    sink: S,
    clock: C,
}

impl<T, S, C> PollingEngine<T, S, C>
where
    T: Transport,
    S: MetricSink,
    C: Clock,
{
    /// Create an engine. Fails on invalid configuration without touching the transport.
    pub fn new(
        config: EngineConfig,
        table: RegisterTable,
        transport: T,
        sink: S,
        clock: C,
    ) -> Result<Self, PollerError> {
        config.validate().map_err(PollerError::Config)?;
        if table.is_empty() {
            return Err(PollerError::Config("register table is empty".to_string()));
        }

        Ok(Self {
            address: config.device.address(),
            config,
            table,
            transport,
            sink,
            clock,
        })
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Poll forever. Returns only when a cycle fails under [`FailurePolicy::FailFast`].
    pub async fn run_forever(&self) -> Result<Infallible, PollerError> {
        let interval = self.config.polling.interval();

        info!(
            device = %self.address,
            registers = self.table.len(),
            interval_secs = interval.as_secs(),
            "Starting poller"
        );

        let mut backoff: Option<Duration> = None;

        loop {
            match self.poll_once().await {
                Ok(summary) => {
                    debug!(
                        device = %self.address,
                        registers = summary.registers_read,
                        duration_ms = summary.duration.as_millis() as u64,
                        "Poll cycle complete"
                    );
                    backoff = None;
                    self.clock.sleep(interval).await;
                }
                Err(e) => match self.config.polling.failure_policy {
                    FailurePolicy::FailFast => {
                        error!(device = %self.address, error = %e, "Poll cycle failed");
                        return Err(e);
                    }
                    FailurePolicy::Retry {
                        initial_backoff_secs,
                        max_backoff_secs,
                    } => {
                        let delay = next_backoff(
                            backoff,
                            Duration::from_secs(initial_backoff_secs),
                            Duration::from_secs(max_backoff_secs),
                        );
                        warn!(
                            device = %self.address,
                            error = %e,
                            retry_in_secs = delay.as_secs(),
                            "Poll cycle failed, retrying"
                        );
                        backoff = Some(delay);
                        self.clock.sleep(delay).await;
                    }
                },
            }
        }
    }

    /// Perform a single poll cycle.
    ///
    /// Values are published as they are read; a failure part way through
    /// leaves the earlier registers of this cycle published.
    pub async fn poll_once(&self) -> Result<CycleSummary, PollerError> {
        let started = Instant::now();
        let register_delay = self.config.polling.register_delay();

        let mut session = self.transport.connect(&self.address).await.map_err(|source| {
            PollerError::Connection {
                address: self.address.clone(),
                source,
            }
        })?;

        let mut count = 0;

        for spec in self.table.list() {
            let raw_value = match self.read_register(&mut session, spec).await {
                Ok(value) => value,
                Err(e) => {
                    if let Err(close_err) = session.disconnect().await {
                        debug!(error = %close_err, "Disconnect after failure");
                    }
                    return Err(e);
                }
            };

            publish(&self.sink, &RegisterReading { spec, raw_value });
            count += 1;

            self.clock.sleep(register_delay).await;
        }

        if let Err(e) = session.disconnect().await {
            warn!(device = %self.address, error = %e, "Disconnect failed");
        }

        let summary = CycleSummary {
            registers_read: count,
            duration: started.elapsed(),
        };
        self.sink.cycle_completed(&summary);

        Ok(summary)
    }

    fn request_for(&self, spec: &RegisterSpec) -> ReadRequest {
        ReadRequest {
            transaction_id: self.config.device.transaction_id,
            unit_id: self.config.device.unit_id,
            address: spec.address,
            count: READ_COUNT,
            timeout: self.config.device.response_timeout(),
        }
    }

    async fn read_register(
        &self,
        session: &mut T::Session,
        spec: &RegisterSpec,
    ) -> Result<i32, PollerError> {
        let request = self.request_for(spec);

        let frame = session
            .read(&request)
            .await
            .map_err(|source| PollerError::Read {
                address: spec.address,
                name: spec.name,
                source,
            })?;

        let value = decode_response(&frame, &request, self.config.device.validation).map_err(
            |source| PollerError::Decode {
                address: spec.address,
                name: spec.name,
                source,
            },
        )?;

        debug!(address = spec.address, name = spec.name, value, "Register read");
        Ok(value)
    }
}

/// Double the previous backoff, starting at `initial` and capped at `max`.
fn next_backoff(previous: Option<Duration>, initial: Duration, max: Duration) -> Duration {
    match previous {
        None => initial.min(max),
        Some(previous) => previous.saturating_mul(2).min(max),
    }
}
