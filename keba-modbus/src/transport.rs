//! Device transport: connect, read one register frame, disconnect.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::frame::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MbapHeader, ReadRequest};

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection timeout after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Response timeout after {0:?}")]
    ResponseTimeout(Duration),

    #[error("Connection closed by device")]
    Closed,

    #[error("Invalid frame length {0}")]
    InvalidFrameLength(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network address of the charging station.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    pub host: String,
    pub port: u16,
}

impl DeviceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens sessions to a device.
pub trait Transport: Send + Sync {
    type Session: Session;

    fn connect(
        &self,
        address: &DeviceAddress,
    ) -> impl Future<Output = Result<Self::Session, TransportError>> + Send;
}

/// One open connection. Consumed by [`Session::disconnect`].
pub trait Session: Send {
    /// Send `request` and return the raw response frame.
    fn read(
        &mut self,
        request: &ReadRequest,
    ) -> impl Future<Output = Result<Bytes, TransportError>> + Send;

    fn disconnect(self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Modbus/TCP transport over a plain TCP socket.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Transport for TcpTransport {
    type Session = TcpSession;

    async fn connect(&self, address: &DeviceAddress) -> Result<TcpSession, TransportError> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout(self.connect_timeout))??;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%address, error = %e, "Failed to set TCP_NODELAY");
        }
        debug!(%address, "Connected to device");

        Ok(TcpSession { stream })
    }
}

/// An open Modbus/TCP connection.
#[derive(Debug)]
pub struct TcpSession {
    stream: TcpStream,
}

impl TcpSession {
    async fn read_frame(&mut self) -> Result<Bytes, TransportError> {
        let mut header = [0u8; MBAP_HEADER_LEN];
        read_exact_or_closed(&mut self.stream, &mut header).await?;

        let mbap = MbapHeader::parse(&header)
            .map_err(|_| TransportError::InvalidFrameLength(0))?;
        if mbap.length == 0 || mbap.length > MAX_MBAP_LENGTH {
            return Err(TransportError::InvalidFrameLength(mbap.length));
        }

        let mut frame = vec![0u8; MBAP_HEADER_LEN + mbap.pdu_len()];
        frame[..MBAP_HEADER_LEN].copy_from_slice(&header);
        read_exact_or_closed(&mut self.stream, &mut frame[MBAP_HEADER_LEN..]).await?;

        Ok(Bytes::from(frame))
    }
}

impl Session for TcpSession {
    async fn read(&mut self, request: &ReadRequest) -> Result<Bytes, TransportError> {
        let payload = request.encode();
        trace!(address = request.address, tx = ?payload.as_ref(), "Sending request");

        self.stream.write_all(&payload).await?;

        let frame = tokio::time::timeout(request.timeout, self.read_frame())
            .await
            .map_err(|_| TransportError::ResponseTimeout(request.timeout))??;

        trace!(address = request.address, rx = ?frame.as_ref(), "Received response");
        Ok(frame)
    }

    async fn disconnect(mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

async fn read_exact_or_closed(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), TransportError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
        Err(e) => Err(TransportError::Io(e)),
    }
}
