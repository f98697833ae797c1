//! In-process Modbus/TCP charging station for tests and local runs.
//!
//! Answers read-holding-registers requests from a register map. Unknown
//! addresses get an "illegal data address" exception, other function codes an
//! "illegal function" exception.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::frame::{
    FUNCTION_READ_HOLDING_REGISTERS, MBAP_HEADER_LEN, MbapHeader, RequestFrame,
    encode_exception_response, encode_read_response,
};
use crate::transport::DeviceAddress;

const ILLEGAL_FUNCTION: u8 = 0x01;
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

#[derive(Debug, Default)]
struct State {
    registers: HashMap<u16, i32>,
    requests: Vec<RequestFrame>,
    connections: usize,
    drop_on: Option<u16>,
}

/// Shared view of a running simulator.
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<State>>,
    addr: SocketAddr,
}

impl SimulatorHandle {
    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::new(self.addr.ip().to_string(), self.addr.port())
    }

    /// Change a register value.
    pub async fn set(&self, address: u16, value: i32) {
        self.state.lock().await.registers.insert(address, value);
    }

    /// Close the connection instead of answering reads of `address`.
    pub async fn drop_connection_on(&self, address: u16) {
        self.state.lock().await.drop_on = Some(address);
    }

    /// Requests received so far, in arrival order.
    pub async fn requests(&self) -> Vec<RequestFrame> {
        self.state.lock().await.requests.clone()
    }

    /// Connections accepted so far.
    pub async fn connections(&self) -> usize {
        self.state.lock().await.connections
    }
}

/// A listening simulated device.
pub struct DeviceSimulator {
    listener: TcpListener,
    handle: SimulatorHandle,
}

impl DeviceSimulator {
    /// Bind on an ephemeral localhost port.
    pub async fn bind(registers: HashMap<u16, i32>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = State {
            registers,
            ..Default::default()
        };

        Ok(Self {
            listener,
            handle: SimulatorHandle {
                state: Arc::new(Mutex::new(state)),
                addr,
            },
        })
    }

    pub fn handle(&self) -> SimulatorHandle {
        self.handle.clone()
    }

    /// Serve connections in the background.
    pub fn spawn(self) -> (SimulatorHandle, JoinHandle<()>) {
        let handle = self.handle.clone();
        let task = tokio::spawn(self.serve());
        (handle, task)
    }

    async fn serve(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Simulator accept failed");
                    continue;
                }
            };

            debug!(%peer, "Simulator accepted connection");
            self.handle.state.lock().await.connections += 1;

            let state = self.handle.state.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, state).await {
                    debug!(%peer, error = %e, "Simulator connection ended");
                }
            });
        }
    }
}

async fn serve_connection(mut stream: TcpStream, state: Arc<Mutex<State>>) -> io::Result<()> {
    loop {
        let mut header = [0u8; MBAP_HEADER_LEN];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }

        let mbap = MbapHeader::parse(&header)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut frame = header.to_vec();
        frame.resize(MBAP_HEADER_LEN + mbap.pdu_len(), 0);
        stream.read_exact(&mut frame[MBAP_HEADER_LEN..]).await?;

        let request = RequestFrame::parse(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let response = {
            let mut state = state.lock().await;
            state.requests.push(request);

            if state.drop_on == Some(request.address) {
                return Ok(());
            }

            let tx = request.header.transaction_id;
            let unit = request.header.unit_id;

            if request.function != FUNCTION_READ_HOLDING_REGISTERS {
                encode_exception_response(tx, unit, request.function, ILLEGAL_FUNCTION)
            } else {
                match state.registers.get(&request.address) {
                    Some(value) => encode_read_response(tx, unit, *value),
                    None => encode_exception_response(
                        tx,
                        unit,
                        request.function,
                        ILLEGAL_DATA_ADDRESS,
                    ),
                }
            }
        };

        stream.write_all(&response).await?;
    }
}
