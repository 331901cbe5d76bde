//! Instrument command transports.
//!
//! Abstracts the underlying communication mechanism (serial, TCP) behind an
//! `ask`/`write` pair so drivers stay protocol-agnostic and can be exercised
//! against a scripted mock in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Trait for ASCII command/response transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a query command and return the (trimmed) response.
    async fn ask(&self, command: &str) -> Result<String>;

    /// Send a command without expecting a response.
    async fn write(&self, command: &str) -> Result<()>;
}

/// Serial-based transport.
///
/// Wraps a blocking `serialport` handle with the crate's standard
/// command/response framing.
#[cfg(feature = "instrument_serial")]
pub struct SerialTransport {
    port: std::sync::Arc<Mutex<Box<dyn serialport::SerialPort>>>,
    instrument_id: String,
    terminator: &'static str,
    response_terminator: char,
    timeout: Duration,
}

#[cfg(feature = "instrument_serial")]
impl SerialTransport {
    /// Open a serial transport with standard RS-232 SCPI framing
    /// (`\n` terminator, 1 s timeout).
    pub fn open(instrument_id: &str, path: &str, baud_rate: u32) -> Result<Self> {
        let port = super::serial::open_port(path, baud_rate)?;
        Ok(Self {
            port: std::sync::Arc::new(Mutex::new(port)),
            instrument_id: instrument_id.to_string(),
            terminator: "\n",
            response_terminator: '\n',
            timeout: Duration::from_secs(1),
        })
    }

    /// Override the command/response framing for non-standard devices.
    pub fn with_framing(mut self, terminator: &'static str, response_terminator: char) -> Self {
        self.terminator = terminator;
        self.response_terminator = response_terminator;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Transport for SerialTransport {
    async fn ask(&self, command: &str) -> Result<String> {
        super::serial::send_command_async(
            self.port.clone(),
            self.instrument_id.clone(),
            command.to_string(),
            self.terminator.to_string(),
            self.timeout,
            self.response_terminator,
        )
        .await
        .with_context(|| format!("Query '{command}' failed"))
    }

    async fn write(&self, command: &str) -> Result<()> {
        super::serial::write_command_async(
            self.port.clone(),
            self.instrument_id.clone(),
            command.to_string(),
            self.terminator.to_string(),
        )
        .await
        .with_context(|| format!("Command '{command}' failed"))
    }
}

/// Stand-in when serial support is compiled out: construction fails with a
/// pointer to the `instrument_serial` feature instead of a link error.
#[cfg(not(feature = "instrument_serial"))]
pub struct SerialTransport;

#[cfg(not(feature = "instrument_serial"))]
impl SerialTransport {
    pub fn open(_instrument_id: &str, _path: &str, _baud_rate: u32) -> Result<Self> {
        Err(crate::error::LabError::SerialFeatureDisabled.into())
    }
}

/// Line-oriented TCP transport for instruments on ethernet/terminal servers.
pub struct TcpTransport {
    stream: Mutex<BufReader<TcpStream>>,
    instrument_id: String,
    terminator: &'static str,
    timeout: Duration,
}

impl TcpTransport {
    /// Connect to `addr` (e.g. "192.168.1.50:7777").
    pub async fn connect(instrument_id: &str, addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to '{instrument_id}' at {addr}"))?;
        Ok(Self {
            stream: Mutex::new(BufReader::new(stream)),
            instrument_id: instrument_id.to_string(),
            terminator: "\r\n",
            timeout: Duration::from_secs(2),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn ask(&self, command: &str) -> Result<String> {
        let mut stream = self.stream.lock().await;
        let cmd = format!("{command}{}", self.terminator);
        log::trace!("{} <- '{}'", self.instrument_id, command);
        stream
            .get_mut()
            .write_all(cmd.as_bytes())
            .await
            .with_context(|| format!("Write to '{}' failed", self.instrument_id))?;

        let mut response = String::new();
        tokio::time::timeout(self.timeout, stream.read_line(&mut response))
            .await
            .with_context(|| format!("Read from '{}' timed out", self.instrument_id))??;
        log::trace!("{} -> '{}'", self.instrument_id, response.trim());
        Ok(response.trim().to_string())
    }

    async fn write(&self, command: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;
        let cmd = format!("{command}{}", self.terminator);
        log::trace!("{} <- '{}'", self.instrument_id, command);
        stream
            .get_mut()
            .write_all(cmd.as_bytes())
            .await
            .with_context(|| format!("Write to '{}' failed", self.instrument_id))
    }
}

/// Scripted transport for driver tests.
///
/// Queries are answered from a canned response table; every command sent is
/// recorded for later assertions.
#[derive(Default)]
pub struct MockTransport {
    responses: HashMap<String, String>,
    sent: std::sync::Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a canned response for a query.
    pub fn with_response(mut self, command: &str, response: &str) -> Self {
        self.responses
            .insert(command.to_string(), response.to_string());
        self
    }

    /// Every command written or asked so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn ask(&self, command: &str) -> Result<String> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command.to_string());
        }
        self.responses
            .get(command)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("MockTransport: no canned response for '{command}'"))
    }

    async fn write(&self, command: &str) -> Result<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_transport_answers_and_records() {
        let t = MockTransport::new().with_response("*IDN?", "Fake Instruments,Model 0,0,1.0");
        assert_eq!(t.ask("*IDN?").await.unwrap(), "Fake Instruments,Model 0,0,1.0");
        t.write("OUTP ON").await.unwrap();
        assert_eq!(t.sent(), vec!["*IDN?".to_string(), "OUTP ON".to_string()]);
    }

    #[tokio::test]
    async fn mock_transport_errors_on_unknown_query() {
        let t = MockTransport::new();
        assert!(t.ask("FREQ?").await.is_err());
    }

    #[tokio::test]
    async fn tcp_transport_round_trips_against_local_server() {
        use tokio::io::AsyncBufReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(socket);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim(), "getf 1");
            reader
                .get_mut()
                .write_all(b"frequency = 1000 Hz\r\n")
                .await
                .unwrap();
        });

        let t = TcpTransport::connect("anc", &addr.to_string()).await.unwrap();
        let response = t.ask("getf 1").await.unwrap();
        assert_eq!(response, "frequency = 1000 Hz");
    }

    #[cfg(not(feature = "instrument_serial"))]
    #[test]
    fn serial_open_reports_disabled_feature() {
        let err = SerialTransport::open("lockin", "/dev/ttyUSB0", 9600).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::LabError>(),
            Some(crate::error::LabError::SerialFeatureDisabled)
        ));
    }
}
