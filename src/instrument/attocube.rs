//! Attocube ANC-class piezo positioner controller driver.
//!
//! The controller exposes a telnet console: one command per line, a variable
//! number of reply lines, and a final `OK` or `ERROR` line. Example exchange:
//!
//! ```text
//! > getf 1
//! frequency = 1000 Hz
//! OK
//! ```
//!
//! The driver owns the TCP connection and frames the console protocol itself;
//! value lines are parsed with [`parse_console_value`].

use crate::instrument::Instrument;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const MAX_FREQUENCY_HZ: f64 = 10_000.0;
const MAX_AMPLITUDE_V: f64 = 150.0;

/// Positioner axes, numbered as on the controller front panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn number(self) -> u8 {
        match self {
            Axis::X => 1,
            Axis::Y => 2,
            Axis::Z => 3,
        }
    }
}

/// Driver for the positioner controller's TCP console.
pub struct Attocube {
    stream: Mutex<BufReader<TcpStream>>,
    id: String,
    timeout: Duration,
}

impl Attocube {
    /// Connect to the controller console (conventionally port 7230).
    pub async fn connect(id: &str, addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to '{id}' at {addr}"))?;
        Ok(Self {
            stream: Mutex::new(BufReader::new(stream)),
            id: id.to_string(),
            timeout: Duration::from_secs(2),
        })
    }

    /// Send one console command and collect reply lines until OK/ERROR.
    async fn console(&self, command: &str) -> Result<Vec<String>> {
        let mut stream = self.stream.lock().await;
        let cmd = format!("{command}\r\n");
        log::trace!("{} <- '{}'", self.id, command);
        stream
            .get_mut()
            .write_all(cmd.as_bytes())
            .await
            .with_context(|| format!("Write to '{}' failed", self.id))?;

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(self.timeout, stream.read_line(&mut line))
                .await
                .with_context(|| format!("Read from '{}' timed out", self.id))??;
            if n == 0 {
                return Err(anyhow!("{}: connection closed mid-reply", self.id));
            }
            let line = line.trim().to_string();
            log::trace!("{} -> '{}'", self.id, line);
            // Controllers echo the command; skip the echo line.
            if line == command {
                continue;
            }
            match line.as_str() {
                "OK" => return Ok(lines),
                "ERROR" => {
                    return Err(anyhow!(
                        "{}: command '{}' rejected: {}",
                        self.id,
                        command,
                        lines.join("; ")
                    ))
                }
                _ => lines.push(line),
            }
        }
    }

    async fn console_value(&self, command: &str) -> Result<f64> {
        let lines = self.console(command).await?;
        let line = lines
            .first()
            .ok_or_else(|| anyhow!("{}: no value line in reply to '{}'", self.id, command))?;
        parse_console_value(line)
            .ok_or_else(|| anyhow!("{}: unparseable value line '{}'", self.id, line))
    }

    /// Set the stepping frequency of one axis in Hz.
    pub async fn set_frequency(&self, axis: Axis, hz: f64) -> Result<()> {
        if !(1.0..=MAX_FREQUENCY_HZ).contains(&hz) {
            return Err(anyhow!(
                "Step frequency {hz} Hz out of range (1-{MAX_FREQUENCY_HZ})"
            ));
        }
        self.console(&format!("setf {} {}", axis.number(), hz))
            .await
            .map(|_| ())
    }

    pub async fn frequency(&self, axis: Axis) -> Result<f64> {
        self.console_value(&format!("getf {}", axis.number())).await
    }

    /// Set the stepping amplitude of one axis in volts.
    pub async fn set_amplitude(&self, axis: Axis, volts: f64) -> Result<()> {
        if !(0.0..=MAX_AMPLITUDE_V).contains(&volts) {
            return Err(crate::error::LabError::safety(
                format!("{} axis {:?} amplitude", self.id, axis),
                volts,
                MAX_AMPLITUDE_V,
            )
            .into());
        }
        self.console(&format!("setv {} {}", axis.number(), volts))
            .await
            .map(|_| ())
    }

    pub async fn amplitude(&self, axis: Axis) -> Result<f64> {
        self.console_value(&format!("getv {}", axis.number())).await
    }

    /// Step an axis: positive counts step up, negative step down.
    pub async fn step(&self, axis: Axis, steps: i32) -> Result<()> {
        if steps == 0 {
            return Ok(());
        }
        let cmd = if steps > 0 {
            format!("stepu {} {}", axis.number(), steps)
        } else {
            format!("stepd {} {}", axis.number(), -steps)
        };
        self.console(&cmd).await.map(|_| ())
    }

    /// Stop any continuous motion on an axis.
    pub async fn stop(&self, axis: Axis) -> Result<()> {
        self.console(&format!("stop {}", axis.number())).await.map(|_| ())
    }

    /// Measure the positioner capacitance in nF; the standard connectivity
    /// check after cooldown.
    pub async fn capacitance(&self, axis: Axis) -> Result<f64> {
        self.console_value(&format!("getc {}", axis.number())).await
    }

    /// Ground an axis (safe state for scanning with the other axes).
    pub async fn ground(&self, axis: Axis) -> Result<()> {
        self.console(&format!("setm {} gnd", axis.number()))
            .await
            .map(|_| ())
    }
}

/// Parse a console value line of the form `name = <value> <unit>`.
pub fn parse_console_value(line: &str) -> Option<f64> {
    let after_eq = line.split('=').nth(1)?;
    after_eq
        .split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()
}

#[async_trait]
impl Instrument for Attocube {
    fn name(&self) -> String {
        self.id.clone()
    }

    /// Ground all axes.
    async fn shutdown(&self) -> Result<()> {
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            self.ground(axis).await?;
        }
        Ok(())
    }
}
