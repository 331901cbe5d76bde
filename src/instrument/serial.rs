//! A helper module for serial port communication.
//!
//! Serial instruments here are slow ASCII devices; the blocking `serialport`
//! calls are wrapped in `tokio::task::spawn_blocking` so driver methods stay
//! async without tying up the runtime.

#![cfg(feature = "instrument_serial")]

use anyhow::{Context, Result};
use log::trace;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Open a serial port with the crate's standard settings.
pub fn open_port(path: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>> {
    serialport::new(path, baud_rate)
        .timeout(Duration::from_millis(100))
        .open()
        .with_context(|| format!("Failed to open serial port {path}"))
}

/// Sends a command to a serial port and reads the response.
///
/// The terminator is appended to the command; reading stops when the response
/// terminator appears or the timeout elapses. Returns the trimmed response.
pub fn send_command(
    port: &mut Box<dyn SerialPort>,
    instrument_id: &str,
    command: &str,
    terminator: &str,
    timeout: Duration,
    response_terminator: char,
) -> Result<String> {
    let cmd = format!("{command}{terminator}");
    trace!(
        "Sending command to {}: '{}'",
        instrument_id,
        cmd.escape_default()
    );

    port.write_all(cmd.as_bytes())
        .with_context(|| format!("Failed to send command to '{instrument_id}'"))?;

    let mut buffer = [0u8; 1024];
    let mut response = String::new();
    let start = Instant::now();

    // Read until the response terminator is found or the timeout is reached.
    while start.elapsed() < timeout {
        if let Ok(n) = port.read(&mut buffer) {
            if n > 0 {
                response.push_str(&String::from_utf8_lossy(&buffer[..n]));
                if response.contains(response_terminator) {
                    break;
                }
            }
        }
        // Avoid busy-waiting between partial reads.
        std::thread::sleep(Duration::from_millis(10));
    }

    trace!(
        "Received response from {}: '{}'",
        instrument_id,
        response.escape_default()
    );

    Ok(response.trim().to_string())
}

/// Sends a command without waiting for a response.
pub fn write_command(
    port: &mut Box<dyn SerialPort>,
    instrument_id: &str,
    command: &str,
    terminator: &str,
) -> Result<()> {
    let cmd = format!("{command}{terminator}");
    trace!(
        "Writing command to {}: '{}'",
        instrument_id,
        cmd.escape_default()
    );
    port.write_all(cmd.as_bytes())
        .with_context(|| format!("Failed to write command to '{instrument_id}'"))
}

/// Asynchronously sends a command to a serial port and reads the response.
///
/// Wraps the synchronous `send_command` in `tokio::task::spawn_blocking` to
/// avoid blocking the async runtime.
pub async fn send_command_async(
    port_mutex: Arc<Mutex<Box<dyn SerialPort>>>,
    instrument_id: String,
    command: String,
    terminator: String,
    timeout: Duration,
    response_terminator: char,
) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        let mut port = port_mutex.blocking_lock();
        send_command(
            &mut port,
            &instrument_id,
            &command,
            &terminator,
            timeout,
            response_terminator,
        )
    })
    .await
    .context("Task panicked")?
}

/// Asynchronously sends a command without waiting for a response.
pub async fn write_command_async(
    port_mutex: Arc<Mutex<Box<dyn SerialPort>>>,
    instrument_id: String,
    command: String,
    terminator: String,
) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut port = port_mutex.blocking_lock();
        write_command(&mut port, &instrument_id, &command, &terminator)
    })
    .await
    .context("Task panicked")?
}
