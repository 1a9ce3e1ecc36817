//! RS-232 link.
//!
//! Commands are paced out one byte at a time and the reply is read byte by byte
//! until the controller's ACK. A read that outlives the timeout is counted,
//! logged, and fails with whatever arrived so far.
//!
//! The port is held as a [`DynSerial`], so tests can drive the transport with
//! `tokio::io::duplex` instead of hardware.

use super::response::{classify, ResponseKind};
use super::{exchange_timeout, latin1, Transport, ACK};
use crate::config::{ConnectionConfig, TransportKind};
use crate::error::{PmacError, PmacResult};
use crate::error_codes;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Trait alias for async serial port I/O.
///
/// Satisfied by `tokio_serial::SerialStream` and by `tokio::io::DuplexStream`.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// How long the pre-command drain waits for stale bytes.
const DRAIN_WINDOW: Duration = Duration::from_millis(20);

/// Read and discard input that is already waiting.
///
/// Returns the discarded bytes so the caller can log them.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> Vec<u8> {
    let mut discard = [0u8; 256];
    let mut discarded = Vec::new();
    let deadline = Instant::now() + window;

    loop {
        match tokio::time::timeout_at(deadline, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => discarded.extend_from_slice(&discard[..n]),
            Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => continue,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    discarded
}

/// Controller link over a serial line.
pub struct SerialTransport {
    port: Option<DynSerial>,
    timeout: Duration,
    n_timeouts: u64,
    last_received_packet: String,
    last_comm_time: Duration,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("open", &self.port.is_some())
            .field("timeout", &self.timeout)
            .field("n_timeouts", &self.n_timeouts)
            .finish()
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialTransport {
    /// Create a closed link.
    pub fn new() -> Self {
        Self {
            port: None,
            timeout: Duration::from_secs(3),
            n_timeouts: 0,
            last_received_packet: String::new(),
            last_comm_time: Duration::ZERO,
        }
    }

    /// Wrap an already open port, skipping the open and the handshake.
    pub fn with_port(port: DynSerial, timeout: Duration) -> Self {
        Self {
            port: Some(port),
            timeout,
            ..Self::new()
        }
    }

    /// Exchanges that ended without an ACK since the last connect.
    pub fn n_timeouts(&self) -> u64 {
        self.n_timeouts
    }

    /// Text of the most recent reply, complete or not.
    pub fn last_received_packet(&self) -> &str {
        &self.last_received_packet
    }

    /// Time the most recent read took.
    pub fn last_comm_time(&self) -> Duration {
        self.last_comm_time
    }

    fn reset_counters(&mut self) {
        self.n_timeouts = 0;
        self.last_received_packet.clear();
        self.last_comm_time = Duration::ZERO;
    }
}

/// Open the device 8N1 with RTS/CTS flow control.
#[cfg(feature = "serial")]
async fn open_port(path: &str, baud_rate: u32) -> PmacResult<DynSerial> {
    use tokio_serial::SerialPortBuilderExt;

    let path = path.to_string();
    let opened = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::Hardware)
            .open_native_async()
    })
    .await?;

    match opened {
        Ok(stream) => Ok(Box::new(stream)),
        Err(err) => {
            debug!(error = %err, "serial open failed");
            Err(PmacError::Connection("Port already in use!".to_string()))
        }
    }
}

#[cfg(not(feature = "serial"))]
async fn open_port(_path: &str, _baud_rate: u32) -> PmacResult<DynSerial> {
    Err(PmacError::Unsupported(
        "serial links (built without the `serial` feature)".to_string(),
    ))
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn connect(&mut self, config: &ConnectionConfig) -> PmacResult<()> {
        if self.is_open() {
            return Err(PmacError::Connection("Socket is already open".to_string()));
        }
        self.reset_counters();
        let baud_rate = config.port.unwrap_or(9600);
        self.timeout = config.timeout;
        self.port = Some(open_port(&config.hostname, baud_rate).await?);

        if let Err(err) = self.exchange("ver", false).await {
            self.disconnect().await;
            return Err(err);
        }
        info!(device = %config.hostname, baud_rate, "connected over serial");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut port) = self.port.take() {
            let _ = port.shutdown().await;
            info!("serial port closed");
        }
    }

    async fn exchange(&mut self, command: &str, double_timeout: bool) -> PmacResult<String> {
        let window = exchange_timeout(self.timeout, double_timeout);
        let port = self.port.as_mut().ok_or(PmacError::NotConnected)?;

        let stale = drain_serial_buffer(port, DRAIN_WINDOW).await;
        if !stale.is_empty() {
            warn!(discarded = %latin1(&stale).escape_debug(), "discarding unsolicited input");
        }

        for byte in command.bytes() {
            port.write_all(&[byte]).await?;
        }
        port.write_all(b"\r").await?;
        port.flush().await?;
        debug!(command = %command.escape_debug(), "sent");

        let started = Instant::now();
        let deadline = started + window;
        let mut received = Vec::new();
        let mut byte = [0u8; 1];
        let mut timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline, port.read(&mut byte)).await {
                Err(_) => {
                    self.n_timeouts += 1;
                    warn!(
                        n_timeouts = self.n_timeouts,
                        partial = %latin1(&received).escape_debug(),
                        "timed out waiting for ACK"
                    );
                    timed_out = true;
                    break;
                }
                Ok(Ok(0)) => return Err(PmacError::LinkBroken("serial port closed".to_string())),
                Ok(Ok(_)) => {
                    received.push(byte[0]);
                    if byte[0] == ACK {
                        break;
                    }
                }
                Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        let text = latin1(&received);
        self.last_comm_time = started.elapsed();
        self.last_received_packet.clone_from(&text);

        if let Some((ResponseKind::DeviceError, _)) = classify(&text) {
            if let Some(code) = error_codes::find_error_code(&text) {
                error!(
                    code,
                    description = error_codes::describe(code).unwrap_or("unknown error"),
                    command = %command.escape_debug(),
                    "controller reported an error"
                );
            }
        }
        if timed_out {
            return Err(PmacError::ResponseTimeout(text));
        }
        debug!(reply = %text.escape_debug(), "received");
        Ok(text)
    }
}
