//! Turbo PMAC Ethernet link.
//!
//! Commands travel in GETRESPONSE frames: an 8-byte header carrying the command
//! length, then the command bytes. The controller answers with at most 1400
//! bytes per packet; longer replies are collected with GETBUFFER requests until
//! a terminator arrives.
//!
//! | Byte | GETRESPONSE | GETBUFFER |
//! |------|-------------|-----------|
//! | 0    | `0x40`      | `0xC0`    |
//! | 1    | `0xBF`      | `0xC5`    |
//! | 2..6 | `0`         | `0`       |
//! | 6..8 | length (BE) | `0x0800`  |

use super::{exchange_timeout, latin1, Transport, ACK, CR, NUL};
use crate::config::{ConnectionConfig, TransportKind};
use crate::error::{PmacError, PmacResult};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use regex::Regex;
use std::io::ErrorKind;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, info, warn};

/// Request-type byte for host-to-controller frames.
const VR_DOWNLOAD: u8 = 0x40;
/// Request-type byte for controller-to-host frames.
const VR_UPLOAD: u8 = 0xC0;
const VR_PMAC_GETRESPONSE: u8 = 0xBF;
const VR_PMAC_GETBUFFER: u8 = 0xC5;

/// Size of one receive, and of the chunk a GETBUFFER request asks for.
pub const MAX_CHUNK: usize = 2048;

/// Largest reply the controller sends in a single GETRESPONSE packet.
pub const SHORT_RESPONSE_LIMIT: usize = 1400;

/// Continuation request for the next chunk of a long reply.
pub const GETBUFFER_REQUEST: [u8; 8] = [VR_UPLOAD, VR_PMAC_GETBUFFER, 0, 0, 0, 0, 0x08, 0x00];

/// Appended to long replies whose last line lacks its CR.
pub const TRUNCATION_WARNING: &str = "\nWARNING: response may be truncated";

/// Handshake sent right after the socket opens: ACK-terminated replies, echo off.
const HANDSHAKE: &str = "i6=1 i3=2 ver";

static FIRMWARE_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+\.\d+\s*\r\x06$").expect("Invalid firmware version regex")
});

/// Frame a command as a GETRESPONSE request.
pub fn getresponse_request(command: &str) -> PmacResult<Bytes> {
    let length = u16::try_from(command.len()).map_err(|_| {
        PmacError::CommandFailed(format!(
            "command of {} bytes does not fit in one request",
            command.len()
        ))
    })?;
    let mut frame = BytesMut::with_capacity(8 + command.len());
    frame.put_slice(&[VR_DOWNLOAD, VR_PMAC_GETRESPONSE, 0, 0, 0, 0]);
    frame.put_u16(length);
    frame.put_slice(command.as_bytes());
    Ok(frame.freeze())
}

/// Validate a reply that fit in a single packet.
pub fn check_short_response(packet: &[u8]) -> PmacResult<()> {
    match packet.last() {
        None => Err(PmacError::UnexpectedTerminator),
        Some(&CR) => Err(PmacError::DeviceTimeout),
        Some(&NUL) => Err(PmacError::NullTerminator),
        Some(&ACK) => {
            if packet.len() >= 2 && packet[packet.len() - 2] != CR {
                Err(PmacError::TruncatedResponse)
            } else {
                Ok(())
            }
        }
        Some(_) => Err(PmacError::UnexpectedTerminator),
    }
}

fn needs_continuation(reply: &[u8]) -> bool {
    !matches!(reply.last(), Some(&ACK) | Some(&CR))
}

/// Controller link using the Ethernet request protocol.
#[derive(Debug)]
pub struct EthernetTransport {
    stream: Option<TcpStream>,
    timeout: Duration,
}

impl Default for EthernetTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl EthernetTransport {
    /// Create a closed link.
    pub fn new() -> Self {
        Self {
            stream: None,
            timeout: Duration::from_secs(3),
        }
    }

    async fn open(&mut self, host: &str, port: u16) -> PmacResult<()> {
        let addrs: Vec<_> = match lookup_host((host, port)).await {
            Ok(addrs) => addrs.collect(),
            Err(_) => return Err(PmacError::Connection("ERROR: unknown host".to_string())),
        };
        if addrs.is_empty() {
            return Err(PmacError::Connection("ERROR: unknown host".to_string()));
        }

        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(&addrs[..])).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(_)) | Err(_) => {
                return Err(PmacError::Connection(
                    "ERROR: connection refused by host".to_string(),
                ))
            }
        };
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn handshake(&mut self) -> PmacResult<()> {
        let reply = match self.exchange(HANDSHAKE, false).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(error = %err, "version handshake failed");
                self.disconnect().await;
                return Err(PmacError::Connection(
                    "Device failed to respond to a \"ver\" command".to_string(),
                ));
            }
        };
        if !FIRMWARE_VERSION.is_match(&reply) {
            self.disconnect().await;
            return Err(PmacError::Connection(
                "Device did not respond correctly to a \"ver\" command".to_string(),
            ));
        }
        Ok(())
    }
}

/// One socket read, retried when interrupted by a signal.
async fn recv_chunk(stream: &mut TcpStream, window: Duration) -> PmacResult<BytesMut> {
    let mut buf = BytesMut::zeroed(MAX_CHUNK);
    loop {
        match tokio::time::timeout(window, stream.read(&mut buf)).await {
            Err(_) => return Err(PmacError::ResponseTimeout(String::new())),
            Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(n)) => {
                buf.truncate(n);
                return Ok(buf);
            }
        }
    }
}

#[async_trait]
impl Transport for EthernetTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ethernet
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self, config: &ConnectionConfig) -> PmacResult<()> {
        if self.is_open() {
            return Err(PmacError::Connection("Socket is already open".to_string()));
        }
        let port = match (config.hostname.is_empty(), config.tcp_port()) {
            (false, Some(port)) => port,
            _ => {
                return Err(PmacError::Connection(
                    "ERROR: hostname or port number not set".to_string(),
                ))
            }
        };
        self.timeout = config.timeout;

        self.open(&config.hostname, port).await?;
        self.handshake().await?;
        info!(host = %config.hostname, port, "connected over ethernet");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            info!("ethernet link closed");
        }
    }

    async fn exchange(&mut self, command: &str, double_timeout: bool) -> PmacResult<String> {
        let window = exchange_timeout(self.timeout, double_timeout);
        let stream = self.stream.as_mut().ok_or(PmacError::NotConnected)?;

        stream.write_all(&getresponse_request(command)?).await?;
        debug!(command = %command.escape_debug(), "sent");

        let mut reply = recv_chunk(stream, window).await?;
        if reply.len() < SHORT_RESPONSE_LIMIT {
            check_short_response(&reply)?;
            let text = latin1(&reply);
            debug!(reply = %text.escape_debug(), "received");
            return Ok(text);
        }

        while needs_continuation(&reply) {
            stream.write_all(&GETBUFFER_REQUEST).await?;
            let chunk = recv_chunk(stream, window).await?;
            if chunk.is_empty() {
                return Err(PmacError::LinkBroken(
                    "connection closed during GETBUFFER".to_string(),
                ));
            }
            reply.extend_from_slice(&chunk);
        }
        if reply.last() == Some(&CR) {
            return Err(PmacError::DeviceTimeout);
        }

        let mut text = latin1(&reply);
        if reply.len() < 2 || reply[reply.len() - 2] != CR {
            warn!(length = reply.len(), "long reply may be truncated");
            text.push_str(TRUNCATION_WARNING);
        }
        debug!(length = reply.len(), "received long reply");
        Ok(text)
    }
}
