//! Telnet link through a terminal server.
//!
//! The terminal server forwards the controller's serial port over a Telnet
//! session. Framing and option negotiation are handled by `libtelnet-rs`, whose
//! parser refuses every option we do not enable (none), so after the first few
//! packets the stream carries nothing but controller text. Reply boundaries are
//! found with [`classify`](super::response::classify).

use super::response::{classify, ResponseKind};
use super::{exchange_timeout, latin1, Transport};
use crate::config::{ConnectionConfig, TransportKind};
use crate::error::{PmacError, PmacResult};
use crate::error_codes;
use async_trait::async_trait;
use bytes::Bytes;
use libtelnet_rs::events::TelnetEvents;
use libtelnet_rs::Parser;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const TELNET_PORT: u16 = 23;

/// Run received bytes through the Telnet parser.
///
/// Controller text is appended to `data`; the returned bytes are negotiation
/// answers that must be written back to the server.
pub fn absorb_events(parser: &mut Parser, input: &[u8], data: &mut String) -> Vec<u8> {
    let mut replies = Vec::new();
    for event in parser.receive(input) {
        match event {
            TelnetEvents::DataReceive(text) => data.push_str(&latin1(&text)),
            TelnetEvents::DataSend(answer) => replies.extend_from_slice(&answer),
            _ => {}
        }
    }
    replies
}

/// Escape a command for the wire: IAC doubled, CRLF appended.
pub fn encode_command(command: &str) -> Bytes {
    Parser::escape_iac(format!("{command}\r\n"))
}

struct TelnetSession {
    stream: TcpStream,
    parser: Parser,
    /// Decoded controller text not yet claimed by a reply.
    pending: String,
}

impl TelnetSession {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            parser: Parser::new(),
            pending: String::new(),
        }
    }

    async fn absorb(&mut self, input: &[u8]) -> PmacResult<()> {
        let replies = absorb_events(&mut self.parser, input, &mut self.pending);
        if !replies.is_empty() {
            self.stream.write_all(&replies).await?;
        }
        Ok(())
    }

    /// Collect whatever is already waiting on the socket without blocking.
    async fn drain_stale(&mut self) -> PmacResult<String> {
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    return Err(PmacError::LinkBroken(
                        "terminal server closed the session".to_string(),
                    ))
                }
                Ok(n) => self.absorb(&buf[..n]).await?,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(std::mem::take(&mut self.pending))
    }

    async fn fill(&mut self) -> PmacResult<()> {
        let mut buf = [0u8; 1024];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Err(PmacError::LinkBroken(
                "terminal server closed the session".to_string(),
            ));
        }
        self.absorb(&buf[..n]).await
    }

    /// Read until a recognised reply is buffered, leaving any excess pending.
    async fn expect_reply(&mut self, window: Duration) -> PmacResult<(ResponseKind, String)> {
        let deadline = Instant::now() + window;
        loop {
            if let Some((kind, end)) = classify(&self.pending) {
                let rest = self.pending.split_off(end);
                let reply = std::mem::replace(&mut self.pending, rest);
                return Ok((kind, reply));
            }
            match tokio::time::timeout_at(deadline, self.fill()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(PmacError::ResponseTimeout(std::mem::take(
                        &mut self.pending,
                    )))
                }
            }
        }
    }
}

/// Controller link over a Telnet session.
pub struct TelnetTransport {
    session: Option<TelnetSession>,
    timeout: Duration,
}

impl std::fmt::Debug for TelnetTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelnetTransport")
            .field("open", &self.session.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for TelnetTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetTransport {
    /// Create a closed link.
    pub fn new() -> Self {
        Self {
            session: None,
            timeout: Duration::from_secs(3),
        }
    }
}

#[async_trait]
impl Transport for TelnetTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Telnet
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    async fn connect(&mut self, config: &ConnectionConfig) -> PmacResult<()> {
        if self.is_open() {
            return Err(PmacError::Connection(
                "ERROR: telnet session is already open".to_string(),
            ));
        }
        if config.hostname.is_empty() {
            return Err(PmacError::Connection(
                "ERROR: Could not open telnet session. No hostname set.".to_string(),
            ));
        }
        let port = config.tcp_port().unwrap_or(TELNET_PORT);
        self.timeout = config.timeout;

        let addrs: Vec<_> = lookup_host((config.hostname.as_str(), port))
            .await
            .map(|addrs| addrs.collect())
            .unwrap_or_default();
        if addrs.is_empty() {
            return Err(PmacError::Connection(
                "ERROR: could not open telnet session. Unknown host or addressing problem."
                    .to_string(),
            ));
        }
        let stream = match tokio::time::timeout(config.timeout, TcpStream::connect(&addrs[..])).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(_)) | Err(_) => {
                return Err(PmacError::Connection(
                    "ERROR: could not open telnet session. Connection refused.".to_string(),
                ))
            }
        };
        self.session = Some(TelnetSession::new(stream));

        if let Err(err) = self.exchange("ver", false).await {
            debug!(error = %err, "version handshake failed");
            self.disconnect().await;
            return Err(PmacError::Connection(
                "Error: did not get expected response from PMAC command \"ver\". \
                 Someone may already be connected to the port, or the terminal server \
                 port is wrong or misconfigured."
                    .to_string(),
            ));
        }
        info!(host = %config.hostname, port, "connected over telnet");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.stream.shutdown().await;
            info!("telnet session closed");
        }
    }

    async fn exchange(&mut self, command: &str, double_timeout: bool) -> PmacResult<String> {
        let window = exchange_timeout(self.timeout, double_timeout);
        let session = self.session.as_mut().ok_or(PmacError::NotConnected)?;

        let stale = session.drain_stale().await?;
        if !stale.is_empty() {
            warn!(discarded = %stale.escape_debug(), "discarding unsolicited input");
        }

        session.stream.write_all(&encode_command(command)).await?;
        debug!(command = %command.escape_debug(), "sent");

        let (kind, reply) = session.expect_reply(window).await?;
        if kind == ResponseKind::DeviceError {
            if let Some(code) = error_codes::find_error_code(&reply) {
                error!(
                    code,
                    description = error_codes::describe(code).unwrap_or("unknown error"),
                    command = %command.escape_debug(),
                    "controller reported an error"
                );
            }
        }
        debug!(reply = %reply.escape_debug(), "received");
        Ok(reply)
    }
}
