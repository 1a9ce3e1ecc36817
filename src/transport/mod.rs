//! Physical links to a controller.
//!
//! Every link implements [`Transport`]: open, close, and one synchronous
//! command/response exchange using its own framing and termination rules. The
//! `CommandChannel` picks one implementation per connection at construction time
//! and serialises access to it with the connection guard; transports never lock
//! anything themselves.
//!
//! - [`ethernet::EthernetTransport`]: binary GETRESPONSE/GETBUFFER frames over TCP
//! - [`telnet::TelnetTransport`]: line protocol through a terminal server
//! - [`serial::SerialTransport`]: RS-232, byte at a time
//! - [`ssh::SshGpasciiTransport`]: Power PMAC gpascii shell over SSH

use crate::config::{ConnectionConfig, TransportKind};
use crate::error::{PmacError, PmacResult};
use crate::model::ControllerFamily;
use async_trait::async_trait;
use std::path::Path;

pub mod ethernet;
pub mod response;
pub mod serial;
pub mod ssh;
pub mod telnet;

pub use ethernet::EthernetTransport;
pub use serial::SerialTransport;
pub use ssh::SshGpasciiTransport;
pub use telnet::TelnetTransport;

/// Positive acknowledge, ends every complete reply.
pub const ACK: u8 = 0x06;
/// Carriage return, ends each reply line.
pub const CR: u8 = 0x0D;
/// NUL, sent by some firmware while flushing to flash.
pub const NUL: u8 = 0x00;
/// Bell, prefixes `ERRnnn` replies.
pub const BELL: u8 = 0x07;

/// A physical link to one controller.
#[async_trait]
pub trait Transport: Send {
    /// Link type.
    fn kind(&self) -> TransportKind;

    /// Command dialect spoken over this link.
    fn family(&self) -> ControllerFamily {
        ControllerFamily::Turbo
    }

    /// `true` between a successful `connect` and the next `disconnect`.
    fn is_open(&self) -> bool;

    /// Open the link and run the handshake.
    ///
    /// Failures are [`PmacError::Connection`] carrying a descriptive message, and
    /// leave the link closed.
    async fn connect(&mut self, config: &ConnectionConfig) -> PmacResult<()>;

    /// Close the link. Safe to call on a link that was never opened.
    async fn disconnect(&mut self);

    /// Write one command and block until its reply is terminated.
    ///
    /// `double_timeout` widens the read window for commands that write flash.
    async fn exchange(&mut self, command: &str, double_timeout: bool) -> PmacResult<String>;

    /// Copy a file from the controller.
    async fn get_file(&mut self, _remote: &Path, _local: &Path) -> PmacResult<()> {
        Err(PmacError::Unsupported(format!(
            "file transfer over {} links",
            self.kind()
        )))
    }

    /// Copy a file to the controller.
    async fn put_file(&mut self, _local: &Path, _remote: &Path) -> PmacResult<()> {
        Err(PmacError::Unsupported(format!(
            "file transfer over {} links",
            self.kind()
        )))
    }

    /// Run a command in the controller's operating-system shell.
    async fn shell_command(&mut self, _command: &str) -> PmacResult<String> {
        Err(PmacError::Unsupported(format!(
            "shell commands over {} links",
            self.kind()
        )))
    }
}

/// Decode controller bytes one-to-one into chars, keeping control bytes intact.
pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Pick the read window for one exchange.
pub(crate) fn exchange_timeout(
    base: std::time::Duration,
    double_timeout: bool,
) -> std::time::Duration {
    if double_timeout {
        base * 2
    } else {
        base
    }
}

/// Build the transport for a link type.
pub fn transport_for(kind: TransportKind) -> Box<dyn Transport> {
    match kind {
        TransportKind::Ethernet => Box::new(EthernetTransport::new()),
        TransportKind::Telnet => Box::new(TelnetTransport::new()),
        TransportKind::Serial => Box::new(SerialTransport::new()),
        TransportKind::Ssh => Box::new(SshGpasciiTransport::new()),
    }
}
