//! Power PMAC link: the `gpascii` command interpreter in an SSH shell.
//!
//! libssh2 is blocking, so every shell interaction runs on the blocking pool
//! while holding the shell's mutex. The same session also serves SFTP transfers
//! and plain shell commands.
//!
//! Replies are collected until the `ACK CR LF ACK CR LF` sentinel shows up. The
//! command echo is then cut off and line endings normalised to single CRs.

use super::{exchange_timeout, latin1, Transport};
use crate::config::{ConnectionConfig, TransportKind};
use crate::error::{PmacError, PmacResult};
use crate::model::ControllerFamily;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// End-of-reply marker emitted by gpascii.
pub const SENTINEL: &[u8] = b"\x06\r\n\x06\r\n";

/// Text in the gpascii greeting that means the interpreter is ready.
pub const READY_MARKER: &str = "ASCII";

const SSH_PORT: u16 = 22;

/// Bytes requested per receive.
const RECV_CHUNK: usize = 8192;

/// Sleep between polls of a non-blocking shell.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Raw byte pipe to an interactive shell.
pub trait ShellChannel: Send {
    /// Write bytes, returning how many were sent.
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Read whatever is available without blocking. `Ok(0)` means nothing yet.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<C: ShellChannel + ?Sized> ShellChannel for Box<C> {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        (**self).send(data)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf)
    }
}

/// Strip the echoed command and normalise line endings.
///
/// `sent` is the number of bytes written for the command, CRLF included; the
/// shell echoes the command without its line ending.
pub fn clean_reply(raw: &str, sent: usize) -> String {
    let body: String = raw.chars().skip(sent.saturating_sub(2)).collect();
    body.replace("\r\n", "\r")
        .replace('\x06', "")
        .replace("\r\r\r", "\r")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// A gpascii session on top of a [`ShellChannel`].
#[derive(Debug)]
pub struct GpasciiShell<C> {
    channel: C,
}

impl<C: ShellChannel> GpasciiShell<C> {
    /// Wrap an open shell channel.
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    fn send_all(&mut self, data: &[u8]) -> PmacResult<usize> {
        let mut written = 0;
        while written < data.len() {
            match self.channel.send(&data[written..])? {
                0 => return Err(PmacError::LinkBroken("SSH channel refused data".to_string())),
                n => written += n,
            }
        }
        Ok(written)
    }

    fn recv_until<F>(&mut self, deadline: Instant, mut done: F) -> PmacResult<Vec<u8>>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let mut received = Vec::new();
        let mut chunk = vec![0u8; RECV_CHUNK];
        while !done(&received) {
            if Instant::now() >= deadline {
                return Err(PmacError::ResponseTimeout(latin1(&received)));
            }
            match self.channel.recv(&mut chunk)? {
                0 => std::thread::sleep(POLL_INTERVAL),
                n => received.extend_from_slice(&chunk[..n]),
            }
        }
        Ok(received)
    }

    /// Poll until `marker` has been received.
    pub fn wait_for(&mut self, marker: &str, timeout: Duration) -> PmacResult<String> {
        let deadline = Instant::now() + timeout;
        let received = self.recv_until(deadline, |buf| contains(buf, marker.as_bytes()))?;
        Ok(latin1(&received))
    }

    /// Launch gpascii and select the reply format.
    pub fn start_gpascii(&mut self, ready_timeout: Duration, timeout: Duration) -> PmacResult<()> {
        self.send_all(b"gpascii -2\r\n")?;
        self.wait_for(READY_MARKER, ready_timeout)?;
        self.exchange("echo 7", timeout)?;
        Ok(())
    }

    /// Read and discard whatever the shell has already produced.
    fn drain_stale(&mut self) -> PmacResult<Vec<u8>> {
        let mut discarded = Vec::new();
        let mut chunk = vec![0u8; RECV_CHUNK];
        loop {
            match self.channel.recv(&mut chunk)? {
                0 => return Ok(discarded),
                n => discarded.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Send one command and collect its cleaned-up reply.
    ///
    /// Output left over from an earlier timed-out command is discarded first.
    pub fn exchange(&mut self, command: &str, timeout: Duration) -> PmacResult<String> {
        let stale = self.drain_stale()?;
        if !stale.is_empty() {
            warn!(discarded = %latin1(&stale).escape_debug(), "discarding unsolicited input");
        }
        let sent = self.send_all(format!("{command}\r\n").as_bytes())?;
        let deadline = Instant::now() + timeout;
        let raw = self.recv_until(deadline, |buf| contains(buf, SENTINEL))?;
        Ok(clean_reply(&latin1(&raw), sent))
    }
}

type SharedShell = Arc<Mutex<GpasciiShell<Box<dyn ShellChannel>>>>;

/// Controller link over SSH.
pub struct SshGpasciiTransport {
    shell: Option<SharedShell>,
    #[cfg(feature = "ssh")]
    session: Option<ssh2::Session>,
    timeout: Duration,
}

impl std::fmt::Debug for SshGpasciiTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshGpasciiTransport")
            .field("open", &self.shell.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for SshGpasciiTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SshGpasciiTransport {
    /// Create a closed link.
    pub fn new() -> Self {
        Self {
            shell: None,
            #[cfg(feature = "ssh")]
            session: None,
            timeout: Duration::from_secs(3),
        }
    }

    /// Drive an already running gpascii shell, skipping the SSH login.
    pub fn with_shell(channel: Box<dyn ShellChannel>, timeout: Duration) -> Self {
        Self {
            shell: Some(Arc::new(Mutex::new(GpasciiShell::new(channel)))),
            timeout,
            ..Self::new()
        }
    }

    async fn with_gpascii<T, F>(&self, f: F) -> PmacResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut GpasciiShell<Box<dyn ShellChannel>>) -> PmacResult<T> + Send + 'static,
    {
        let shell = self.shell.clone().ok_or(PmacError::NotConnected)?;
        tokio::task::spawn_blocking(move || {
            let mut shell = shell.blocking_lock();
            f(&mut shell)
        })
        .await?
    }

    #[cfg(feature = "ssh")]
    async fn with_session<T, F>(&self, f: F) -> PmacResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ssh2::Session) -> PmacResult<T> + Send + 'static,
    {
        let session = self.session.clone().ok_or(PmacError::NotConnected)?;
        tokio::task::spawn_blocking(move || f(&session)).await?
    }
}

#[cfg(feature = "ssh")]
mod session {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpStream, ToSocketAddrs};

    /// An ssh2 shell channel read in non-blocking mode.
    pub(super) struct Ssh2Shell {
        pub(super) session: ssh2::Session,
        pub(super) channel: ssh2::Channel,
    }

    impl ShellChannel for Ssh2Shell {
        fn send(&mut self, data: &[u8]) -> io::Result<usize> {
            self.channel.write_all(data)?;
            self.channel.flush()?;
            Ok(data.len())
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.session.set_blocking(false);
            let result = self.channel.read(buf);
            self.session.set_blocking(true);
            match result {
                Ok(0) if self.channel.eof() => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "gpascii shell closed",
                )),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                other => other,
            }
        }
    }

    /// Log in and start an interactive shell on a pseudo-terminal.
    pub(super) fn open(config: &ConnectionConfig, port: u16) -> PmacResult<Ssh2Shell> {
        let cannot_connect =
            || PmacError::Connection(format!("Cannot connect to {} {}", config.hostname, port));

        let addr = (config.hostname.as_str(), port)
            .to_socket_addrs()
            .map_err(|_| cannot_connect())?
            .next()
            .ok_or_else(cannot_connect)?;
        let tcp = TcpStream::connect_timeout(&addr, config.timeout).map_err(|_| cannot_connect())?;

        let mut session = ssh2::Session::new().map_err(|_| cannot_connect())?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(config.timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake().map_err(|_| cannot_connect())?;
        session
            .userauth_password(&config.username, &config.password)
            .map_err(|_| PmacError::Connection("Invalid username or password".to_string()))?;

        let mut channel = session.channel_session().map_err(|_| cannot_connect())?;
        channel
            .request_pty("vt100", None, None)
            .map_err(|_| cannot_connect())?;
        channel.shell().map_err(|_| cannot_connect())?;
        Ok(Ssh2Shell { session, channel })
    }

    pub(super) fn download(session: &ssh2::Session, remote: &Path, local: &Path) -> PmacResult<()> {
        let sftp = session.sftp()?;
        let mut source = sftp.open(remote)?;
        let mut target = std::fs::File::create(local)?;
        io::copy(&mut source, &mut target)?;
        Ok(())
    }

    pub(super) fn upload(session: &ssh2::Session, local: &Path, remote: &Path) -> PmacResult<()> {
        let sftp = session.sftp()?;
        let mut source = std::fs::File::open(local)?;
        let mut target = sftp.create(remote)?;
        io::copy(&mut source, &mut target)?;
        Ok(())
    }

    pub(super) fn exec(session: &ssh2::Session, command: &str) -> PmacResult<String> {
        let mut channel = session.channel_session()?;
        channel.exec(command)?;
        let mut output = String::new();
        channel.read_to_string(&mut output)?;
        channel.wait_close()?;
        Ok(output)
    }
}

#[async_trait]
impl Transport for SshGpasciiTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn family(&self) -> ControllerFamily {
        ControllerFamily::PowerPmac
    }

    fn is_open(&self) -> bool {
        self.shell.is_some()
    }

    #[cfg(feature = "ssh")]
    async fn connect(&mut self, config: &ConnectionConfig) -> PmacResult<()> {
        if self.is_open() {
            return Err(PmacError::Connection("Already connected".to_string()));
        }
        if config.hostname.is_empty() {
            return Err(PmacError::Connection("ERROR: hostname not set".to_string()));
        }
        let port = config.tcp_port().unwrap_or(SSH_PORT);
        self.timeout = config.timeout;

        let login = config.clone();
        let shell = tokio::task::spawn_blocking(move || session::open(&login, port)).await??;
        self.session = Some(shell.session.clone());
        self.shell = Some(Arc::new(Mutex::new(GpasciiShell::new(Box::new(shell)))));

        let ready_timeout = config.gpascii_ready_timeout;
        let timeout = self.timeout;
        if let Err(err) = self
            .with_gpascii(move |shell| shell.start_gpascii(ready_timeout, timeout))
            .await
        {
            debug!(error = %err, "gpascii did not start");
            self.disconnect().await;
            return Err(PmacError::Connection(format!(
                "Cannot connect to {} {}",
                config.hostname, port
            )));
        }
        info!(host = %config.hostname, port, user = %config.username, "connected to gpascii");
        Ok(())
    }

    #[cfg(not(feature = "ssh"))]
    async fn connect(&mut self, _config: &ConnectionConfig) -> PmacResult<()> {
        Err(PmacError::Unsupported(
            "SSH links (built without the `ssh` feature)".to_string(),
        ))
    }

    async fn disconnect(&mut self) {
        let was_open = self.shell.take().is_some();
        #[cfg(feature = "ssh")]
        {
            if let Some(session) = self.session.take() {
                let _ = tokio::task::spawn_blocking(move || {
                    session.disconnect(None, "closing gpascii session", None)
                })
                .await;
            }
        }
        if was_open {
            info!("gpascii session closed");
        }
    }

    async fn exchange(&mut self, command: &str, double_timeout: bool) -> PmacResult<String> {
        let window = exchange_timeout(self.timeout, double_timeout);
        let owned = command.to_string();
        let reply = self
            .with_gpascii(move |shell| shell.exchange(&owned, window))
            .await?;
        debug!(command = %command.escape_debug(), reply = %reply.escape_debug(), "gpascii exchange");
        Ok(reply)
    }

    #[cfg(feature = "ssh")]
    async fn get_file(&mut self, remote: &Path, local: &Path) -> PmacResult<()> {
        let (remote, local) = (remote.to_path_buf(), local.to_path_buf());
        self.with_session(move |session| session::download(session, &remote, &local))
            .await
    }

    #[cfg(feature = "ssh")]
    async fn put_file(&mut self, local: &Path, remote: &Path) -> PmacResult<()> {
        let (local, remote) = (local.to_path_buf(), remote.to_path_buf());
        self.with_session(move |session| session::upload(session, &local, &remote))
            .await
    }

    #[cfg(feature = "ssh")]
    async fn shell_command(&mut self, command: &str) -> PmacResult<String> {
        let command = command.to_string();
        self.with_session(move |session| session::exec(session, &command))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Shell whose output appears in batches, one batch per `send`.
    struct ScriptedShell {
        sent: Vec<u8>,
        readable: VecDeque<Vec<u8>>,
        per_send: VecDeque<Vec<Vec<u8>>>,
    }

    impl ShellChannel for ScriptedShell {
        fn send(&mut self, data: &[u8]) -> io::Result<usize> {
            self.sent.extend_from_slice(data);
            if let Some(batch) = self.per_send.pop_front() {
                self.readable.extend(batch);
            }
            Ok(data.len())
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.readable.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    fn scripted(stale: &[&[u8]], per_send: &[&[&[u8]]]) -> ScriptedShell {
        ScriptedShell {
            sent: Vec::new(),
            readable: stale.iter().map(|r| r.to_vec()).collect(),
            per_send: per_send
                .iter()
                .map(|batch| batch.iter().map(|r| r.to_vec()).collect())
                .collect(),
        }
    }

    #[test]
    fn bare_sentinel_cleans_to_two_crs() {
        assert_eq!(clean_reply("\x06\r\n\x06\r\n", 2), "\r\r");
    }

    #[test]
    fn echo_is_removed() {
        let raw = "Sys.MaxMotors\r\n5\r\n\x06\r\n\x06\r\n";
        let reply = clean_reply(raw, "Sys.MaxMotors\r\n".len());
        assert_eq!(reply, "\r5\r");
    }

    #[test]
    fn reply_split_across_reads() {
        let mut shell = GpasciiShell::new(scripted(
            &[],
            &[&[b"cid\r\n6040", b"20\r\n\x06\r\n", b"\x06\r\n"]],
        ));
        let reply = shell.exchange("cid", Duration::from_secs(1)).unwrap();
        assert_eq!(reply.trim(), "604020");
        assert_eq!(shell.channel.sent, b"cid\r\n");
    }

    #[test]
    fn missing_sentinel_times_out_with_partial_text() {
        let mut shell = GpasciiShell::new(scripted(&[], &[&[b"partial"]]));
        match shell.exchange("cid", Duration::from_millis(50)) {
            Err(PmacError::ResponseTimeout(partial)) => assert_eq!(partial, "partial"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn startup_waits_for_greeting() {
        let mut shell = GpasciiShell::new(scripted(
            &[],
            &[
                &[b"Last login\r\n", b"STDIN Open for ASCII Input\r\n"],
                &[b"echo 7\r\n\x06\r\n\x06\r\n"],
            ],
        ));
        shell
            .start_gpascii(Duration::from_secs(1), Duration::from_secs(1))
            .unwrap();
        assert_eq!(shell.channel.sent, b"gpascii -2\r\necho 7\r\n");
    }

    #[test]
    fn late_reply_is_not_taken_for_the_next_one() {
        let mut shell = GpasciiShell::new(scripted(
            &[b"cid\r\n604020\r\n\x06\r\n\x06\r\n"],
            &[&[b"Sys.MaxMotors\r\n9\r\n\x06\r\n\x06\r\n"]],
        ));
        let reply = shell
            .exchange("Sys.MaxMotors", Duration::from_secs(1))
            .unwrap();
        assert_eq!(reply, "\r9\r");
    }
}
