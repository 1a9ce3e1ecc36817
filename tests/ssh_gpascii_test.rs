//! Power PMAC gpascii link driven through a fake shell channel.

use pmac_remote::channel::CommandChannel;
use pmac_remote::config::{ConnectionConfig, TransportKind};
use pmac_remote::model::ControllerFamily;
use pmac_remote::transport::ssh::{ShellChannel, SshGpasciiTransport};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Echoes each command line and answers it in gpascii's reply format.
struct FakeGpascii {
    replies: HashMap<&'static str, &'static str>,
    line: Vec<u8>,
    output: VecDeque<u8>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl FakeGpascii {
    fn new(replies: &[(&'static str, &'static str)]) -> (Self, Arc<Mutex<Vec<String>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let shell = Self {
            replies: replies.iter().copied().collect(),
            line: Vec::new(),
            output: VecDeque::new(),
            sent: sent.clone(),
        };
        (shell, sent)
    }
}

impl ShellChannel for FakeGpascii {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(data);
        while let Some(end) = self.line.windows(2).position(|w| w == b"\r\n") {
            let command = String::from_utf8_lossy(&self.line[..end]).into_owned();
            self.line.drain(..end + 2);
            self.sent.lock().unwrap().push(command.clone());

            let mut reply = format!("{command}\r\n");
            if let Some(value) = self.replies.get(command.as_str()) {
                reply.push_str(value);
                reply.push_str("\r\n");
            }
            reply.push_str("\x06\r\n\x06\r\n");
            self.output.extend(reply.bytes());
        }
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.output.len());
        for (slot, byte) in buf.iter_mut().zip(self.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

fn gpascii_channel(shell: FakeGpascii) -> CommandChannel {
    let config = ConnectionConfig::new("ppmac", None, TransportKind::Ssh);
    let transport = SshGpasciiTransport::with_shell(Box::new(shell), Duration::from_millis(500));
    CommandChannel::with_transport(config, Box::new(transport))
}

#[tokio::test]
async fn test_power_pmac_identity_and_axes() {
    let (shell, sent) = FakeGpascii::new(&[("cid", "604020"), ("Sys.MaxMotors", "9")]);
    let channel = gpascii_channel(shell);
    assert_eq!(channel.family(), ControllerFamily::PowerPmac);

    assert_eq!(channel.model_code().await.unwrap(), 604020);
    assert_eq!(channel.model_name().await.unwrap(), "Power PMAC UMAC");
    assert!(!channel.is_geobrick().await.unwrap());
    assert_eq!(channel.number_of_axes().await.unwrap(), 8);

    assert_eq!(*sent.lock().unwrap(), vec!["cid", "Sys.MaxMotors"]);
}

#[tokio::test]
async fn test_command_reply_is_cleaned() {
    let (shell, _) = FakeGpascii::new(&[("Motor[1].ActPos", "1250.5")]);
    let channel = gpascii_channel(shell);

    let result = channel.send_command("Motor[1].ActPos").await;
    assert!(result.success);
    assert_eq!(result.response, "\r1250.5\r");
}

#[tokio::test]
async fn test_shell_without_session_cannot_transfer_files() {
    let (shell, _) = FakeGpascii::new(&[]);
    let channel = gpascii_channel(shell);

    assert!(channel.send_ssh_command("ls /var/ftp").await.is_err());
}

#[tokio::test]
async fn test_disconnect_closes_shell() {
    let (shell, _) = FakeGpascii::new(&[]);
    let channel = gpascii_channel(shell);
    assert!(channel.is_open());

    channel.disconnect().await;
    assert!(!channel.is_open());
    assert!(!channel.send_command("cid").await.success);
}
