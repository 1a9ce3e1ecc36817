//! Ethernet link against a fake controller speaking the GETRESPONSE/GETBUFFER
//! protocol on a loopback socket.

use pmac_remote::channel::CommandChannel;
use pmac_remote::config::{ConnectionConfig, TransportKind};
use pmac_remote::transport::ethernet::TRUNCATION_WARNING;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const VERSION_REPLY: &[u8] = b"1.945  \r\x06";

/// Serve one client. `respond` returns the chunks of the reply to a command:
/// the first is sent straight away, the rest one per GETBUFFER request.
async fn fake_controller<F>(respond: F) -> (u16, Arc<Mutex<Vec<String>>>)
where
    F: Fn(&str) -> Vec<Vec<u8>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut pending: VecDeque<Vec<u8>> = VecDeque::new();
        loop {
            let mut header = [0u8; 8];
            if socket.read_exact(&mut header).await.is_err() {
                return;
            }
            match header[1] {
                0xBF => {
                    let length = u16::from_be_bytes([header[6], header[7]]) as usize;
                    let mut command = vec![0u8; length];
                    socket.read_exact(&mut command).await.unwrap();
                    let command = String::from_utf8(command).unwrap();
                    log.lock().unwrap().push(command.clone());
                    pending = respond(&command).into();
                    if let Some(first) = pending.pop_front() {
                        socket.write_all(&first).await.unwrap();
                    }
                }
                0xC5 => {
                    assert_eq!(header, [0xC0, 0xC5, 0, 0, 0, 0, 0x08, 0x00]);
                    let chunk = pending.pop_front().unwrap_or_default();
                    socket.write_all(&chunk).await.unwrap();
                }
                other => panic!("unexpected request type {other:#x}"),
            }
        }
    });

    (port, received)
}

fn config(port: u16) -> ConnectionConfig {
    ConnectionConfig::new("127.0.0.1", Some(u32::from(port)), TransportKind::Ethernet)
        .with_timeout(Duration::from_millis(500))
}

#[tokio::test]
async fn test_connect_handshake_and_command() {
    let (port, received) = fake_controller(|command| match command {
        "i6=1 i3=2 ver" => vec![VERSION_REPLY.to_vec()],
        "i10" => vec![b"3713707\r\x06".to_vec()],
        _ => vec![b"\x06".to_vec()],
    })
    .await;

    let channel = CommandChannel::new(config(port));
    channel.connect().await.unwrap();
    assert!(channel.is_open());

    let result = channel.send_command("i10").await;
    assert!(result.success);
    assert_eq!(result.response, "3713707\r\x06");
    assert_eq!(*received.lock().unwrap(), vec!["i6=1 i3=2 ver", "i10"]);

    channel.disconnect().await;
    assert!(!channel.is_open());
}

#[tokio::test]
async fn test_wrong_version_reply_fails_connect() {
    let (port, _) = fake_controller(|_| vec![b"incorrect\r\x06".to_vec()]).await;

    let channel = CommandChannel::new(config(port));
    let err = channel.connect().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Device did not respond correctly to a \"ver\" command"
    );
    assert!(!channel.is_open());
}

#[tokio::test]
async fn test_silent_device_fails_connect() {
    let (port, _) = fake_controller(|_| Vec::new()).await;

    let channel = CommandChannel::new(config(port).with_timeout(Duration::from_millis(100)));
    let err = channel.connect().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Device failed to respond to a \"ver\" command"
    );
}

#[tokio::test]
async fn test_long_reply_is_collected_with_getbuffer() {
    let first = vec![b'A'; 1500];
    let (port, _) = fake_controller(move |command| match command {
        "list" => vec![first.clone(), b"BBB\r\x06".to_vec()],
        _ => vec![VERSION_REPLY.to_vec()],
    })
    .await;

    let channel = CommandChannel::new(config(port));
    channel.connect().await.unwrap();

    let result = channel.send_command("list").await;
    assert!(result.success);
    assert_eq!(result.response.len(), 1505);
    assert!(result.response.ends_with("ABBB\r\x06"));
    assert!(!result.response.contains(TRUNCATION_WARNING));
}

#[tokio::test]
async fn test_long_reply_without_final_cr_is_flagged() {
    let (port, _) = fake_controller(|command| match command {
        "list" => vec![vec![b'A'; 1500], b"BBB\x06".to_vec()],
        _ => vec![VERSION_REPLY.to_vec()],
    })
    .await;

    let channel = CommandChannel::new(config(port));
    channel.connect().await.unwrap();

    let result = channel.send_command("list").await;
    assert!(result.success);
    assert!(result.response.ends_with(TRUNCATION_WARNING));
}

#[tokio::test]
async fn test_save_tolerates_null_terminator() {
    let (port, _) = fake_controller(|command| match command {
        "save" => vec![vec![0x00]],
        "i10" => vec![vec![0x00]],
        _ => vec![VERSION_REPLY.to_vec()],
    })
    .await;

    let channel = CommandChannel::new(config(port));
    channel.connect().await.unwrap();

    let save = channel.send_command("save").await;
    assert!(save.success);
    assert_eq!(save.response, "");

    let other = channel.send_command("i10").await;
    assert!(!other.success);
    assert!(other.response.contains("NULL terminator"));
}

#[tokio::test]
async fn test_device_timeout_reply() {
    let (port, _) = fake_controller(|command| match command {
        "i10" => vec![b"3713707\r".to_vec()],
        _ => vec![VERSION_REPLY.to_vec()],
    })
    .await;

    let channel = CommandChannel::new(config(port));
    channel.connect().await.unwrap();

    let result = channel.send_command("i10").await;
    assert!(!result.success);
    assert_eq!(
        result.response,
        "I/O error during comm with PMAC: PMAC communication error: timeout"
    );
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let (port, _) = fake_controller(|_| vec![VERSION_REPLY.to_vec()]).await;

    let channel = CommandChannel::new(config(port));
    channel.connect().await.unwrap();
    let err = channel.connect().await.unwrap_err();
    assert_eq!(err.to_string(), "Socket is already open");
    assert!(channel.is_open());
}

#[tokio::test]
async fn test_missing_port_is_rejected() {
    let channel = CommandChannel::new(ConnectionConfig::new(
        "127.0.0.1",
        None,
        TransportKind::Ethernet,
    ));
    let err = channel.connect().await.unwrap_err();
    assert_eq!(err.to_string(), "ERROR: hostname or port number not set");
}

#[tokio::test]
async fn test_refused_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let channel = CommandChannel::new(config(port));
    let err = channel.connect().await.unwrap_err();
    assert_eq!(err.to_string(), "ERROR: connection refused by host");
}
