//! Telnet link against a fake terminal server on a loopback socket.

use pmac_remote::channel::CommandChannel;
use pmac_remote::config::{ConnectionConfig, TransportKind};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const IAC: u8 = 255;
const DO: u8 = 253;
const WONT: u8 = 252;
const ECHO: u8 = 1;

#[derive(Default)]
struct ServerLog {
    commands: Vec<String>,
    negotiation: Vec<u8>,
}

/// Serve one client: ask it to echo, then answer each CRLF-terminated line.
/// A `None` reply leaves the command unanswered.
async fn fake_terminal_server<F>(respond: F) -> (u16, Arc<Mutex<ServerLog>>)
where
    F: Fn(&str) -> Option<Vec<u8>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log = Arc::new(Mutex::new(ServerLog::default()));
    let server_log = log.clone();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&[IAC, DO, ECHO]).await.unwrap();

        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if socket.read_exact(&mut byte).await.is_err() {
                return;
            }
            if byte[0] == IAC {
                let mut option = [0u8; 2];
                socket.read_exact(&mut option).await.unwrap();
                let mut log = server_log.lock().unwrap();
                log.negotiation.extend_from_slice(&[IAC, option[0], option[1]]);
                continue;
            }
            line.push(byte[0]);
            if line.ends_with(b"\r\n") {
                let command = String::from_utf8_lossy(&line[..line.len() - 2]).into_owned();
                line.clear();
                server_log.lock().unwrap().commands.push(command.clone());
                if let Some(reply) = respond(&command) {
                    socket.write_all(&reply).await.unwrap();
                }
            }
        }
    });

    (port, log)
}

fn config(port: u16) -> ConnectionConfig {
    ConnectionConfig::new("127.0.0.1", Some(u32::from(port)), TransportKind::Telnet)
        .with_timeout(Duration::from_millis(300))
}

#[tokio::test]
async fn test_connect_refuses_negotiation() {
    let (port, log) = fake_terminal_server(|command| match command {
        "ver" => Some(b"1.945  \r\x06".to_vec()),
        "i10" => Some(b"3713707\r\x06".to_vec()),
        _ => None,
    })
    .await;

    let channel = CommandChannel::new(config(port));
    channel.connect().await.unwrap();

    let result = channel.send_command("i10").await;
    assert!(result.success);
    assert_eq!(result.response, "3713707\r\x06");

    let log = log.lock().unwrap();
    assert_eq!(log.commands, vec!["ver", "i10"]);
    assert_eq!(log.negotiation, vec![IAC, WONT, ECHO]);
}

#[tokio::test]
async fn test_unsolicited_input_is_discarded() {
    let (port, _) = fake_terminal_server(|command| match command {
        "ver" => Some(b"1.945\r\x06stale\r\x06".to_vec()),
        "i20" => Some(b"$78400\r\x06".to_vec()),
        _ => None,
    })
    .await;

    let channel = CommandChannel::new(config(port));
    channel.connect().await.unwrap();

    let result = channel.send_command("i20").await;
    assert!(result.success);
    assert_eq!(result.response, "$78400\r\x06");
}

#[tokio::test]
async fn test_device_error_reply() {
    let (port, _) = fake_terminal_server(|command| match command {
        "ver" => Some(b"1.945\r\x06".to_vec()),
        _ => Some(b"\x07ERR003\r".to_vec()),
    })
    .await;

    let channel = CommandChannel::new(config(port));
    channel.connect().await.unwrap();

    let result = channel.send_command("bogus").await;
    assert!(result.success);
    assert_eq!(result.response, "\x07ERR003\r");
}

#[tokio::test]
async fn test_status_reply_is_one_response() {
    let (port, _) = fake_terminal_server(|command| match command {
        "ver" => Some(b"1.945\r\x06".to_vec()),
        _ => Some(b"880000\r1000\r0\r-2\r\x06".to_vec()),
    })
    .await;

    let channel = CommandChannel::new(config(port));
    channel.connect().await.unwrap();

    let result = channel.send_command("#1?PVF").await;
    assert!(result.success);
    assert_eq!(result.response, "880000\r1000\r0\r-2\r\x06");
}

#[tokio::test]
async fn test_unanswered_command_times_out() {
    let (port, _) = fake_terminal_server(|command| match command {
        "ver" => Some(b"1.945\r\x06".to_vec()),
        _ => None,
    })
    .await;

    let channel = CommandChannel::new(config(port));
    channel.connect().await.unwrap();

    let result = channel.send_command("hang").await;
    assert!(!result.success);
    assert!(result
        .response
        .contains("Timed out waiting for expected response"));
    assert!(!channel.guard().is_held());
}

#[tokio::test]
async fn test_connect_without_ver_reply_fails() {
    let (port, _) = fake_terminal_server(|_| None).await;

    let channel = CommandChannel::new(config(port));
    let err = channel.connect().await.unwrap_err();
    assert!(err
        .to_string()
        .starts_with("Error: did not get expected response from PMAC command \"ver\""));
    assert!(!channel.is_open());
}

#[tokio::test]
async fn test_missing_hostname_is_rejected() {
    let channel = CommandChannel::new(ConnectionConfig::new("", None, TransportKind::Telnet));
    let err = channel.connect().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "ERROR: Could not open telnet session. No hostname set."
    );
}
