//! Background multi-axis status polling.
//!
//! The poller repeatedly sends one combined query (global status, coordinate
//! system status, feed rate, identity, then status/position/velocity/following
//! error for every motor) and publishes each parsed reply as a
//! [`StatusSnapshot`] on an mpsc channel. It shares the connection guard with
//! every other caller and never interrupts an exchange in flight.

use crate::channel::CommandChannel;
use crate::error::{PmacError, PmacResult};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Values reported for one motor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisStatus {
    /// Zero-based row in the reply, i.e. motor number minus one.
    pub motor_row: usize,
    /// Status word, hex digits.
    pub status: String,
    /// Actual position.
    pub position: String,
    /// Actual velocity.
    pub velocity: String,
    /// Following error.
    pub following_error: String,
}

/// One parsed status reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Global status word.
    pub global_status: String,
    /// Status word of the polled coordinate system.
    pub cs_status: String,
    /// Feed rate override of the polled coordinate system.
    pub feed_rate: String,
    /// Value of I65 (user identity).
    pub identity: String,
    /// Per-motor values in motor order.
    pub axes: Vec<AxisStatus>,
}

/// Build the combined query for coordinate system `cs` and motors `1..=num_axes`.
pub fn status_query(cs: u32, num_axes: u32) -> String {
    let mut query = format!("???&{cs}??%i65");
    for motor in 1..=num_axes {
        query.push_str(&format!("#{motor}?PVF"));
    }
    query
}

/// Split a reply to [`status_query`] into its fields.
pub fn parse_status_reply(reply: &str) -> PmacResult<StatusSnapshot> {
    let mut values: Vec<&str> = reply.split('\r').collect();
    let ack = values
        .iter()
        .position(|v| *v == "\x06")
        .ok_or_else(|| PmacError::MalformedResponse(reply.to_string()))?;
    values.remove(ack);

    if values.len() < 4 || (values.len() - 4) % 4 != 0 {
        return Err(PmacError::MalformedResponse(reply.to_string()));
    }
    let axes = values[4..]
        .chunks_exact(4)
        .enumerate()
        .map(|(motor_row, row)| AxisStatus {
            motor_row,
            status: row[0].to_string(),
            position: row[1].to_string(),
            velocity: row[2].to_string(),
            following_error: row[3].to_string(),
        })
        .collect();

    Ok(StatusSnapshot {
        global_status: values[0].to_string(),
        cs_status: values[1].to_string(),
        feed_rate: values[2].to_string(),
        identity: values[3].to_string(),
        axes,
    })
}

/// Handle to a running poll loop.
#[derive(Debug)]
pub struct StatusPoller {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl StatusPoller {
    /// Start polling on `channel` at its configured cadence.
    ///
    /// Snapshots are delivered on the returned receiver, which buffers up to
    /// `capacity` of them. Dropping the receiver ends the loop.
    pub fn start(
        channel: Arc<CommandChannel>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<StatusSnapshot>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(poll_loop(channel, tx, shutdown_rx));
        (
            Self {
                shutdown_tx: Some(shutdown_tx),
                task_handle: Some(handle),
            },
            rx,
        )
    }

    /// `true` until the loop has exited.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Ask the loop to stop and wait for it.
    ///
    /// An exchange already in flight completes first.
    pub async fn stop(mut self) -> PmacResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            handle.await?;
        }
        Ok(())
    }
}

async fn poll_loop(
    channel: Arc<CommandChannel>,
    tx: mpsc::Sender<StatusSnapshot>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let cs = channel.config().coordinate_system;
    let interval = channel.config().poll_interval;
    let num_axes = match channel.number_of_axes().await {
        Ok(n) => n,
        Err(err) => {
            warn!(error = %err, "cannot poll status without an axis count");
            return;
        }
    };
    let query = status_query(cs, num_axes);
    debug!(%query, "status polling started");

    loop {
        if !channel.is_open() {
            debug!("connection closed, status polling stopped");
            break;
        }

        let result = channel.send_command(&query).await;
        if result.success {
            match parse_status_reply(&result.response) {
                Ok(snapshot) => {
                    if tx.send(snapshot).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "unreadable status reply"),
            }
        } else {
            warn!(response = %result.response, "Error while sending update request");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = &mut shutdown_rx => {
                debug!("status polling stopped");
                break;
            }
        }
    }
}
