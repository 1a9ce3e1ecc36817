//! Shared fakes for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use pmac_remote::config::{ConnectionConfig, TransportKind};
use pmac_remote::error::{PmacError, PmacResult};
use pmac_remote::model::ControllerFamily;
use pmac_remote::transport::Transport;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct ScriptInner {
    queued: VecDeque<PmacResult<String>>,
    by_command: HashMap<String, String>,
    fallback: Option<String>,
    sent: Vec<(String, bool)>,
}

/// Replies handed out by a [`ScriptedTransport`], and a log of what it was sent.
///
/// Queued replies are used first, in order; after that a reply registered for
/// the exact command text, then the fallback.
#[derive(Clone, Default)]
pub struct Script {
    inner: Arc<Mutex<ScriptInner>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, reply: &str) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .queued
            .push_back(Ok(reply.to_string()));
        self
    }

    pub fn queue_error(&self, err: PmacError) -> &Self {
        self.inner.lock().unwrap().queued.push_back(Err(err));
        self
    }

    pub fn on(&self, command: &str, reply: &str) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .by_command
            .insert(command.to_string(), reply.to_string());
        self
    }

    pub fn always(&self, reply: &str) -> &Self {
        self.inner.lock().unwrap().fallback = Some(reply.to_string());
        self
    }

    /// Commands received so far.
    pub fn sent(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|(command, _)| command.clone())
            .collect()
    }

    /// `double_timeout` flag of every exchange so far.
    pub fn double_timeouts(&self) -> Vec<bool> {
        self.inner
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|(_, double)| *double)
            .collect()
    }

    fn next_reply(&self, command: &str, double_timeout: bool) -> PmacResult<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.sent.push((command.to_string(), double_timeout));
        if let Some(reply) = inner.queued.pop_front() {
            return reply;
        }
        if let Some(reply) = inner.by_command.get(command) {
            return Ok(reply.clone());
        }
        inner
            .fallback
            .clone()
            .ok_or_else(|| PmacError::ResponseTimeout(String::new()))
    }
}

/// In-memory transport answering from a [`Script`].
pub struct ScriptedTransport {
    script: Script,
    family: ControllerFamily,
    open: bool,
}

impl ScriptedTransport {
    /// An already open Turbo PMAC link.
    pub fn turbo(script: &Script) -> Box<dyn Transport> {
        Box::new(Self {
            script: script.clone(),
            family: ControllerFamily::Turbo,
            open: true,
        })
    }

    /// An already open Power PMAC link.
    pub fn power_pmac(script: &Script) -> Box<dyn Transport> {
        Box::new(Self {
            script: script.clone(),
            family: ControllerFamily::PowerPmac,
            open: true,
        })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        match self.family {
            ControllerFamily::Turbo => TransportKind::Ethernet,
            ControllerFamily::PowerPmac => TransportKind::Ssh,
        }
    }

    fn family(&self) -> ControllerFamily {
        self.family
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn connect(&mut self, _config: &ConnectionConfig) -> PmacResult<()> {
        self.open = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.open = false;
    }

    async fn exchange(&mut self, command: &str, double_timeout: bool) -> PmacResult<String> {
        if !self.open {
            return Err(PmacError::NotConnected);
        }
        self.script.next_reply(command, double_timeout)
    }
}

/// Configuration for tests that never open a real link.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig::new("pmac-test", Some(1025), TransportKind::Ethernet)
}
