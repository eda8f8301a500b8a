//! Device sessions through the jump host.
//!
//! This module owns every SSH concern: the shared jump-host transport, the
//! per-device interactive shells proxied through it, the bounded session pool
//! and the reconnect policy.
//!
//! # Main Components
//!
//! - [`ConnectionManager`] - Session pool with acquire/release and retry
//! - [`SshConnector`] - Opens device shells through a [`JumpHost`]
//! - [`SshShell`] - One interactive shell with prompt tracking
//! - [`SessionRecorder`] / [`ReplayConnector`] - Transcript capture and offline replay
//!
//! The [`Connector`] and [`Shell`] traits are the seam between the pool and
//! the transport, so the pool and everything above it runs unchanged against
//! recorded sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, trace, warn};
use moka::future::Cache;
use russh::ChannelMsg;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::device::{Device, Platform};
use crate::error::{ConnectError, FailureKind};
use crate::prompt::{IGNORE_START_LINE, PromptHandler};

pub use client::{SshConnector, SshShell};
pub use jump::{JumpHost, JumpHostConfig};
pub use recording::{
    ReplayConnector, SessionEvent, SessionRecordEntry, SessionRecorder, SessionReplayer,
};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use security::{ConnectionSecurityOptions, HostKeyPolicy, SecurityLevel};

/// Output of one command on a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// False when the device printed an error line (`% Invalid input`).
    pub success: bool,
    /// Output with the echoed command and trailing prompt removed.
    pub content: String,
    /// Prompt seen after the command completed.
    pub prompt: Option<String>,
}

/// An interactive command channel to one device.
#[async_trait]
pub trait Shell: Send {
    /// Sends one command and waits for the prompt or the timeout.
    async fn execute(&mut self, command: &str, timeout: Duration)
    -> Result<ShellOutput, ConnectError>;

    fn is_connected(&self) -> bool;

    async fn close(&mut self) -> Result<(), ConnectError>;
}

/// Opens shells to devices.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a logged-in, privileged shell; no preamble has run yet.
    async fn connect(&self, device: &Device) -> Result<Box<dyn Shell>, ConnectError>;
}

/// A ready-to-use shell on one device, owned by at most one task at a time.
///
/// Holds one slot of the pool bound for as long as it lives, pooled or not.
pub struct Session {
    device_id: String,
    platform: Platform,
    shell: Box<dyn Shell>,
    created_at: Instant,
    last_used: Instant,
    healthy: bool,
    connect_retries: u32,
    commands_run: usize,
    _permit: OwnedSemaphorePermit,
}

impl Session {
    fn new(
        device: &Device,
        shell: Box<dyn Shell>,
        connect_retries: u32,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let now = Instant::now();
        Self {
            device_id: device.id.clone(),
            platform: device.platform,
            shell,
            created_at: now,
            last_used: now,
            healthy: true,
            connect_retries,
            commands_run: 0,
            _permit: permit,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Transport retries spent establishing this session.
    pub fn connect_retries(&self) -> u32 {
        self.connect_retries
    }

    pub fn commands_run(&self) -> usize {
        self.commands_run
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy && self.shell.is_connected()
    }

    /// Excludes the session from pooling; it is closed on release.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    async fn close(mut self) {
        if let Err(e) = self.shell.close().await {
            debug!("Error closing session {}: {}", self.device_id, e);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device_id", &self.device_id)
            .field("platform", &self.platform)
            .field("healthy", &self.healthy)
            .field("connect_retries", &self.connect_retries)
            .field("commands_run", &self.commands_run)
            .finish()
    }
}

/// Idle pooled session. Taken out exactly once, by acquire or eviction.
struct IdleSlot(std::sync::Mutex<Option<Session>>);

impl IdleSlot {
    fn new(session: Session) -> Self {
        Self(std::sync::Mutex::new(Some(session)))
    }

    fn take(&self) -> Option<Session> {
        match self.0.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Bounded pool of device sessions.
///
/// Idle sessions are cached per device id and evicted after the idle timeout.
/// A semaphore caps open sessions, idle ones included, at the configured
/// concurrency.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    idle: Cache<String, Arc<IdleSlot>>,
    permits: Arc<Semaphore>,
    released: Notify,
    capacity: usize,
    retry: RetryPolicy,
    connect_timeout: Duration,
    preamble_timeout: Duration,
    /// Devices that failed terminally this run, never attempted again.
    failed: std::sync::Mutex<HashMap<String, (FailureKind, String)>>,
    /// Per-device first-contact locks; the flag is set once a session opened.
    contact_gates: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<bool>>>>,
    recorder: Option<SessionRecorder>,
}

mod client;
mod jump;
mod manager;
mod recording;
mod retry;
mod security;
