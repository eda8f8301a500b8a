use super::*;
use super::security::HostKeyCheck;

use russh::client::{self, Handle};
use russh::{Channel, Disconnect};
use tokio::sync::OnceCell;

use crate::device::Credentials;

/// Bastion every device session is proxied through.
#[derive(Debug, Clone)]
pub struct JumpHostConfig {
    pub address: String,
    pub port: u16,
    pub credentials: Credentials,
    pub security: ConnectionSecurityOptions,
    /// SSH keepalive interval on the jump-host transport.
    pub keepalive_secs: u64,
    pub connect_timeout: Duration,
}

impl JumpHostConfig {
    pub fn new(address: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            address: address.into(),
            port: 22,
            credentials,
            security: ConnectionSecurityOptions::default(),
            keepalive_secs: 30,
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_security(mut self, security: ConnectionSecurityOptions) -> Self {
        self.security = security;
        self
    }
}

/// Shared jump-host transport.
///
/// Connected lazily on first use and kept for the run. Device sessions are
/// direct-tcpip channels multiplexed over this one SSH connection. There is no
/// reconnect: once the transport is gone every later channel request fails
/// with [`ConnectError::JumpHost`].
pub struct JumpHost {
    config: JumpHostConfig,
    handle: OnceCell<Handle<HostKeyCheck>>,
}

impl JumpHost {
    pub fn new(config: JumpHostConfig) -> Self {
        Self {
            config,
            handle: OnceCell::new(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.address, self.config.port)
    }

    async fn ensure(&self) -> Result<&Handle<HostKeyCheck>, ConnectError> {
        let handle = self
            .handle
            .get_or_try_init(|| async {
                tokio::time::timeout(self.config.connect_timeout, self.connect())
                    .await
                    .map_err(|_| ConnectError::JumpHost(format!("{} connect timed out", self.addr())))?
            })
            .await?;
        if handle.is_closed() {
            return Err(ConnectError::JumpHost(format!("{} transport closed", self.addr())));
        }
        Ok(handle)
    }

    async fn connect(&self) -> Result<Handle<HostKeyCheck>, ConnectError> {
        let addr = self.addr();
        let config = client::Config {
            preferred: self.config.security.preferred(),
            keepalive_interval: Some(Duration::from_secs(self.config.keepalive_secs.max(1))),
            keepalive_max: 3,
            ..Default::default()
        };
        let check = HostKeyCheck {
            host: self.config.address.clone(),
            port: self.config.port,
            policy: self.config.security.host_key.clone(),
        };

        let mut handle = client::connect(
            Arc::new(config),
            (self.config.address.as_str(), self.config.port),
            check,
        )
        .await
        .map_err(|e| ConnectError::JumpHost(format!("{addr}: {e}")))?;
        debug!("{} jump host TCP connection successful", addr);

        let auth = handle
            .authenticate_password(
                self.config.credentials.username.clone(),
                self.config.credentials.password.clone(),
            )
            .await
            .map_err(|e| ConnectError::JumpHost(format!("{addr}: {e}")))?;
        if !auth.success() {
            return Err(ConnectError::JumpHost(format!(
                "{addr}: authentication rejected for {}",
                self.config.credentials.username
            )));
        }
        debug!("{} jump host authenticated", addr);
        Ok(handle)
    }

    /// Opens a direct-tcpip channel to `host:port` as seen from the jump host.
    ///
    /// A refused or unreachable target is a device transport error; a dead
    /// jump host is fatal.
    pub(super) async fn open_channel(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Channel<client::Msg>, ConnectError> {
        let handle = self.ensure().await?;
        match handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
        {
            Ok(channel) => Ok(channel),
            Err(e) if handle.is_closed() => {
                Err(ConnectError::JumpHost(format!("{}: {e}", self.addr())))
            }
            Err(e) => Err(ConnectError::Transport(format!("{host}:{port} via jump host: {e}"))),
        }
    }

    /// Disconnects the transport if it was ever opened.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.handle.get()
            && !handle.is_closed()
            && let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "collection finished", "en")
                .await
        {
            debug!("{} jump host disconnect: {:?}", self.addr(), e);
        }
    }
}
