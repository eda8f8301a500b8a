use super::*;
use super::security::HostKeyCheck;

use russh::Disconnect;
use russh::client::{self, Handle};

use crate::device::CredentialStore;
use crate::prompt::PromptLevel;
use crate::templates;

/// Interactive shell on one device, tunnelled through the jump host.
pub struct SshShell {
    device_addr: String,
    client: Handle<HostKeyCheck>,
    sender: Sender<String>,
    recv: Receiver<String>,
    handler: PromptHandler,
    prompt: String,
}

impl SshShell {
    /// Requests a PTY and shell on an authenticated device session, then
    /// waits for the first prompt.
    async fn open(
        device_addr: String,
        client: Handle<HostKeyCheck>,
        mut handler: PromptHandler,
        init_timeout: Duration,
    ) -> Result<SshShell, ConnectError> {
        let mut channel = client.channel_open_session().await?;
        channel
            .request_pty(false, "xterm", 800, 600, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        debug!("{} Shell request successful", device_addr);

        let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<String>(256);
        let (sender_to_user, mut receiver_from_shell) = mpsc::channel::<String>(256);

        let task_addr = device_addr.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(data) = receiver_from_user.recv() => {
                        if let Err(e) = channel.data(data.as_bytes()).await {
                            debug!("{} Failed to send data to shell: {:?}", task_addr, e);
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } => {
                                let s = String::from_utf8_lossy(data).into_owned();
                                trace!("{} <- {:?}", task_addr, s);
                                if sender_to_user.send(s).await.is_err() {
                                    debug!("{} Shell output receiver dropped. Closing task.", task_addr);
                                    break;
                                }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{} Shell exited with status code: {}", task_addr, exit_status);
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{} Shell sent EOF.", task_addr);
                                break;
                            }
                            _ => {}
                        }
                    }
                    else => break,
                }
            }
            debug!("{} SSH I/O task ended.", task_addr);
        });

        let mut buffer = String::new();
        let mut prompt = String::new();
        let waited = tokio::time::timeout(init_timeout, async {
            loop {
                let Some(data) = receiver_from_shell.recv().await else {
                    return Err(ConnectError::ChannelDisconnectError);
                };
                buffer.push_str(&data);
                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer.drain(..=newline_pos).collect::<String>();
                    handler.read(line.trim_end());
                }
                if buffer.is_empty() {
                    continue;
                }
                if handler.read_prompt(&buffer).is_some() {
                    handler.read(&buffer);
                    prompt.push_str(&buffer);
                    return Ok(());
                }
                if let Some((c, _)) = handler.read_need_write(&buffer) {
                    handler.read(&buffer);
                    buffer.clear();
                    sender_to_shell.send(c).await?;
                }
            }
        })
        .await;
        match waited {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ConnectError::InitTimeout(device_addr)),
        }

        Ok(Self {
            device_addr,
            client,
            sender: sender_to_shell,
            recv: receiver_from_shell,
            handler,
            prompt,
        })
    }

    /// Raises a user-mode login to privileged mode with `enable`.
    async fn escalate(&mut self, command: &str, timeout: Duration) -> Result<(), ConnectError> {
        if self.handler.level() != Some(PromptLevel::User) {
            return Ok(());
        }
        let output = self.write_with_timeout(command, timeout).await?;
        if self.handler.level() != Some(PromptLevel::Privileged) {
            return Err(ConnectError::Auth(format!(
                "{}: enable rejected: {}",
                self.device_addr,
                output.content.trim()
            )));
        }
        debug!("{} escalated to privileged mode", self.device_addr);
        Ok(())
    }

    /// Sends a command and collects output until the prompt reappears.
    async fn write_with_timeout(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<ShellOutput, ConnectError> {
        let handler = &mut self.handler;
        let recv = &mut self.recv;
        let sender = &self.sender;
        let prompt = &mut self.prompt;

        while recv.try_recv().is_ok() {}
        handler.reset_error();

        sender.send(format!("{command}\n")).await?;

        let mut clean_output = String::new();
        let mut line_buffer = String::new();
        let mut line = String::new();

        let result = tokio::time::timeout(timeout, async {
            loop {
                let Some(data) = recv.recv().await else {
                    return Err(ConnectError::ChannelDisconnectError);
                };
                line_buffer.push_str(&data);

                while let Some(newline_pos) = line_buffer.find('\n') {
                    line.clear();
                    line.extend(line_buffer.drain(..=newline_pos));
                    let trim_start = IGNORE_START_LINE.replace(&line, "");
                    handler.read(trim_start.trim_end());
                    clean_output.push_str(&trim_start);
                }

                // The prompt arrives without a trailing newline.
                if line_buffer.is_empty() {
                    continue;
                }
                if handler.read_prompt(&line_buffer).is_some() {
                    handler.read(&line_buffer);
                    *prompt = std::mem::take(&mut line_buffer);
                    return Ok(!handler.error());
                }
                if let Some((c, is_record)) = handler.read_need_write(&line_buffer) {
                    handler.read(&line_buffer);
                    if is_record {
                        clean_output.push_str(&line_buffer);
                    }
                    line_buffer.clear();
                    trace!("Input required: '{:?}'", c);
                    sender.send(c).await?;
                }
            }
        })
        .await;

        let success = match result {
            Ok(inner) => inner?,
            Err(_) => return Err(ConnectError::ExecTimeout(clean_output)),
        };

        let mut content = clean_output.as_str();
        if !command.is_empty() && content.starts_with(command) {
            content = content
                .strip_prefix(command)
                .unwrap_or(content)
                .trim_start_matches(['\n', '\r']);
        }

        Ok(ShellOutput {
            success,
            content: content.trim_end_matches(['\n', '\r']).to_string(),
            prompt: Some(self.prompt.clone()),
        })
    }
}

#[async_trait]
impl Shell for SshShell {
    async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<ShellOutput, ConnectError> {
        if !self.is_connected() {
            return Err(ConnectError::ConnectClosedError);
        }
        self.write_with_timeout(command, timeout).await
    }

    fn is_connected(&self) -> bool {
        !self.client.is_closed() && !self.sender.is_closed()
    }

    async fn close(&mut self) -> Result<(), ConnectError> {
        debug!("{} closing shell", self.device_addr);
        if self.is_connected() {
            if let Err(e) = self.sender.send("exit\n".to_string()).await {
                debug!("Failed to send exit command: {:?}", e);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.recv.close();
        if !self.client.is_closed() {
            self.client
                .disconnect(Disconnect::ByApplication, "", "en")
                .await?;
        }
        Ok(())
    }
}

/// Production [`Connector`]: SSH to each device through a shared jump host.
pub struct SshConnector {
    jump: Arc<JumpHost>,
    credentials: Arc<CredentialStore>,
    device_security: ConnectionSecurityOptions,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(jump: Arc<JumpHost>, credentials: Arc<CredentialStore>) -> Self {
        Self {
            jump,
            credentials,
            device_security: ConnectionSecurityOptions::legacy_compatible(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Algorithm and host key policy for the device hop.
    pub fn with_device_security(mut self, security: ConnectionSecurityOptions) -> Self {
        self.device_security = security;
        self
    }

    /// Budget for the device SSH handshake and first prompt.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn jump_host(&self) -> &Arc<JumpHost> {
        &self.jump
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, device: &Device) -> Result<Box<dyn Shell>, ConnectError> {
        let device_addr = format!("{}@{}:{}", device.id, device.address, device.port);
        let creds = self.credentials.for_device(device);

        let channel = self.jump.open_channel(&device.address, device.port).await?;
        debug!("{} direct-tcpip channel open", device_addr);

        let config = client::Config {
            preferred: self.device_security.preferred(),
            inactivity_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let check = HostKeyCheck {
            host: device.address.clone(),
            port: device.port,
            policy: self.device_security.host_key.clone(),
        };
        let mut client = client::connect_stream(Arc::new(config), channel.into_stream(), check)
            .await
            .map_err(|e| handshake_error(&device_addr, e))?;

        let auth = client
            .authenticate_password(creds.username.clone(), creds.password.clone())
            .await?;
        if !auth.success() {
            return Err(ConnectError::Auth(device.id.clone()));
        }
        debug!("{} authenticated as {}", device_addr, creds.username);

        let mut handler = templates::by_platform(device.platform)?;
        handler.set_enable_secret(creds.enable_secret.clone());
        let mut shell =
            SshShell::open(device_addr, client, handler, self.connect_timeout).await?;

        if creds.enable_secret.is_some()
            && let Some(enable) = templates::enable_command(device.platform)
        {
            shell.escalate(enable, self.connect_timeout).await?;
        }
        Ok(Box::new(shell))
    }
}

/// A host key refused by the policy is terminal; anything else during the
/// device handshake is a transport failure.
fn handshake_error(device_addr: &str, err: russh::Error) -> ConnectError {
    match err {
        russh::Error::UnknownKey => ConnectError::HostKeyRejected(device_addr.to_string()),
        other => ConnectError::Transport(format!("{device_addr}: {other}")),
    }
}
