#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use netcollect::config::CollectorConfig;
use netcollect::device::Device;
use netcollect::error::ConnectError;
use netcollect::session::{Connector, RetryPolicy, Shell, ShellOutput};

pub const IOS_SHOW_VERSION: &str = "\
Cisco IOS Software, C3900 Software (C3900-UNIVERSALK9-M), Version 15.7(3)M5, RELEASE SOFTWARE (fc1)
r1 uptime is 2 weeks, 3 days, 1 hour, 5 minutes
System image file is \"flash0:c3900-universalk9-mz.SPA.157-3.M5.bin\"
cisco C3945 (revision 1.0) processor with 980992K/67584K bytes of memory.
Processor board ID FGL1234ABCD";

/// How a scripted device behaves.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// The first N connects fail with a transport error.
    pub transport_failures: u32,
    pub auth_failure: bool,
    pub jump_failure: bool,
    pub connect_delay: Duration,
    pub command_delay: Duration,
    /// Command -> number of executions that time out before it answers.
    pub timeouts: HashMap<String, u32>,
    /// Commands the device answers with `% Invalid input`.
    pub rejected: HashSet<String>,
    /// Command -> canned output.
    pub outputs: HashMap<String, String>,
}

impl Script {
    pub fn with_output(mut self, command: &str, output: &str) -> Self {
        self.outputs.insert(command.to_string(), output.to_string());
        self
    }

    pub fn with_timeouts(mut self, command: &str, times: u32) -> Self {
        self.timeouts.insert(command.to_string(), times);
        self
    }

    pub fn with_rejected(mut self, command: &str) -> Self {
        self.rejected.insert(command.to_string());
        self
    }
}

struct DeviceState {
    script: Script,
    connects: AtomicU32,
    timeouts_left: Mutex<HashMap<String, u32>>,
}

/// [`Connector`] driven by per-device scripts, with counters for assertions.
#[derive(Clone, Default)]
pub struct MockConnector {
    devices: Arc<Mutex<HashMap<String, Arc<DeviceState>>>>,
    default_script: Script,
    open: Arc<AtomicUsize>,
    max_open: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script applied to every device without its own.
    pub fn with_default(mut self, script: Script) -> Self {
        self.default_script = script;
        self
    }

    pub fn script(self, device_id: &str, script: Script) -> Self {
        let state = DeviceState {
            timeouts_left: Mutex::new(script.timeouts.clone()),
            script,
            connects: AtomicU32::new(0),
        };
        self.devices
            .lock()
            .expect("devices lock")
            .insert(device_id.to_string(), Arc::new(state));
        self
    }

    fn state(&self, device_id: &str) -> Arc<DeviceState> {
        let mut devices = self.devices.lock().expect("devices lock");
        devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                Arc::new(DeviceState {
                    timeouts_left: Mutex::new(self.default_script.timeouts.clone()),
                    script: self.default_script.clone(),
                    connects: AtomicU32::new(0),
                })
            })
            .clone()
    }

    pub fn connect_attempts(&self, device_id: &str) -> u32 {
        self.state(device_id).connects.load(Ordering::SeqCst)
    }

    pub fn open_shells(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// High-water mark of simultaneously open shells.
    pub fn max_open_shells(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    /// Commands executed on a device, preamble included, in order.
    pub fn commands_for(&self, device_id: &str) -> Vec<String> {
        self.log
            .lock()
            .expect("log lock")
            .iter()
            .filter(|(d, _)| d == device_id)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, device: &Device) -> Result<Box<dyn Shell>, ConnectError> {
        let state = self.state(&device.id);
        let attempt = state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if !state.script.connect_delay.is_zero() {
            tokio::time::sleep(state.script.connect_delay).await;
        }
        if state.script.jump_failure {
            return Err(ConnectError::JumpHost("bastion transport closed".to_string()));
        }
        if attempt <= state.script.transport_failures {
            return Err(ConnectError::Transport(format!(
                "{}: connection refused",
                device.id
            )));
        }
        if state.script.auth_failure {
            return Err(ConnectError::Auth(device.id.clone()));
        }

        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(MockShell {
            device_id: device.id.clone(),
            hostname: device.hostname.clone(),
            state,
            open: self.open.clone(),
            log: self.log.clone(),
            connected: true,
        }))
    }
}

struct MockShell {
    device_id: String,
    hostname: String,
    state: Arc<DeviceState>,
    open: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<(String, String)>>>,
    connected: bool,
}

#[async_trait]
impl Shell for MockShell {
    async fn execute(&mut self, command: &str, _timeout: Duration) -> Result<ShellOutput, ConnectError> {
        self.log
            .lock()
            .expect("log lock")
            .push((self.device_id.clone(), command.to_string()));
        let script = &self.state.script;
        if !script.command_delay.is_zero() {
            tokio::time::sleep(script.command_delay).await;
        }

        let timed_out = {
            let mut left = self.state.timeouts_left.lock().expect("timeouts lock");
            match left.get_mut(command) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        if timed_out {
            self.connected = false;
            return Err(ConnectError::ExecTimeout(format!("partial {command}")));
        }

        let prompt = Some(format!("{}#", self.hostname));
        if script.rejected.contains(command) {
            return Ok(ShellOutput {
                success: false,
                content: "          ^\n% Invalid input detected at '^' marker.".to_string(),
                prompt,
            });
        }
        let content = match script.outputs.get(command) {
            Some(output) => output.clone(),
            None if command == "show version" => IOS_SHOW_VERSION.to_string(),
            None => format!("{} output of {command}\nline two", self.hostname),
        };
        Ok(ShellOutput {
            success: true,
            content,
            prompt,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) -> Result<(), ConnectError> {
        self.connected = false;
        Ok(())
    }
}

impl Drop for MockShell {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Config for fast tests: millisecond backoff, output under `run_root`.
pub fn test_config(run_root: &std::path::Path, concurrency: usize) -> CollectorConfig {
    CollectorConfig {
        concurrency,
        run_root: run_root.to_path_buf(),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

pub fn fleet(n: usize) -> Vec<Device> {
    (1..=n)
        .map(|i| Device::new(format!("r{i}"), format!("192.0.2.{i}"), Some("ios")))
        .collect()
}
