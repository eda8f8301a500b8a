use super::*;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A single recorded session event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecordEntry {
    pub ts_ms: u128,
    pub event: SessionEvent,
}

/// Supported recorded event types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionOpened {
        device: String,
        connect_retries: u32,
    },
    CommandOutput {
        device: String,
        command: String,
        success: bool,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SessionClosed {
        device: String,
        reason: String,
    },
}

impl SessionEvent {
    pub fn device(&self) -> &str {
        match self {
            SessionEvent::SessionOpened { device, .. }
            | SessionEvent::CommandOutput { device, .. }
            | SessionEvent::SessionClosed { device, .. } => device,
        }
    }
}

/// In-memory session recorder, shared by every session of a run.
#[derive(Debug, Clone, Default)]
pub struct SessionRecorder {
    entries: Arc<Mutex<Vec<SessionRecordEntry>>>,
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self, event: SessionEvent) -> Result<(), ConnectError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| ConnectError::InternalServerError(format!("record lock error: {e}")))?;
        guard.push(SessionRecordEntry {
            ts_ms: now_ms(),
            event,
        });
        Ok(())
    }

    /// Snapshot all records.
    pub fn entries(&self) -> Result<Vec<SessionRecordEntry>, ConnectError> {
        let guard = self
            .entries
            .lock()
            .map_err(|e| ConnectError::InternalServerError(format!("record lock error: {e}")))?;
        Ok(guard.clone())
    }

    /// Snapshot the records of one device, in recording order.
    pub fn entries_for(&self, device: &str) -> Result<Vec<SessionRecordEntry>, ConnectError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.event.device() == device)
            .collect())
    }

    /// Export records as JSONL.
    pub fn to_jsonl(&self) -> Result<String, ConnectError> {
        encode_jsonl(self.entries()?)
    }

    /// Export one device's records as JSONL.
    pub fn to_jsonl_for(&self, device: &str) -> Result<String, ConnectError> {
        encode_jsonl(self.entries_for(device)?)
    }

    /// Restore a recorder from JSONL lines. Blank lines are skipped.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, ConnectError> {
        let mut parsed = Vec::new();
        for line in jsonl.lines().filter(|l| !l.trim().is_empty()) {
            let entry: SessionRecordEntry = serde_json::from_str(line).map_err(|e| {
                ConnectError::InternalServerError(format!("record decode error: {e}"))
            })?;
            parsed.push(entry);
        }
        Ok(Self {
            entries: Arc::new(Mutex::new(parsed)),
        })
    }
}

fn encode_jsonl(entries: Vec<SessionRecordEntry>) -> Result<String, ConnectError> {
    let mut lines = Vec::with_capacity(entries.len());
    for entry in entries {
        let line = serde_json::to_string(&entry)
            .map_err(|e| ConnectError::InternalServerError(format!("record encode error: {e}")))?;
        lines.push(line);
    }
    Ok(lines.join("\n"))
}

#[derive(Debug, Clone)]
struct RecordedOutput {
    success: bool,
    content: String,
    failure: Option<FailureKind>,
    error: Option<String>,
}

/// Offline replayer backed by session recording data.
///
/// Outputs are served per `(device, command)` in recorded order. The last
/// recorded output of a command repeats, so a replay that opens more sessions
/// than the recording did (and so runs the preamble more often) still matches.
#[derive(Debug, Clone, Default)]
pub struct SessionReplayer {
    outputs: HashMap<(String, String), VecDeque<RecordedOutput>>,
}

impl SessionReplayer {
    pub fn from_recorder(recorder: &SessionRecorder) -> Result<Self, ConnectError> {
        let mut outputs: HashMap<(String, String), VecDeque<RecordedOutput>> = HashMap::new();
        for entry in recorder.entries()? {
            if let SessionEvent::CommandOutput {
                device,
                command,
                success,
                content,
                failure,
                error,
            } = entry.event
            {
                outputs
                    .entry((device, command))
                    .or_default()
                    .push_back(RecordedOutput {
                        success,
                        content,
                        failure,
                        error,
                    });
            }
        }
        Ok(Self { outputs })
    }

    pub fn from_jsonl(jsonl: &str) -> Result<Self, ConnectError> {
        Self::from_recorder(&SessionRecorder::from_jsonl(jsonl)?)
    }

    /// Whether anything was recorded for `device`.
    pub fn knows_device(&self, device: &str) -> bool {
        self.outputs.keys().any(|(d, _)| d == device)
    }

    /// Replay the next recorded output for `command` on `device`.
    pub fn replay_next(&mut self, device: &str, command: &str) -> Result<ShellOutput, ConnectError> {
        let key = (device.to_string(), command.to_string());
        let queue = self.outputs.get_mut(&key).ok_or_else(|| {
            ConnectError::ReplayMismatchError(format!(
                "no replayable output found for command '{command}' on {device}"
            ))
        })?;
        let recorded = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
        .ok_or_else(|| {
            ConnectError::ReplayMismatchError(format!("replay queue for '{command}' is empty"))
        })?;

        match (recorded.failure, recorded.error) {
            (Some(FailureKind::Timeout), _) => Err(ConnectError::ExecTimeout(recorded.content)),
            (Some(_), Some(error)) | (None, Some(error)) => Err(ConnectError::Transport(error)),
            (Some(kind), None) => Err(ConnectError::Transport(format!("recorded {kind:?} failure"))),
            (None, None) => Ok(ShellOutput {
                success: recorded.success,
                content: recorded.content,
                prompt: None,
            }),
        }
    }
}

/// [`Connector`] that serves recorded sessions instead of dialing devices.
#[derive(Clone)]
pub struct ReplayConnector {
    replayer: Arc<Mutex<SessionReplayer>>,
}

impl ReplayConnector {
    pub fn new(replayer: SessionReplayer) -> Self {
        Self {
            replayer: Arc::new(Mutex::new(replayer)),
        }
    }

    pub fn from_jsonl(jsonl: &str) -> Result<Self, ConnectError> {
        Ok(Self::new(SessionReplayer::from_jsonl(jsonl)?))
    }
}

#[async_trait]
impl Connector for ReplayConnector {
    async fn connect(&self, device: &Device) -> Result<Box<dyn Shell>, ConnectError> {
        let known = self
            .replayer
            .lock()
            .map_err(|e| ConnectError::InternalServerError(format!("replay lock error: {e}")))?
            .knows_device(&device.id);
        if !known {
            return Err(ConnectError::Transport(format!(
                "{}: no recorded session",
                device.id
            )));
        }
        Ok(Box::new(ReplayShell {
            device: device.id.clone(),
            replayer: self.replayer.clone(),
            open: true,
        }))
    }
}

struct ReplayShell {
    device: String,
    replayer: Arc<Mutex<SessionReplayer>>,
    open: bool,
}

#[async_trait]
impl Shell for ReplayShell {
    async fn execute(
        &mut self,
        command: &str,
        _timeout: Duration,
    ) -> Result<ShellOutput, ConnectError> {
        if !self.open {
            return Err(ConnectError::ConnectClosedError);
        }
        self.replayer
            .lock()
            .map_err(|e| ConnectError::InternalServerError(format!("replay lock error: {e}")))?
            .replay_next(&self.device, command)
    }

    fn is_connected(&self) -> bool {
        self.open
    }

    async fn close(&mut self) -> Result<(), ConnectError> {
        self.open = false;
        Ok(())
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{"ts_ms":1,"event":{"kind":"session_opened","device":"pe1","connect_retries":0}}
{"ts_ms":2,"event":{"kind":"command_output","device":"pe1","command":"terminal length 0","success":true,"content":""}}
{"ts_ms":3,"event":{"kind":"command_output","device":"pe1","command":"show bgp summary","success":true,"content":"first"}}
{"ts_ms":4,"event":{"kind":"command_output","device":"pe1","command":"show bgp summary","success":true,"content":"second"}}
{"ts_ms":5,"event":{"kind":"command_output","device":"pe1","command":"show bgp","success":false,"content":"partial","failure":"timeout","error":"exec command timeout: partial"}}
{"ts_ms":6,"event":{"kind":"session_closed","device":"pe1","reason":"shutdown"}}

"#;

    #[test]
    fn recorder_jsonl_roundtrip() {
        let recorder = SessionRecorder::new();
        recorder
            .record_event(SessionEvent::SessionOpened {
                device: "pe1".to_string(),
                connect_retries: 2,
            })
            .expect("record opened");
        recorder
            .record_event(SessionEvent::SessionClosed {
                device: "pe2".to_string(),
                reason: "shutdown".to_string(),
            })
            .expect("record closed");

        let jsonl = recorder.to_jsonl().expect("encode jsonl");
        let restored = SessionRecorder::from_jsonl(&jsonl).expect("decode jsonl");
        let entries = restored.entries().expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].event,
            SessionEvent::SessionOpened {
                device: "pe1".to_string(),
                connect_retries: 2
            }
        );

        let pe2 = restored.to_jsonl_for("pe2").expect("per device");
        assert_eq!(pe2.lines().count(), 1);
        assert!(pe2.contains("\"kind\":\"session_closed\""));
    }

    #[test]
    fn replayer_serves_outputs_in_order_and_repeats_last() {
        let mut replayer = SessionReplayer::from_jsonl(FIXTURE).expect("fixture");

        let first = replayer.replay_next("pe1", "show bgp summary").expect("first");
        let second = replayer.replay_next("pe1", "show bgp summary").expect("second");
        let again = replayer.replay_next("pe1", "show bgp summary").expect("repeat");
        assert_eq!(first.content, "first");
        assert_eq!(second.content, "second");
        assert_eq!(again.content, "second");
    }

    #[test]
    fn replayer_reproduces_recorded_timeout() {
        let mut replayer = SessionReplayer::from_jsonl(FIXTURE).expect("fixture");
        let err = replayer.replay_next("pe1", "show bgp").unwrap_err();
        assert!(matches!(err, ConnectError::ExecTimeout(ref partial) if partial == "partial"));
    }

    #[test]
    fn replay_next_returns_error_when_command_not_found() {
        let mut replayer = SessionReplayer::from_jsonl(FIXTURE).expect("fixture");
        let err = replayer.replay_next("pe1", "show clock").unwrap_err();
        assert!(matches!(err, ConnectError::ReplayMismatchError(_)));
    }

    #[test]
    fn from_jsonl_accepts_empty_input() {
        let recorder = SessionRecorder::from_jsonl("\n\n").expect("empty");
        assert!(recorder.entries().expect("entries").is_empty());
    }

    #[tokio::test]
    async fn replay_connector_refuses_unknown_device() {
        let connector = ReplayConnector::from_jsonl(FIXTURE).expect("fixture");
        let unknown = Device::new("pe9", "192.0.2.9", Some("ios-xr"));
        let err = connector.connect(&unknown).await.err().expect("unknown device");
        assert_eq!(err.failure_kind(), FailureKind::Transport);

        let known = Device::new("pe1", "192.0.2.1", Some("ios-xr"));
        let mut shell = connector.connect(&known).await.expect("recorded device");
        let output = shell
            .execute("terminal length 0", Duration::from_secs(1))
            .await
            .expect("preamble replays");
        assert!(output.success);
    }
}
