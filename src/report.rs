//! Run outcome model: what `run.json` and `device.json` contain.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::catalog::Layer;
use crate::device::{Device, Platform};
use crate::error::FailureKind;
use crate::executor::TaskState;
use crate::parsing::ParseStatus;
use crate::templates::{TemplateMetadata, template_metadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    /// Every task settled on its own.
    Complete,
    /// Cancelled by the operator before every task finished.
    Incomplete,
    /// The jump host failed; pending work was cancelled.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Succeeded,
    NotConfigured,
    Failed,
    Cancelled,
}

/// One executed (or skipped) catalog command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CommandRecord {
    pub command: String,
    pub slug: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_status: Option<ParseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser: Option<String>,
    /// Uncompressed size of the raw output.
    pub bytes: u64,
    pub compressed: bool,
    /// Relative to the run directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_artifact: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_artifact: Option<PathBuf>,
    /// Executions, retries after a timeout included. Zero when never sent.
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandRecord {
    /// A command that never ran because its layer could not start or was
    /// cancelled first.
    pub fn skipped(command: &str, slug: String, kind: FailureKind, error: &str) -> Self {
        Self {
            command: command.to_string(),
            slug,
            status: if kind == FailureKind::Cancelled {
                CommandStatus::Cancelled
            } else {
                CommandStatus::Failed
            },
            failure_kind: Some(kind),
            parse_status: None,
            parser: None,
            bytes: 0,
            compressed: false,
            raw_artifact: None,
            json_artifact: None,
            attempts: 0,
            duration_ms: 0,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(
            self.status,
            CommandStatus::Succeeded | CommandStatus::NotConfigured
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LayerReport {
    pub layer: Layer,
    pub state: TaskState,
    /// `(succeeded + not_configured) / total`.
    pub completeness: f64,
    /// A device session was obtained for this layer at least once.
    pub session_acquired: bool,
    /// Transport retries spent opening the layer's sessions.
    pub connect_retries: u32,
    pub duration_ms: u64,
    pub commands: Vec<CommandRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LayerReport {
    pub fn completeness_of(commands: &[CommandRecord]) -> f64 {
        if commands.is_empty() {
            return 1.0;
        }
        commands.iter().filter(|c| c.is_ok()).count() as f64 / commands.len() as f64
    }
}

/// Contents of `device.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceReport {
    pub device_id: String,
    pub hostname: String,
    pub address: String,
    pub platform: Platform,
    pub template: TemplateMetadata,
    pub reachable: bool,
    /// Transport retries spent reaching the device, summed over its layers.
    pub connect_retries: u32,
    /// Terminal device failure (auth, unreachable), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub layers: BTreeMap<Layer, LayerReport>,
}

impl DeviceReport {
    pub fn new(device: &Device, layers: Vec<LayerReport>, failure: Option<FailureKind>) -> Self {
        let reachable = layers.iter().any(|l| l.session_acquired);
        let connect_retries = layers.iter().map(|l| l.connect_retries).sum();
        Self {
            device_id: device.id.clone(),
            hostname: device.hostname.clone(),
            address: device.address.clone(),
            platform: device.platform,
            template: template_metadata(device.platform),
            reachable,
            connect_retries,
            failure,
            layers: layers.into_iter().map(|l| (l.layer, l)).collect(),
        }
    }

    /// Layers whose every command succeeded or was not configured.
    pub fn complete_layers(&self) -> usize {
        self.layers
            .values()
            .filter(|l| l.state == TaskState::Succeeded)
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunStats {
    pub devices_attempted: usize,
    pub devices_reachable: usize,
    pub layers_attempted: usize,
    pub layers_succeeded: usize,
    pub layers_degraded: usize,
    pub layers_failed: usize,
    pub commands_total: usize,
    pub commands_succeeded: usize,
    pub commands_not_configured: usize,
    pub commands_failed: usize,
    pub commands_cancelled: usize,
    /// `succeeded / (total - not_configured)`; 1.0 when nothing counted.
    pub command_success_rate: f64,
    pub errors_by_kind: BTreeMap<FailureKind, usize>,
}

impl RunStats {
    pub fn aggregate(devices: &[DeviceReport]) -> Self {
        let mut stats = RunStats {
            devices_attempted: devices.len(),
            devices_reachable: devices.iter().filter(|d| d.reachable).count(),
            ..Default::default()
        };
        for layer in devices.iter().flat_map(|d| d.layers.values()) {
            stats.layers_attempted += 1;
            match layer.state {
                TaskState::Succeeded => stats.layers_succeeded += 1,
                TaskState::Degraded => stats.layers_degraded += 1,
                _ => stats.layers_failed += 1,
            }
            for command in &layer.commands {
                stats.commands_total += 1;
                match command.status {
                    CommandStatus::Succeeded => stats.commands_succeeded += 1,
                    CommandStatus::NotConfigured => stats.commands_not_configured += 1,
                    CommandStatus::Failed => stats.commands_failed += 1,
                    CommandStatus::Cancelled => stats.commands_cancelled += 1,
                }
                if let Some(kind) = command.failure_kind {
                    *stats.errors_by_kind.entry(kind).or_default() += 1;
                }
            }
        }
        let denominator = stats.commands_total - stats.commands_not_configured;
        stats.command_success_rate = if denominator == 0 {
            1.0
        } else {
            stats.commands_succeeded as f64 / denominator as f64
        };
        stats
    }
}

/// One collection run; serialized as `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CollectionRun {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    #[schemars(with = "String")]
    pub started_at: DateTime<Utc>,
    #[schemars(with = "String")]
    pub finished_at: DateTime<Utc>,
    /// Version of the not-configured rule set applied.
    pub not_configured_ruleset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    pub stats: RunStats,
    pub devices: Vec<DeviceReport>,
}

/// The run-level summary handed back to callers and written to `run.json`.
pub type RunSummary = CollectionRun;

impl CollectionRun {
    pub fn device(&self, device_id: &str) -> Option<&DeviceReport> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn layer(&self, device_id: &str, layer: Layer) -> Option<&LayerReport> {
        self.device(device_id).and_then(|d| d.layers.get(&layer))
    }
}

/// JSON schema of `run.json`, for downstream validation.
pub fn metadata_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(CollectionRun)).unwrap_or_default()
}
