//! Collection runs end to end.
//!
//! The coordinator names and creates the run directory, expands devices into
//! layer tasks, hands them to the [`TaskExecutor`], and once every task has
//! settled writes the per-device metadata and the run summary.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::catalog::{CommandCatalog, Layer};
use crate::config::CollectorConfig;
use crate::device::Device;
use crate::error::CollectError;
use crate::executor::{LayerTask, RunProgress, TaskExecutor};
use crate::output::{OutputHandler, RunLayout};
use crate::parsing::ParsingPipeline;
use crate::report::{CollectionRun, DeviceReport, LayerReport, RunStats, RunStatus};
use crate::session::{ConnectionManager, Connector, SessionRecorder};

/// Everything a run needs, passed explicitly.
#[derive(Clone)]
pub struct RunContext {
    pub config: CollectorConfig,
    pub connector: Arc<dyn Connector>,
    pub catalog: CommandCatalog,
    pub pipeline: Arc<ParsingPipeline>,
}

impl RunContext {
    /// Context with the builtin catalog and parsing pipeline.
    pub fn new(config: CollectorConfig, connector: Arc<dyn Connector>) -> Result<Self, CollectError> {
        config.validate()?;
        let pipeline = ParsingPipeline::builtin(&config)?;
        Ok(Self {
            config,
            connector,
            catalog: CommandCatalog::builtin(),
            pipeline: Arc::new(pipeline),
        })
    }

    pub fn with_catalog(mut self, catalog: CommandCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_pipeline(mut self, pipeline: ParsingPipeline) -> Self {
        self.pipeline = Arc::new(pipeline);
        self
    }
}

pub struct CollectionCoordinator {
    context: RunContext,
    layers: Option<Vec<Layer>>,
    output: Arc<OutputHandler>,
    progress: Arc<watch::Sender<RunProgress>>,
}

impl CollectionCoordinator {
    pub fn new(context: RunContext) -> Self {
        let output = Arc::new(OutputHandler::from_config(&context.config));
        let (progress, _) = watch::channel(RunProgress::default());
        Self {
            context,
            layers: None,
            output,
            progress: Arc::new(progress),
        }
    }

    /// Restricts runs to these layers. By default every catalog layer of a
    /// device's platform is collected.
    pub fn with_layers(mut self, layers: Vec<Layer>) -> Self {
        self.layers = Some(layers);
        self
    }

    /// Live task progress of the current run.
    pub fn subscribe_progress(&self) -> watch::Receiver<RunProgress> {
        self.progress.subscribe()
    }

    /// Collects every layer of every device and returns the run summary.
    ///
    /// Device and layer failures are reported in the summary, not returned.
    /// An error means the run directory or `run.json` could not be written.
    pub async fn run(
        &self,
        devices: Vec<Device>,
        cancel: CancellationToken,
    ) -> Result<CollectionRun, CollectError> {
        let config = &self.context.config;
        let started_at = Utc::now();
        let devices = dedupe(devices);
        let layout = self.output.begin_run(started_at, &devices).await?;
        info!(
            "run {} started: {} devices, concurrency {}",
            layout.run_id,
            devices.len(),
            config.concurrency
        );

        // Pool, failure memo and transcript are per run.
        let recorder = config.record_sessions.then(SessionRecorder::new);
        let manager = Arc::new(ConnectionManager::new(
            self.context.connector.clone(),
            config,
            recorder,
        ));
        let executor = TaskExecutor::new(
            manager.clone(),
            self.context.pipeline.clone(),
            self.output.clone(),
            config,
        )
        .with_progress(self.progress.clone());

        let devices = devices.into_iter().map(Arc::new).collect::<Vec<_>>();
        let tasks = self.plan(&devices);
        let outcome = executor.run(&layout, tasks, &cancel).await;
        manager.shutdown().await;

        let mut by_device: HashMap<String, Vec<LayerReport>> = HashMap::new();
        for (device, report) in outcome.reports {
            by_device.entry(device.id.clone()).or_default().push(report);
        }

        let mut reports = Vec::with_capacity(devices.len());
        for device in &devices {
            let layers = by_device.remove(&device.id).unwrap_or_default();
            let failure = manager.failure_for(&device.id).map(|(kind, _)| kind);
            let report = DeviceReport::new(device, layers, failure);
            self.finish_device(&layout, &manager, &report).await;
            reports.push(report);
        }

        let stats = RunStats::aggregate(&reports);
        let status = if outcome.fatal.is_some() {
            RunStatus::Aborted
        } else if cancel.is_cancelled() && stats.commands_cancelled > 0 {
            RunStatus::Incomplete
        } else {
            RunStatus::Complete
        };

        let run = CollectionRun {
            run_id: layout.run_id.clone(),
            run_dir: layout.dir.clone(),
            status,
            started_at,
            finished_at: Utc::now(),
            not_configured_ruleset: self.context.pipeline.classifier_version().to_string(),
            fatal_error: outcome.fatal,
            stats,
            devices: reports,
        };
        self.output.write_run_summary(&layout, &run).await?;

        info!(
            "run {} {}: {}/{} devices reachable, {}/{} layers complete, command success rate {:.3}",
            run.run_id,
            run.status,
            run.stats.devices_reachable,
            run.stats.devices_attempted,
            run.stats.layers_succeeded,
            run.stats.layers_attempted,
            run.stats.command_success_rate
        );
        Ok(run)
    }

    /// Tasks in device-major, layer order.
    fn plan(&self, devices: &[Arc<Device>]) -> Vec<LayerTask> {
        let catalog = &self.context.catalog;
        let mut tasks = Vec::new();
        for device in devices {
            let layers = match &self.layers {
                Some(selected) => selected.clone(),
                None => catalog.layers_for(device.platform),
            };
            for layer in layers {
                tasks.push(LayerTask {
                    device: device.clone(),
                    layer,
                    commands: catalog.commands(device.platform, layer).to_vec(),
                });
            }
        }
        tasks
    }

    /// Writes `device.json` and, when recording, `session.jsonl`.
    async fn finish_device(&self, layout: &RunLayout, manager: &ConnectionManager, report: &DeviceReport) {
        if let Err(e) = self.output.write_device_metadata(layout, report).await {
            error!("{}: device metadata not written: {}", report.device_id, e);
        }
        let Some(recorder) = manager.recorder() else {
            return;
        };
        let jsonl = match recorder.to_jsonl_for(&report.device_id) {
            Ok(jsonl) => jsonl,
            Err(e) => {
                warn!("{}: transcript unavailable: {}", report.device_id, e);
                return;
            }
        };
        if let Err(e) = self
            .output
            .write_transcript(layout, &report.device_id, jsonl)
            .await
        {
            error!("{}: transcript not written: {}", report.device_id, e);
        }
    }
}

/// Drops repeated device ids, keeping the first occurrence.
fn dedupe(devices: Vec<Device>) -> Vec<Device> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|d| {
            let fresh = seen.insert(d.id.clone());
            if !fresh {
                warn!("duplicate device {} ignored", d.id);
            }
            fresh
        })
        .collect()
}
