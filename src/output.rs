//! On-disk layout and artifact persistence.
//!
//! ```text
//! {run_root}/{run_id}/run.json
//! {run_root}/{run_id}/{hostname}/device.json
//! {run_root}/{run_id}/{hostname}/session.jsonl
//! {run_root}/{run_id}/{hostname}/{layer}/{command_slug}.txt | .txt.gz
//! {run_root}/{run_id}/{hostname}/{layer}/{command_slug}.json
//! ```
//!
//! Two devices whose hostnames sanitize to the same directory never share it;
//! see [`device_dirs`].
//!
//! Every file is written to a temporary file in its target directory and
//! renamed into place, so readers never observe a partial artifact.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use log::{debug, trace, warn};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::catalog::Layer;
use crate::config::CollectorConfig;
use crate::device::Device;
use crate::error::CollectError;
use crate::report::{CollectionRun, DeviceReport};

const MAX_SLUG_LEN: usize = 120;

/// Sortable run id: `YYYYMMDDTHHMMSS.mmmZ_<fingerprint>`.
///
/// The fingerprint is the first 8 hex digits of the SHA-256 of the sorted,
/// deduplicated device ids, so the same device set always yields the same
/// suffix.
pub fn run_id(started_at: DateTime<Utc>, devices: &[Device]) -> String {
    let ids = devices.iter().map(|d| d.id.as_str()).collect::<BTreeSet<_>>();
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    format!(
        "{}_{}",
        started_at.format("%Y%m%dT%H%M%S%.3fZ"),
        short_hex(&hasher.finalize())
    )
}

fn short_hex(digest: &[u8]) -> String {
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// Directory name of every device of a run, keyed by device id.
///
/// Names are the sanitized hostname. A device whose name is already taken
/// (compared case-insensitively) gets `_<8 hex digits of SHA-256(id)>`
/// appended, so its directory depends only on its own id.
pub fn device_dirs(devices: &[Device]) -> BTreeMap<String, String> {
    let mut taken = HashSet::new();
    let mut dirs = BTreeMap::new();
    for device in devices {
        if dirs.contains_key(&device.id) {
            continue;
        }
        let base = path_component(&device.hostname);
        let mut name = base.clone();
        if !taken.insert(name.to_ascii_lowercase()) {
            let suffixed = format!("{base}_{}", short_hex(&Sha256::digest(device.id.as_bytes())));
            name = suffixed.clone();
            let mut n = 2;
            while !taken.insert(name.to_ascii_lowercase()) {
                name = format!("{suffixed}-{n}");
                n += 1;
            }
            warn!(
                "{}: directory '{}' already used by another device, writing to '{}'",
                device.id, base, name
            );
        }
        dirs.insert(device.id.clone(), name);
    }
    dirs
}

/// File-name slug of a command: lowercase ASCII words joined by `_`.
pub fn command_slug(command: &str) -> String {
    let mut slug = String::with_capacity(command.len());
    for c in command.trim().chars() {
        match c {
            'a'..='z' | '0'..='9' => slug.push(c),
            'A'..='Z' => slug.push(c.to_ascii_lowercase()),
            '*' => push_word(&mut slug, "all"),
            _ => {
                if !slug.is_empty() && !slug.ends_with('_') {
                    slug.push('_');
                }
            }
        }
    }
    let mut slug = slug.trim_end_matches('_').to_string();
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches('_').to_string();
    }
    if slug.is_empty() {
        slug.push_str("command");
    }
    slug
}

fn push_word(slug: &mut String, word: &str) {
    if !slug.is_empty() && !slug.ends_with('_') {
        slug.push('_');
    }
    slug.push_str(word);
}

/// Directory-safe form of a hostname.
pub fn path_component(name: &str) -> String {
    let cleaned = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

/// Directory of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub run_id: String,
    pub dir: PathBuf,
    /// Device id to directory name, from [`device_dirs`].
    pub device_dirs: BTreeMap<String, String>,
}

impl RunLayout {
    pub fn device_dir(&self, device_id: &str) -> PathBuf {
        match self.device_dirs.get(device_id) {
            Some(name) => self.dir.join(name),
            None => self.dir.join(path_component(device_id)),
        }
    }

    pub fn layer_dir(&self, device_id: &str, layer: Layer) -> PathBuf {
        self.device_dir(device_id).join(layer.to_string())
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Where a command's output landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Relative to the run directory.
    pub raw_path: PathBuf,
    pub json_path: Option<PathBuf>,
    /// Uncompressed raw size.
    pub bytes: u64,
    pub compressed: bool,
}

#[derive(Debug, Clone)]
pub struct OutputHandler {
    run_root: PathBuf,
    compression_threshold: u64,
}

impl OutputHandler {
    pub fn new(run_root: impl Into<PathBuf>, compression_threshold: u64) -> Self {
        Self {
            run_root: run_root.into(),
            compression_threshold,
        }
    }

    pub fn from_config(config: &CollectorConfig) -> Self {
        Self::new(&config.run_root, config.compression_threshold_bytes)
    }

    /// Creates the run directory.
    ///
    /// An existing directory with the same id is never reused; a numeric
    /// suffix (`-1`, `-2`, ...) is appended instead.
    pub async fn begin_run(
        &self,
        started_at: DateTime<Utc>,
        devices: &[Device],
    ) -> Result<RunLayout, CollectError> {
        let base = run_id(started_at, devices);
        let device_dirs = device_dirs(devices);
        let root = self.run_root.clone();
        blocking(move || {
            std::fs::create_dir_all(&root)?;
            let mut suffix = 0u32;
            loop {
                let id = if suffix == 0 {
                    base.clone()
                } else {
                    format!("{base}-{suffix}")
                };
                let dir = root.join(&id);
                match std::fs::create_dir(&dir) {
                    Ok(()) => {
                        debug!("run directory {}", dir.display());
                        return Ok(RunLayout {
                            run_id: id,
                            dir,
                            device_dirs,
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                    Err(e) => return Err(e.into()),
                }
            }
        })
        .await
    }

    /// Persists one command's raw output and, when present, its structured
    /// payload.
    pub async fn write_command(
        &self,
        layout: &RunLayout,
        device_id: &str,
        layer: Layer,
        slug: &str,
        raw: String,
        payload: Option<Value>,
    ) -> Result<Artifact, CollectError> {
        let dir = layout.layer_dir(device_id, layer);
        let bytes = raw.len() as u64;
        let compressed = bytes > self.compression_threshold;
        let raw_path = dir.join(if compressed {
            format!("{slug}.txt.gz")
        } else {
            format!("{slug}.txt")
        });
        let json_path = payload.as_ref().map(|_| dir.join(format!("{slug}.json")));

        let (raw_target, json_target) = (raw_path.clone(), json_path.clone());
        blocking(move || {
            std::fs::create_dir_all(&dir)?;
            if compressed {
                persist_atomic(&raw_target, |w| {
                    let mut encoder = GzEncoder::new(w, Compression::default());
                    encoder.write_all(raw.as_bytes())?;
                    encoder.finish()?;
                    Ok(())
                })?;
            } else {
                persist_atomic(&raw_target, |w| w.write_all(raw.as_bytes()))?;
            }
            if let (Some(path), Some(payload)) = (json_target, payload) {
                persist_atomic(&path, |w| {
                    serde_json::to_writer_pretty(&mut *w, &payload)?;
                    Ok(())
                })?;
            }
            trace!("wrote {} ({} bytes)", raw_target.display(), bytes);
            Ok(())
        })
        .await?;

        Ok(Artifact {
            raw_path: layout.relative(&raw_path),
            json_path: json_path.map(|p| layout.relative(&p)),
            bytes,
            compressed,
        })
    }

    pub async fn write_device_metadata(
        &self,
        layout: &RunLayout,
        report: &DeviceReport,
    ) -> Result<PathBuf, CollectError> {
        let path = layout.device_dir(&report.device_id).join("device.json");
        write_json(path, report).await
    }

    /// Writes a device's session transcript (`session.jsonl`).
    pub async fn write_transcript(
        &self,
        layout: &RunLayout,
        device_id: &str,
        jsonl: String,
    ) -> Result<PathBuf, CollectError> {
        let path = layout.device_dir(device_id).join("session.jsonl");
        let target = path.clone();
        blocking(move || {
            if let Some(dir) = target.parent() {
                std::fs::create_dir_all(dir)?;
            }
            persist_atomic(&target, |w| {
                w.write_all(jsonl.as_bytes())?;
                if !jsonl.is_empty() {
                    w.write_all(b"\n")?;
                }
                Ok(())
            })
        })
        .await?;
        Ok(path)
    }

    pub async fn write_run_summary(
        &self,
        layout: &RunLayout,
        run: &CollectionRun,
    ) -> Result<PathBuf, CollectError> {
        write_json(layout.dir.join("run.json"), run).await
    }
}

async fn write_json<T: Serialize>(path: PathBuf, value: &T) -> Result<PathBuf, CollectError> {
    let body = serde_json::to_vec_pretty(value)?;
    let target = path.clone();
    blocking(move || {
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir)?;
        }
        persist_atomic(&target, |w| w.write_all(&body))
    })
    .await?;
    Ok(path)
}

/// Writes through a temp file in the target's directory, then renames it
/// over `path`.
fn persist_atomic<F>(path: &Path, fill: F) -> Result<(), CollectError>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let dir = path
        .parent()
        .ok_or_else(|| CollectError::Internal(format!("{} has no parent", path.display())))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        fill(&mut writer)?;
        writer.flush()?;
    }
    tmp.persist(path)?;
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T, CollectError>
where
    F: FnOnce() -> Result<T, CollectError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CollectError::Internal(format!("writer task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use serde_json::json;
    use std::io::Read;
    use tempfile::TempDir;

    fn devices(names: &[&str]) -> Vec<Device> {
        names
            .iter()
            .map(|n| Device::new(*n, "192.0.2.1", Some("ios")))
            .collect()
    }

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 5).single().expect("valid time")
    }

    #[test]
    fn run_id_is_sortable_and_order_independent() {
        let a = run_id(started(), &devices(&["r1", "r2", "r2"]));
        let b = run_id(started(), &devices(&["r2", "r1"]));
        assert_eq!(a, b);
        assert!(a.starts_with("20260301T123005.000Z_"));
        assert_eq!(a.len(), "20260301T123005.000Z_".len() + 8);
        assert_ne!(a, run_id(started(), &devices(&["r1"])));
    }

    #[test]
    fn command_slugs_are_stable_file_names() {
        assert_eq!(command_slug("show ip bgp summary"), "show_ip_bgp_summary");
        assert_eq!(
            command_slug("show running-config | include ^ip route"),
            "show_running_config_include_ip_route"
        );
        assert_eq!(command_slug("show ip route vrf *"), "show_ip_route_vrf_all");
        assert_eq!(command_slug("  "), "command");
        assert!(command_slug(&"x ".repeat(200)).len() <= MAX_SLUG_LEN);
    }

    #[test]
    fn path_component_neutralizes_separators() {
        assert_eq!(path_component("pe1.lab"), "pe1.lab");
        assert_eq!(path_component("../etc"), ".._etc");
        assert_eq!(path_component(".."), "_..");
    }

    #[test]
    fn hostnames_sanitizing_to_one_directory_are_kept_apart() {
        let devs = devices(&["core/1", "core_1", "CORE_1", "pe1"]);
        let dirs = device_dirs(&devs);

        assert_eq!(dirs["core/1"], "core_1");
        assert_eq!(dirs["pe1"], "pe1");
        assert!(dirs["core_1"].starts_with("core_1_"));
        assert!(dirs["CORE_1"].starts_with("CORE_1_"));
        let unique = dirs.values().map(|d| d.to_ascii_lowercase()).collect::<BTreeSet<_>>();
        assert_eq!(unique.len(), 4);

        // Same id, same suffix, whatever else is in the run.
        let again = device_dirs(&devices(&["core_1", "core/1"]));
        assert_eq!(again["core_1"], "core_1");
        assert!(again["core/1"].starts_with("core_1_"));
        let rerun = device_dirs(&devices(&["x", "core/1", "core_1"]));
        assert_eq!(rerun["core_1"], dirs["core_1"]);
    }

    #[tokio::test]
    async fn colliding_run_directory_gets_suffix() {
        let tmp = TempDir::new().expect("tempdir");
        let handler = OutputHandler::new(tmp.path(), 1024);
        let devs = devices(&["r1"]);

        let first = handler.begin_run(started(), &devs).await.expect("first");
        let second = handler.begin_run(started(), &devs).await.expect("second");

        assert_ne!(first.dir, second.dir);
        assert_eq!(second.run_id, format!("{}-1", first.run_id));
        assert!(second.dir.is_dir());
    }

    #[tokio::test]
    async fn output_at_threshold_stays_plain_and_above_is_gzipped() {
        let tmp = TempDir::new().expect("tempdir");
        let handler = OutputHandler::new(tmp.path(), 16);
        let layout = handler
            .begin_run(started(), &devices(&["r1"]))
            .await
            .expect("run");

        let exact = "a".repeat(16);
        let plain = handler
            .write_command(&layout, "r1", Layer::Health, "exact", exact.clone(), None)
            .await
            .expect("write exact");
        assert!(!plain.compressed);
        assert_eq!(plain.raw_path, PathBuf::from("r1/health/exact.txt"));
        assert_eq!(
            std::fs::read_to_string(layout.dir.join(&plain.raw_path)).expect("read"),
            exact
        );

        let over = format!("{exact}\nb");
        let gz = handler
            .write_command(&layout, "r1", Layer::Health, "over", over.clone(), None)
            .await
            .expect("write over");
        assert!(gz.compressed);
        assert_eq!(gz.bytes, 18);
        assert_eq!(gz.raw_path, PathBuf::from("r1/health/over.txt.gz"));

        let file = std::fs::File::open(layout.dir.join(&gz.raw_path)).expect("open gz");
        let mut decoded = String::new();
        GzDecoder::new(file)
            .read_to_string(&mut decoded)
            .expect("decode");
        assert_eq!(decoded, over);
    }

    #[tokio::test]
    async fn structured_payload_gets_json_sibling() {
        let tmp = TempDir::new().expect("tempdir");
        let handler = OutputHandler::new(tmp.path(), 1024);
        let layout = handler
            .begin_run(started(), &devices(&["r1"]))
            .await
            .expect("run");

        let artifact = handler
            .write_command(
                &layout,
                "r1",
                Layer::Bgp,
                "show_ip_bgp_summary",
                "raw".to_string(),
                Some(json!([{"neighbor": "10.0.0.2"}])),
            )
            .await
            .expect("write");

        let json_path = artifact.json_path.expect("json artifact");
        assert_eq!(json_path, PathBuf::from("r1/bgp/show_ip_bgp_summary.json"));
        let parsed: Value = serde_json::from_str(
            &std::fs::read_to_string(layout.dir.join(json_path)).expect("read json"),
        )
        .expect("valid json");
        assert_eq!(parsed[0]["neighbor"], json!("10.0.0.2"));

        let leftovers = std::fs::read_dir(layout.dir.join("r1/bgp"))
            .expect("layer dir")
            .count();
        assert_eq!(leftovers, 2, "no temp files left behind");
    }
}
