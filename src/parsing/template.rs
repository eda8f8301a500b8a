use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{TemplateParser, normalize_command};
use crate::device::Platform;
use crate::error::CollectError;

/// A line-oriented template: every output line matching `record` becomes
/// one JSON object keyed by the regex's named groups.
#[derive(Debug, Clone)]
pub struct RegexTemplate {
    pub name: String,
    pub platforms: Vec<Platform>,
    /// Normalized command or parser key the template applies to.
    pub command: String,
    record: Regex,
}

impl RegexTemplate {
    pub fn new(
        name: impl Into<String>,
        platforms: &[Platform],
        command: &str,
        record: &str,
    ) -> Result<Self, CollectError> {
        let name = name.into();
        let record = Regex::new(record)
            .map_err(|e| CollectError::Config(format!("template '{name}': {e}")))?;
        if record.capture_names().flatten().next().is_none() {
            return Err(CollectError::Config(format!(
                "template '{name}' has no named groups"
            )));
        }
        Ok(Self {
            name,
            platforms: platforms.to_vec(),
            command: normalize_command(command),
            record,
        })
    }

    fn applies(&self, platform: Platform, key: &str) -> bool {
        self.command == key && self.platforms.contains(&platform)
    }

    /// Extracts records. Empty output yields no records; non-empty output
    /// with no matching line means the template does not fit.
    pub fn extract(&self, raw: &str) -> Result<Value, String> {
        let mut records = Vec::new();
        for line in raw.lines() {
            let Some(caps) = self.record.captures(line.trim_end()) else {
                continue;
            };
            let mut record = Map::new();
            for name in self.record.capture_names().flatten() {
                if let Some(m) = caps.name(name) {
                    record.insert(name.to_string(), Value::String(m.as_str().to_string()));
                }
            }
            records.push(Value::Object(record));
        }
        if records.is_empty() && !raw.trim().is_empty() {
            return Err("no line matched the record pattern".to_string());
        }
        Ok(Value::Array(records))
    }
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    template: Vec<TemplateEntry>,
}

#[derive(Debug, Deserialize)]
struct TemplateEntry {
    name: String,
    platforms: Vec<Platform>,
    command: String,
    record: String,
}

/// Ordered set of templates; the first applicable one wins.
#[derive(Debug, Clone, Default)]
pub struct TemplateLibrary {
    templates: Vec<RegexTemplate>,
}

impl TemplateLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, template: RegexTemplate) {
        self.templates.push(template);
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Loads templates from TOML.
    ///
    /// ```toml
    /// [[template]]
    /// name = "ios_ip_route_static"
    /// platforms = ["ios", "ios-xe"]
    /// command = "show ip route static"
    /// record = '^S\*?\s+(?P<prefix>\S+)\s+\[(?P<distance>\d+)/(?P<metric>\d+)\] via (?P<next_hop>\S+)'
    /// ```
    pub fn from_toml_str(toml_str: &str) -> Result<Self, CollectError> {
        let file = toml::from_str::<TemplateFile>(toml_str)?;
        let mut library = Self::new();
        for entry in file.template {
            library.push(RegexTemplate::new(
                entry.name,
                &entry.platforms,
                &entry.command,
                &entry.record,
            )?);
        }
        Ok(library)
    }

    /// Templates for the common table outputs of IOS, IOS-XE and IOS-XR.
    pub fn builtin() -> Result<Self, CollectError> {
        let ios = [Platform::Ios, Platform::IosXe];
        let xr = [Platform::IosXr];
        let mut library = Self::new();
        library.push(RegexTemplate::new(
            "ios_ip_interface_brief",
            &ios,
            "show ip interface brief",
            r"^(?P<interface>\S+)\s+(?P<ip_address>\S+)\s+(?:YES|NO)\s+(?P<method>\S+)\s+(?P<status>up|down|administratively down|deleted)\s+(?P<protocol>up|down)\s*$",
        )?);
        library.push(RegexTemplate::new(
            "xr_ipv4_interface_brief",
            &xr,
            "show ipv4 interface brief",
            r"^(?P<interface>\S+)\s+(?P<ip_address>\S+)\s+(?P<status>Up|Down|Shutdown)\s+(?P<protocol>Up|Down)\s+(?P<vrf>\S+)\s*$",
        )?);
        library.push(RegexTemplate::new(
            "ios_bgp_summary",
            &ios,
            "show ip bgp summary",
            r"^(?P<neighbor>\d+\.\d+\.\d+\.\d+|[0-9a-fA-F:]+:[0-9a-fA-F:]*)\s+(?P<version>\d+)\s+(?P<remote_as>[\d.]+)\s+(?P<msg_rcvd>\d+)\s+(?P<msg_sent>\d+)\s+(?P<table_version>\d+)\s+(?P<in_q>\d+)\s+(?P<out_q>\d+)\s+(?P<up_down>\S+)\s+(?P<state_pfx>.+?)\s*$",
        )?);
        library.push(RegexTemplate::new(
            "xr_bgp_summary",
            &xr,
            "show bgp summary",
            r"^(?P<neighbor>\d+\.\d+\.\d+\.\d+|[0-9a-fA-F:]+:[0-9a-fA-F:]*)\s+(?P<speaker>\d+)\s+(?P<remote_as>[\d.]+)\s+(?P<msg_rcvd>\d+)\s+(?P<msg_sent>\d+)\s+(?P<table_version>\d+)\s+(?P<in_q>\d+)\s+(?P<out_q>\d+)\s+(?P<up_down>\S+)\s+(?P<state_pfx>.+?)\s*$",
        )?);
        library.push(RegexTemplate::new(
            "ios_ospf_neighbor",
            &ios,
            "show ip ospf neighbor",
            r"^(?P<neighbor_id>\d+\.\d+\.\d+\.\d+)\s+(?P<priority>\d+)\s+(?P<state>\S+)\s+(?P<dead_time>\S+)\s+(?P<address>\d+\.\d+\.\d+\.\d+)\s+(?P<interface>\S+)\s*$",
        )?);
        library.push(RegexTemplate::new(
            "xr_ospf_neighbor",
            &xr,
            "show ospf neighbor",
            r"^(?P<neighbor_id>\d+\.\d+\.\d+\.\d+)\s+(?P<priority>\d+)\s+(?P<state>\S+)\s+(?P<dead_time>\S+)\s+(?P<address>\d+\.\d+\.\d+\.\d+)\s+(?P<up_time>\S+)\s+(?P<interface>\S+)\s*$",
        )?);
        Ok(library)
    }
}

impl TemplateParser for TemplateLibrary {
    fn name(&self) -> &str {
        "templates"
    }

    fn parse(&self, platform: Platform, key: &str, raw: &str) -> Option<Result<Value, String>> {
        let template = self.templates.iter().find(|t| t.applies(platform, key))?;
        Some(
            template
                .extract(raw)
                .map_err(|e| format!("{}: {e}", template.name)),
        )
    }
}
