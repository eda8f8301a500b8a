//! Command catalog: which commands make up each collection layer.
//!
//! A layer is plain data, an ordered list of [`CommandSpec`] per platform.
//! The executor interprets every layer the same way; adding a layer or a
//! command never needs new code.

use std::collections::BTreeMap;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::CollectorConfig;
use crate::device::Platform;
use crate::error::CollectError;

/// Functional domain of collected state.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Layer {
    Health,
    Interfaces,
    Igp,
    Mpls,
    Bgp,
    Vpn,
    Static,
    Console,
}

/// Timeout class of a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommandClass {
    #[default]
    Standard,
    /// Table dumps that can run to hundreds of thousands of lines.
    Bulk,
}

/// One catalog command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub class: CommandClass,
    /// Overrides the class timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Parser/template key to use instead of the command text.
    #[serde(default)]
    pub parser: Option<String>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            class: CommandClass::Standard,
            timeout_secs: None,
            parser: None,
        }
    }

    pub fn bulk(command: impl Into<String>) -> Self {
        Self {
            class: CommandClass::Bulk,
            ..Self::new(command)
        }
    }

    pub fn with_parser(mut self, parser: impl Into<String>) -> Self {
        self.parser = Some(parser.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Effective execution timeout.
    pub fn timeout(&self, config: &CollectorConfig) -> Duration {
        if let Some(secs) = self.timeout_secs {
            return Duration::from_secs(secs);
        }
        match self.class {
            CommandClass::Standard => config.standard_timeout(),
            CommandClass::Bulk => config.bulk_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    entry: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    platforms: Vec<Platform>,
    layer: Layer,
    commands: Vec<CommandSpec>,
}

/// `(platform, layer) -> ordered commands`.
#[derive(Debug, Clone, Default)]
pub struct CommandCatalog {
    entries: BTreeMap<(Platform, Layer), Vec<CommandSpec>>,
}

impl CommandCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the command list of a layer on one platform.
    pub fn insert(&mut self, platform: Platform, layer: Layer, commands: Vec<CommandSpec>) {
        self.entries.insert((platform, layer), commands);
    }

    /// Commands for a layer in execution order; empty if the layer does not
    /// apply to the platform.
    pub fn commands(&self, platform: Platform, layer: Layer) -> &[CommandSpec] {
        self.entries
            .get(&(platform, layer))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Layers with at least one command for `platform`, in layer order.
    pub fn layers_for(&self, platform: Platform) -> Vec<Layer> {
        self.entries
            .iter()
            .filter(|((p, _), cmds)| *p == platform && !cmds.is_empty())
            .map(|((_, layer), _)| *layer)
            .collect()
    }

    /// Loads a catalog from TOML.
    ///
    /// ```toml
    /// [[entry]]
    /// platforms = ["ios", "ios-xe"]
    /// layer = "bgp"
    /// commands = [
    ///   { command = "show ip bgp summary" },
    ///   { command = "show ip bgp", class = "bulk" },
    /// ]
    /// ```
    pub fn from_toml_str(toml_str: &str) -> Result<Self, CollectError> {
        let file = toml::from_str::<CatalogFile>(toml_str)?;
        let mut catalog = Self::new();
        for entry in file.entry {
            if entry.platforms.is_empty() {
                return Err(CollectError::Config(format!(
                    "catalog entry for layer '{}' lists no platforms",
                    entry.layer
                )));
            }
            for platform in entry.platforms {
                catalog.insert(platform, entry.layer, entry.commands.clone());
            }
        }
        Ok(catalog)
    }

    /// The default catalog for IOS, IOS-XE and IOS-XR.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for platform in [Platform::Ios, Platform::IosXe] {
            catalog.insert(
                platform,
                Layer::Health,
                vec![
                    CommandSpec::new("show version").with_parser("show version"),
                    CommandSpec::new("show inventory"),
                    CommandSpec::new("show processes cpu sorted"),
                    CommandSpec::new("show processes memory sorted"),
                    CommandSpec::new("show environment all"),
                    CommandSpec::new("show logging"),
                ],
            );
            catalog.insert(
                platform,
                Layer::Interfaces,
                vec![
                    CommandSpec::new("show ip interface brief"),
                    CommandSpec::new("show interfaces description"),
                    CommandSpec::new("show interfaces"),
                    CommandSpec::new("show cdp neighbors detail"),
                    CommandSpec::new("show lldp neighbors detail"),
                ],
            );
            catalog.insert(
                platform,
                Layer::Igp,
                vec![
                    CommandSpec::new("show ip ospf neighbor"),
                    CommandSpec::new("show ip ospf interface brief"),
                    CommandSpec::new("show ip ospf database"),
                    CommandSpec::new("show isis neighbors"),
                    CommandSpec::new("show ip protocols"),
                ],
            );
            catalog.insert(
                platform,
                Layer::Mpls,
                vec![
                    CommandSpec::new("show mpls interfaces"),
                    CommandSpec::new("show mpls ldp neighbor"),
                    CommandSpec::new("show mpls forwarding-table"),
                ],
            );
            catalog.insert(
                platform,
                Layer::Bgp,
                vec![
                    CommandSpec::new("show ip bgp summary"),
                    CommandSpec::new("show ip bgp vpnv4 all summary"),
                    CommandSpec::new("show ip bgp neighbors"),
                    CommandSpec::bulk("show ip bgp"),
                ],
            );
            catalog.insert(
                platform,
                Layer::Vpn,
                vec![
                    CommandSpec::new("show vrf"),
                    CommandSpec::new("show ip vrf detail"),
                    CommandSpec::bulk("show ip route vrf *"),
                ],
            );
            catalog.insert(
                platform,
                Layer::Static,
                vec![
                    CommandSpec::new("show running-config | include ^ip route"),
                    CommandSpec::new("show ip route static"),
                    CommandSpec::new("show ip route summary"),
                ],
            );
            catalog.insert(
                platform,
                Layer::Console,
                vec![
                    CommandSpec::new("show line"),
                    CommandSpec::new("show users"),
                    CommandSpec::new("show running-config | section line"),
                ],
            );
        }

        let xr = Platform::IosXr;
        catalog.insert(
            xr,
            Layer::Health,
            vec![
                CommandSpec::new("show version").with_parser("show version"),
                CommandSpec::new("show inventory"),
                CommandSpec::new("show platform"),
                CommandSpec::new("show processes cpu"),
                CommandSpec::new("show memory summary"),
                CommandSpec::new("show logging last 500"),
            ],
        );
        catalog.insert(
            xr,
            Layer::Interfaces,
            vec![
                CommandSpec::new("show ipv4 interface brief"),
                CommandSpec::new("show interfaces description"),
                CommandSpec::new("show interfaces"),
                CommandSpec::new("show lldp neighbors detail"),
            ],
        );
        catalog.insert(
            xr,
            Layer::Igp,
            vec![
                CommandSpec::new("show ospf neighbor"),
                CommandSpec::new("show isis adjacency"),
                CommandSpec::new("show isis database"),
                CommandSpec::new("show route summary"),
            ],
        );
        catalog.insert(
            xr,
            Layer::Mpls,
            vec![
                CommandSpec::new("show mpls interfaces"),
                CommandSpec::new("show mpls ldp neighbor brief"),
                CommandSpec::new("show mpls traffic-eng tunnels brief"),
                CommandSpec::new("show mpls forwarding"),
            ],
        );
        catalog.insert(
            xr,
            Layer::Bgp,
            vec![
                CommandSpec::new("show bgp summary"),
                CommandSpec::new("show bgp vpnv4 unicast summary"),
                CommandSpec::new("show bgp neighbors"),
                CommandSpec::bulk("show bgp"),
            ],
        );
        catalog.insert(
            xr,
            Layer::Vpn,
            vec![
                CommandSpec::new("show vrf all"),
                CommandSpec::new("show l2vpn xconnect"),
                CommandSpec::bulk("show route vrf all"),
            ],
        );
        catalog.insert(
            xr,
            Layer::Static,
            vec![
                CommandSpec::new("show running-config router static"),
                CommandSpec::new("show route static"),
            ],
        );
        catalog.insert(
            xr,
            Layer::Console,
            vec![
                CommandSpec::new("show line"),
                CommandSpec::new("show users"),
            ],
        );
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn builtin_covers_every_layer_on_every_platform() {
        let catalog = CommandCatalog::builtin();
        for platform in Platform::iter() {
            let layers = catalog.layers_for(platform);
            assert_eq!(layers.len(), Layer::iter().count(), "{platform}");
        }
    }

    #[test]
    fn bulk_commands_get_bulk_timeout() {
        let config = CollectorConfig::default();
        let catalog = CommandCatalog::builtin();
        let bgp = catalog.commands(Platform::Ios, Layer::Bgp);
        let table = bgp
            .iter()
            .find(|c| c.command == "show ip bgp")
            .expect("full table command");
        assert_eq!(table.timeout(&config), config.bulk_timeout());
        assert_eq!(bgp[0].timeout(&config), config.standard_timeout());
        assert_eq!(
            CommandSpec::bulk("x").with_timeout_secs(5).timeout(&config),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn catalog_loads_from_toml_and_preserves_order() {
        let toml_str = r#"
        [[entry]]
        platforms = ["ios", "ios-xe"]
        layer = "bgp"
        commands = [
          { command = "show ip bgp summary" },
          { command = "show ip bgp", class = "bulk" },
        ]

        [[entry]]
        platforms = ["ios-xr"]
        layer = "health"
        commands = [{ command = "show version", parser = "show version" }]
        "#;
        let catalog = CommandCatalog::from_toml_str(toml_str).expect("valid catalog");
        let bgp = catalog.commands(Platform::IosXe, Layer::Bgp);
        assert_eq!(bgp.len(), 2);
        assert_eq!(bgp[0].command, "show ip bgp summary");
        assert_eq!(bgp[1].class, CommandClass::Bulk);
        assert_eq!(catalog.layers_for(Platform::IosXr), vec![Layer::Health]);
        assert!(catalog.commands(Platform::Ios, Layer::Mpls).is_empty());
    }

    #[test]
    fn layer_names_are_snake_case() {
        assert_eq!(Layer::Interfaces.to_string(), "interfaces");
        assert_eq!("BGP".parse::<Layer>().expect("parse"), Layer::Bgp);
    }
}
