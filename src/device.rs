//! Device inventory records and credentials.
//!
//! Devices arrive from an external inventory provider. The platform is
//! resolved once, here, into the closed [`Platform`] enum; nothing downstream
//! re-checks or defaults it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use log::warn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Router operating system family.
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
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum Platform {
    Ios,
    IosXe,
    IosXr,
}

impl Platform {
    /// Resolves an inventory platform string.
    ///
    /// Accepts the usual spellings (`ios`, `ios-xe`, `iosxe`, `cisco_xr`, ...).
    /// Anything unrecognized, including a missing value, falls back to IOS
    /// with a warning.
    pub fn resolve(raw: Option<&str>, device: &str) -> Platform {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            warn!("{device}: no platform in inventory, assuming ios");
            return Platform::Ios;
        };
        let normalized = raw
            .to_ascii_lowercase()
            .replace(['_', ' '], "-")
            .trim_start_matches("cisco-")
            .to_string();
        let candidate = match normalized.as_str() {
            "iosxe" | "xe" => "ios-xe",
            "iosxr" | "xr" => "ios-xr",
            other => other,
        };
        match Platform::from_str(candidate) {
            Ok(platform) => platform,
            Err(_) => {
                warn!("{device}: unknown platform '{raw}', assuming ios");
                Platform::Ios
            }
        }
    }
}

/// Login material for one hop (jump host or device).
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Secret for `enable` when the login lands in user mode.
    #[serde(default)]
    pub enable_secret: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            enable_secret: None,
        }
    }

    pub fn with_enable_secret(mut self, secret: impl Into<String>) -> Self {
        self.enable_secret = Some(secret.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field(
                "enable_secret",
                &self.enable_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// One target router. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Unique id, normally the hostname.
    pub id: String,
    pub hostname: String,
    /// Address as reachable from the jump host.
    pub address: String,
    pub port: u16,
    pub platform: Platform,
    /// Per-device login override; `None` uses the run default.
    #[serde(default, skip_serializing)]
    pub credentials: Option<Credentials>,
}

impl Device {
    /// Builds a device, resolving the inventory platform hint.
    pub fn new(
        hostname: impl Into<String>,
        address: impl Into<String>,
        platform_hint: Option<&str>,
    ) -> Self {
        let hostname = hostname.into();
        let platform = Platform::resolve(platform_hint, &hostname);
        Self {
            id: hostname.clone(),
            hostname,
            address: address.into(),
            port: 22,
            platform,
            credentials: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Resolved secrets for a run.
///
/// Loading them (env files, vaults, CSV) is the caller's job; the engine only
/// looks them up.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    default: Credentials,
    overrides: HashMap<String, Credentials>,
}

impl CredentialStore {
    pub fn new(default: Credentials) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Registers an override by device id, taking precedence over the
    /// device record's own override.
    pub fn insert(&mut self, device_id: impl Into<String>, credentials: Credentials) {
        self.overrides.insert(device_id.into(), credentials);
    }

    pub fn for_device<'a>(&'a self, device: &'a Device) -> &'a Credentials {
        self.overrides
            .get(&device.id)
            .or(device.credentials.as_ref())
            .unwrap_or(&self.default)
    }
}
