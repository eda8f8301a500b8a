//! Engine configuration.
//!
//! Two halves live here: the SSH algorithm profiles used when negotiating with
//! the jump host and the devices behind it, and [`CollectorConfig`], the
//! operator-tunable knobs of a collection run (concurrency, timeouts, retry,
//! compression, not-configured rules).

use std::path::{Path, PathBuf};
use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};
use serde::{Deserialize, Serialize};

use crate::error::CollectError;
use crate::session::RetryPolicy;

/// Modern key exchange algorithms only.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
];

/// Modern algorithms plus SHA-1 group exchange still common on IOS 15.x.
pub const BALANCED_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
    kex::DH_GEX_SHA256,
    kex::DH_G14_SHA1,
    kex::DH_GEX_SHA1,
];

/// Everything russh can speak, for routers that never got a crypto refresh.
pub const LEGACY_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_GEX_SHA1,
    kex::DH_GEX_SHA256,
    kex::DH_G1_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G14_SHA256,
    kex::DH_G15_SHA512,
    kex::DH_G16_SHA512,
    kex::DH_G17_SHA512,
    kex::DH_G18_SHA512,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::NONE,
];

pub static SECURE_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

pub static BALANCED_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_128_CBC,
];

/// Includes CBC and `none` ciphers for old IOS images.
pub static LEGACY_CIPHERS: &[cipher::Name] = &[
    cipher::CLEAR,
    cipher::NONE,
    cipher::AES_128_CTR,
    cipher::AES_192_CTR,
    cipher::AES_256_CTR,
    cipher::AES_256_GCM,
    cipher::AES_128_CBC,
    cipher::AES_192_CBC,
    cipher::AES_256_CBC,
    cipher::CHACHA20_POLY1305,
];

pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
];

pub const BALANCED_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::NONE,
    mac::HMAC_SHA1,
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512_ETM,
];

pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] = &[
    compression::NONE,
    compression::ZLIB,
    compression::ZLIB_LEGACY,
];

pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

pub const BALANCED_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
];

pub const LEGACY_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Dsa,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Ed25519,
    Algorithm::Rsa { hash: None },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
];

/// Default bound on simultaneously open device sessions.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Raw artifacts strictly larger than this are gzip-compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: u64 = 1024 * 1024;

/// Default "protocol not configured" rule set.
///
/// Matched case-insensitively against each output line.
pub const DEFAULT_NOT_CONFIGURED_RULES: &[&str] = &[
    r"\bnot (enabled|running|active|configured)\b",
    r"^%\s*bgp not active",
    r"^%\s*ospf:.*not running",
    r"^%\s*isis.*not (running|configured)",
    r"^%\s*ldp is not (running|enabled)",
    r"^%\s*mpls (not configured|is not enabled)",
    r"no such (process|instance)",
    r"^%\s*vrf .* does not exist",
    r"bgp instance .* not found",
];

/// Version tag of [`DEFAULT_NOT_CONFIGURED_RULES`], recorded in run metadata.
pub const DEFAULT_RULESET_VERSION: &str = "2026.1";

/// Operator-tunable settings for one collection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Max simultaneously open device sessions, and size of the worker pool.
    pub concurrency: usize,
    /// Directory under which run directories are created.
    pub run_root: PathBuf,
    /// Raw artifacts larger than this many bytes are stored as `.txt.gz`.
    pub compression_threshold_bytes: u64,
    pub standard_command_timeout_secs: u64,
    /// Timeout for bulk table dumps (full BGP tables, full RIB).
    pub bulk_command_timeout_secs: u64,
    /// Budget for TCP + SSH handshake + first prompt on one device.
    pub connect_timeout_secs: u64,
    /// Pooled sessions unused for this long are closed.
    pub session_idle_timeout_secs: u64,
    /// Extra attempts for a command that timed out.
    pub command_retries: u32,
    /// Reconnect policy for transport-class failures.
    pub retry: RetryPolicy,
    /// Regexes flagging output as "protocol not configured".
    pub not_configured_rules: Vec<String>,
    pub not_configured_ruleset_version: String,
    /// Write a `session.jsonl` transcript per device.
    pub record_sessions: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            run_root: PathBuf::from("collections"),
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD,
            standard_command_timeout_secs: 60,
            bulk_command_timeout_secs: 600,
            connect_timeout_secs: 30,
            session_idle_timeout_secs: 300,
            command_retries: 1,
            retry: RetryPolicy::default(),
            not_configured_rules: DEFAULT_NOT_CONFIGURED_RULES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            not_configured_ruleset_version: DEFAULT_RULESET_VERSION.to_string(),
            record_sessions: false,
        }
    }
}

impl CollectorConfig {
    /// Loads a TOML config file. Missing keys keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CollectError> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Self::load_from_str(&data)
    }

    pub fn load_from_str(toml_str: &str) -> Result<Self, CollectError> {
        let config = toml::from_str::<CollectorConfig>(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CollectError> {
        if self.concurrency == 0 {
            return Err(CollectError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CollectError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.standard_command_timeout_secs == 0 || self.bulk_command_timeout_secs == 0 {
            return Err(CollectError::Config(
                "command timeouts must be positive".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(CollectError::Config(
                "connect_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn standard_timeout(&self) -> Duration {
        Duration::from_secs(self.standard_command_timeout_secs)
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = CollectorConfig::load_from_str("").expect("empty config is valid");
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.compression_threshold_bytes, 1024 * 1024);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(!config.not_configured_rules.is_empty());
    }

    #[test]
    fn partial_toml_overrides_only_given_keys() {
        let toml_str = r#"
        concurrency = 4
        run_root = "/var/lib/netcollect"
        bulk_command_timeout_secs = 900

        [retry]
        max_attempts = 5
        initial_delay_ms = 250
        "#;
        let config = CollectorConfig::load_from_str(toml_str).expect("valid config");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.run_root, PathBuf::from("/var/lib/netcollect"));
        assert_eq!(config.bulk_timeout(), Duration::from_secs(900));
        assert_eq!(config.standard_timeout(), Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 250);
        assert_eq!(config.retry.max_delay_ms, 30_000);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = CollectorConfig::load_from_str("concurrency = 0").unwrap_err();
        assert!(matches!(err, CollectError::Config(_)));
    }

    #[test]
    fn zero_connect_timeout_is_rejected() {
        let err = CollectorConfig::load_from_str("connect_timeout_secs = 0").unwrap_err();
        assert!(matches!(err, CollectError::Config(ref msg) if msg.contains("connect_timeout_secs")));
    }
}
