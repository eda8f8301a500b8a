//! Structured parsing of raw command output.
//!
//! Every collected output goes through [`ParsingPipeline::process`]:
//!
//! 1. the [`OutputClassifier`] decides whether the output only says the
//!    protocol is not configured;
//! 2. structured parsers keyed by `(platform, command)`;
//! 3. template parsers keyed the same way;
//! 4. otherwise the output is kept raw only.
//!
//! A parser that does not apply returns `None`; one that applies but fails
//! returns `Some(Err(..))` and the next stage is tried. A parser that panics
//! is treated as failed. Falling through to raw only is never an error.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::CommandSpec;
use crate::config::CollectorConfig;
use crate::device::Platform;
use crate::error::CollectError;

mod classifier;
mod structured;
mod template;

pub use classifier::RuleSetClassifier;
pub use structured::BuiltinParsers;
pub use template::{RegexTemplate, TemplateLibrary};

/// How a command's output was interpreted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ParseStatus {
    Structured,
    Template,
    RawOnly,
    NotConfigured,
}

/// Classifier verdict on a raw output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Collected,
    /// The output only reports that the feature is absent; carries the
    /// matching line.
    NotConfigured(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome {
    pub status: ParseStatus,
    pub payload: Option<Value>,
    /// Name of the parser or template that produced the payload.
    pub parser: Option<String>,
    /// Last parser error seen on the way to the final status.
    pub error: Option<String>,
}

impl ParseOutcome {
    pub(crate) fn raw_only(error: Option<String>) -> Self {
        Self {
            status: ParseStatus::RawOnly,
            payload: None,
            parser: None,
            error,
        }
    }
}

/// Hand-written parser producing structured data.
pub trait StructuredParser: Send + Sync {
    fn name(&self) -> &str;

    /// `None` when the parser does not handle `(platform, key)`.
    fn parse(&self, platform: Platform, key: &str, raw: &str) -> Option<Result<Value, String>>;
}

/// Declarative template producing records.
pub trait TemplateParser: Send + Sync {
    fn name(&self) -> &str;

    fn parse(&self, platform: Platform, key: &str, raw: &str) -> Option<Result<Value, String>>;
}

/// Detects "protocol not configured" output.
pub trait OutputClassifier: Send + Sync {
    /// Version of the rule set, recorded in run metadata.
    fn version(&self) -> &str;

    fn classify(&self, raw: &str) -> Verdict;
}

/// Lowercases and collapses whitespace, so catalog spellings and parser keys
/// compare equal.
pub fn normalize_command(command: &str) -> String {
    command
        .split_whitespace()
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct ParsingPipeline {
    classifier: Arc<dyn OutputClassifier>,
    structured: Vec<Arc<dyn StructuredParser>>,
    templates: Vec<Arc<dyn TemplateParser>>,
}

impl ParsingPipeline {
    /// A pipeline with only a classifier; every output ends up raw only.
    pub fn new(classifier: Arc<dyn OutputClassifier>) -> Self {
        Self {
            classifier,
            structured: Vec::new(),
            templates: Vec::new(),
        }
    }

    /// Built-in parsers and templates with the configured classifier rules.
    pub fn builtin(config: &CollectorConfig) -> Result<Self, CollectError> {
        let classifier = RuleSetClassifier::new(
            &config.not_configured_ruleset_version,
            config.not_configured_rules.as_slice(),
        )?;
        Ok(Self::new(Arc::new(classifier))
            .with_structured(Arc::new(BuiltinParsers))
            .with_template(Arc::new(TemplateLibrary::builtin()?)))
    }

    pub fn with_structured(mut self, parser: Arc<dyn StructuredParser>) -> Self {
        self.structured.push(parser);
        self
    }

    pub fn with_template(mut self, parser: Arc<dyn TemplateParser>) -> Self {
        self.templates.push(parser);
        self
    }

    pub fn classifier_version(&self) -> &str {
        self.classifier.version()
    }

    pub fn classify(&self, raw: &str) -> Verdict {
        self.classifier.classify(raw)
    }

    /// Interprets one command output. Never fails.
    pub fn process(&self, platform: Platform, spec: &CommandSpec, raw: &str) -> ParseOutcome {
        if let Verdict::NotConfigured(line) = self.classifier.classify(raw) {
            return ParseOutcome {
                status: ParseStatus::NotConfigured,
                payload: None,
                parser: None,
                error: Some(line),
            };
        }

        let key = normalize_command(spec.parser.as_deref().unwrap_or(&spec.command));
        let mut last_error = None;

        for parser in &self.structured {
            match guarded(parser.name(), || parser.parse(platform, &key, raw)) {
                Some(Ok(payload)) => {
                    return ParseOutcome {
                        status: ParseStatus::Structured,
                        payload: Some(payload),
                        parser: Some(parser.name().to_string()),
                        error: None,
                    };
                }
                Some(Err(err)) => {
                    debug!("{} on '{}' failed: {}", parser.name(), key, err);
                    last_error = Some(format!("{}: {err}", parser.name()));
                }
                None => {}
            }
        }

        for template in &self.templates {
            match guarded(template.name(), || template.parse(platform, &key, raw)) {
                Some(Ok(payload)) => {
                    return ParseOutcome {
                        status: ParseStatus::Template,
                        payload: Some(payload),
                        parser: Some(template.name().to_string()),
                        error: last_error,
                    };
                }
                Some(Err(err)) => {
                    debug!("template {} on '{}' failed: {}", template.name(), key, err);
                    last_error = Some(format!("{}: {err}", template.name()));
                }
                None => {}
            }
        }

        ParseOutcome::raw_only(last_error)
    }
}

/// Runs one parser, turning a panic into a parse error.
fn guarded<F>(name: &str, parse: F) -> Option<Result<Value, String>>
where
    F: FnOnce() -> Option<Result<Value, String>>,
{
    panic::catch_unwind(AssertUnwindSafe(parse)).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        warn!("parser {name} panicked: {reason}");
        Some(Err(format!("panicked: {reason}")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Failing;

    impl StructuredParser for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn parse(&self, _: Platform, key: &str, _: &str) -> Option<Result<Value, String>> {
            (key == "show ip interface brief").then(|| Err("unexpected layout".to_string()))
        }
    }

    struct Panicking;

    impl TemplateParser for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn parse(&self, _: Platform, key: &str, _: &str) -> Option<Result<Value, String>> {
            if key == "show inventory" {
                panic!("index out of range");
            }
            None
        }
    }

    fn pipeline() -> ParsingPipeline {
        ParsingPipeline::builtin(&CollectorConfig::default()).expect("builtin pipeline")
    }

    const IOS_INTERFACES: &str = "\
Interface              IP-Address      OK? Method Status                Protocol
GigabitEthernet0/0     10.0.0.1        YES NVRAM  up                    up
GigabitEthernet0/1     unassigned      YES NVRAM  administratively down down";

    #[test]
    fn normalize_command_collapses_case_and_spacing() {
        assert_eq!(normalize_command("  Show   IP bgp\tSummary "), "show ip bgp summary");
    }

    #[test]
    fn structured_parser_wins_over_template() {
        let raw = "Cisco IOS Software, C2900 Software (C2900-UNIVERSALK9-M), Version 15.4(3)M2, RELEASE SOFTWARE (fc2)\n\
                   core1 uptime is 1 year, 2 weeks\n\
                   Processor board ID FTX1234ABCD";
        let spec = CommandSpec::new("show version").with_parser("show version");
        let outcome = pipeline().process(Platform::Ios, &spec, raw);
        assert_eq!(outcome.status, ParseStatus::Structured);
        let payload = outcome.payload.expect("payload");
        assert_eq!(payload["version"], json!("15.4(3)M2"));
        assert_eq!(payload["hostname"], json!("core1"));
    }

    #[test]
    fn failed_structured_parser_falls_back_to_template() {
        let pipeline = pipeline().with_structured(Arc::new(Failing));
        let spec = CommandSpec::new("show ip interface brief");
        let outcome = pipeline.process(Platform::IosXe, &spec, IOS_INTERFACES);

        assert_eq!(outcome.status, ParseStatus::Template);
        assert!(outcome.error.as_deref().unwrap_or("").contains("unexpected layout"));
        let records = outcome.payload.expect("records");
        assert_eq!(records.as_array().map(Vec::len), Some(2));
        assert_eq!(records[1]["status"], json!("administratively down"));
    }

    #[test]
    fn unknown_command_is_raw_only() {
        let spec = CommandSpec::new("show logging");
        let outcome = pipeline().process(Platform::Ios, &spec, "Syslog logging: enabled\nline two");
        assert_eq!(outcome.status, ParseStatus::RawOnly);
        assert!(outcome.payload.is_none());
        assert!(outcome.error.is_none());
    }

    #[test]
    fn not_configured_output_is_classified_first() {
        let spec = CommandSpec::new("show ip bgp summary");
        let outcome = pipeline().process(Platform::Ios, &spec, "% BGP not active");
        assert_eq!(outcome.status, ParseStatus::NotConfigured);
    }

    #[test]
    fn panicking_parser_falls_back_to_raw_only() {
        let pipeline = ParsingPipeline::new(Arc::new(
            RuleSetClassifier::new("test", &["not running"]).expect("rules"),
        ))
        .with_structured(Arc::new(Failing))
        .with_template(Arc::new(Panicking));

        let spec = CommandSpec::new("show inventory");
        let outcome = pipeline.process(Platform::Ios, &spec, "NAME: \"Chassis\", DESCR: \"C3945\"");
        assert_eq!(outcome.status, ParseStatus::RawOnly);
        let error = outcome.error.expect("panic recorded");
        assert!(error.contains("panicking"), "{error}");
        assert!(error.contains("index out of range"), "{error}");

        let spec = CommandSpec::new("show ip interface brief");
        let outcome = pipeline.process(Platform::Ios, &spec, IOS_INTERFACES);
        assert_eq!(outcome.status, ParseStatus::RawOnly);
    }
}
