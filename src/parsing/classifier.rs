use regex::{RegexSet, RegexSetBuilder};

use super::{OutputClassifier, Verdict};
use crate::error::CollectError;

/// Outputs with more non-empty lines than this carry real data and are never
/// classified as not configured.
pub const MAX_CLASSIFIED_LINES: usize = 8;

/// Regex rule set classifier.
///
/// Rules are matched case-insensitively against each trimmed line of short
/// outputs.
#[derive(Debug, Clone)]
pub struct RuleSetClassifier {
    version: String,
    rules: RegexSet,
    max_lines: usize,
}

impl RuleSetClassifier {
    pub fn new<S: AsRef<str>>(version: &str, rules: &[S]) -> Result<Self, CollectError> {
        let rules = RegexSetBuilder::new(rules)
            .case_insensitive(true)
            .build()
            .map_err(|e| CollectError::Config(format!("invalid not-configured rule: {e}")))?;
        Ok(Self {
            version: version.to_string(),
            rules,
            max_lines: MAX_CLASSIFIED_LINES,
        })
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines;
        self
    }
}

impl OutputClassifier for RuleSetClassifier {
    fn version(&self) -> &str {
        &self.version
    }

    fn classify(&self, raw: &str) -> Verdict {
        let lines = raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(self.max_lines + 1)
            .collect::<Vec<_>>();
        if lines.is_empty() || lines.len() > self.max_lines {
            return Verdict::Collected;
        }
        match lines.iter().find(|line| self.rules.is_match(line)) {
            Some(line) => Verdict::NotConfigured(line.to_string()),
            None => Verdict::Collected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_NOT_CONFIGURED_RULES, DEFAULT_RULESET_VERSION};

    fn classifier() -> RuleSetClassifier {
        RuleSetClassifier::new(DEFAULT_RULESET_VERSION, DEFAULT_NOT_CONFIGURED_RULES)
            .expect("default rules compile")
    }

    #[test]
    fn recognizes_common_cisco_not_configured_messages() {
        let c = classifier();
        for raw in [
            "% BGP not active",
            "%OSPF: Router process not running",
            "% LDP is not running",
            "BGP instance 'default' not found",
            "\n  % IS-IS process not configured  \n",
        ] {
            assert!(
                matches!(c.classify(raw), Verdict::NotConfigured(_)),
                "{raw:?}"
            );
        }
    }

    #[test]
    fn real_data_is_collected() {
        let c = classifier();
        assert_eq!(c.classify(""), Verdict::Collected);
        assert_eq!(
            c.classify("Neighbor ID     Pri   State\n10.0.0.2          1   FULL/DR"),
            Verdict::Collected
        );
    }

    #[test]
    fn long_outputs_are_never_classified() {
        let mut raw = String::from("% BGP not active\n");
        for i in 0..MAX_CLASSIFIED_LINES {
            raw.push_str(&format!("line {i}\n"));
        }
        assert_eq!(classifier().classify(&raw), Verdict::Collected);
        assert!(matches!(
            classifier().with_max_lines(20).classify(&raw),
            Verdict::NotConfigured(_)
        ));
    }

    #[test]
    fn custom_rules_and_version() {
        let c = RuleSetClassifier::new("site-1", &["feature disabled"]).expect("rules");
        assert_eq!(c.version(), "site-1");
        assert!(matches!(c.classify("FEATURE DISABLED"), Verdict::NotConfigured(_)));
        assert!(RuleSetClassifier::new("bad", &["("]).is_err());
    }
}
