//! Prompt state machine for router shells.
//!
//! The shell reader feeds every complete line, and the trailing partial line,
//! through a [`PromptHandler`]. The handler classifies text against one
//! combined `RegexSet`: prompts (user or privileged), pager markers, device
//! error lines and interactive input requests such as `Password:`.

use log::trace;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

use crate::error::ConnectError;

/// Privilege level implied by a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptLevel {
    /// `router>`
    User,
    /// `router#`
    Privileged,
}

/// What to answer when an input request is seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputResponse {
    Static(String),
    /// The device's enable secret, if one is known.
    EnableSecret,
}

/// An interactive prompt the shell answers automatically.
#[derive(Debug, Clone)]
pub struct InputRule {
    pub pattern: String,
    pub response: InputResponse,
    /// Keep the request text in command output.
    pub record: bool,
}

/// Static description of a platform's prompts, see [`crate::templates`].
#[derive(Debug, Clone, Default)]
pub struct PromptSpec {
    pub prompts: Vec<(PromptLevel, String)>,
    pub more: Vec<String>,
    pub errors: Vec<String>,
    pub ignore_errors: Vec<String>,
    pub inputs: Vec<InputRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Output,
    More,
    Error,
    Prompt(PromptLevel),
    Input(usize),
}

/// Leading carriage returns and backspace runs some IOS images emit while
/// redrawing the line.
pub static IGNORE_START_LINE: Lazy<Regex> =
    Lazy::new(
        || match Regex::new(r"^(\r+(\s+\r+)*)|(\u{8}+(\s+\u{8}+)*)") {
            Ok(re) => re,
            Err(err) => panic!("invalid IGNORE_START_LINE regex: {err}"),
        },
    );

pub struct PromptHandler {
    all_regex: RegexSet,
    /// Maps regex index in `all_regex` to what it detects.
    kinds: Vec<LineKind>,
    inputs: Vec<InputRule>,
    ignore_errors: Option<RegexSet>,
    enable_secret: Option<String>,
    level: Option<PromptLevel>,
    current_prompt: Option<String>,
    error_seen: bool,
}

impl PromptHandler {
    /// Compiles a prompt spec.
    ///
    /// Prompt patterns get an implicit `^\x00*\r?` prefix so NUL padding and
    /// a stray carriage return before the prompt do not defeat anchoring.
    pub fn new(spec: &PromptSpec) -> Result<PromptHandler, ConnectError> {
        let mut regexs: Vec<String> = Vec::new();
        let mut kinds = Vec::new();

        for pattern in &spec.more {
            regexs.push(pattern.clone());
            kinds.push(LineKind::More);
        }
        for pattern in &spec.errors {
            regexs.push(pattern.clone());
            kinds.push(LineKind::Error);
        }
        for (level, pattern) in &spec.prompts {
            regexs.push(format!(
                r"^\x00*\r{{0,1}}{}",
                pattern.trim_start_matches('^')
            ));
            kinds.push(LineKind::Prompt(*level));
        }
        for (idx, rule) in spec.inputs.iter().enumerate() {
            regexs.push(rule.pattern.clone());
            kinds.push(LineKind::Input(idx));
        }

        let all_regex = RegexSet::new(&regexs).map_err(|err| {
            ConnectError::InvalidPromptConfig(format!("failed to build prompt regex set: {err}"))
        })?;

        let ignore_errors = if spec.ignore_errors.is_empty() {
            None
        } else {
            Some(RegexSet::new(&spec.ignore_errors).map_err(|err| {
                ConnectError::InvalidPromptConfig(format!("invalid ignore_errors regex set: {err}"))
            })?)
        };

        Ok(Self {
            all_regex,
            kinds,
            inputs: spec.inputs.clone(),
            ignore_errors,
            enable_secret: None,
            level: None,
            current_prompt: None,
            error_seen: false,
        })
    }

    pub fn set_enable_secret(&mut self, secret: Option<String>) {
        self.enable_secret = secret;
    }

    fn classify(&self, line: &str) -> LineKind {
        // RegexSet reports matches in pattern order; the first wins.
        self.all_regex
            .matches(line)
            .into_iter()
            .next()
            .and_then(|idx| self.kinds.get(idx).copied())
            .unwrap_or(LineKind::Output)
    }

    /// Feeds one line of shell output and updates the state.
    pub fn read(&mut self, line: &str) {
        trace!("Read line: '{:?}'", line);
        let kind = self.classify(line);
        if kind == LineKind::Error && self.ignore_error(line) {
            trace!("Ignoring error line");
            return;
        }
        if let LineKind::Prompt(level) = kind {
            self.level = Some(level);
            self.current_prompt = Some(line.to_string());
        }
        if kind == LineKind::Error {
            self.error_seen = true;
        }
    }

    fn ignore_error(&self, line: &str) -> bool {
        self.ignore_errors
            .as_ref()
            .map(|set| set.is_match(line))
            .unwrap_or(false)
    }

    /// Returns the prompt level if `line` is a prompt.
    pub fn read_prompt(&self, line: &str) -> Option<PromptLevel> {
        match self.classify(line) {
            LineKind::Prompt(level) => Some(level),
            _ => None,
        }
    }

    /// Checks whether `line` asks for input and returns `(answer, record)`.
    ///
    /// Pager markers answer with a space and are never recorded.
    pub fn read_need_write(&self, line: &str) -> Option<(String, bool)> {
        match self.classify(line) {
            LineKind::More => Some((" ".to_string(), false)),
            LineKind::Input(idx) => {
                let rule = self.inputs.get(idx)?;
                match &rule.response {
                    InputResponse::Static(s) => Some((s.clone(), rule.record)),
                    InputResponse::EnableSecret => self
                        .enable_secret
                        .as_ref()
                        .map(|secret| (format!("{secret}\n"), rule.record)),
                }
            }
            _ => None,
        }
    }

    /// True if an error line was seen since the last [`reset_error`](Self::reset_error).
    pub fn error(&self) -> bool {
        self.error_seen
    }

    pub fn reset_error(&mut self) {
        self.error_seen = false;
    }

    /// Privilege level of the last prompt seen.
    pub fn level(&self) -> Option<PromptLevel> {
        self.level
    }

    pub fn current_prompt(&self) -> Option<&str> {
        self.current_prompt.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_test_handler() -> PromptHandler {
        let spec = PromptSpec {
            prompts: vec![
                (PromptLevel::Privileged, r"^dev#\s*$".to_string()),
                (PromptLevel::User, r"^dev>\s*$".to_string()),
            ],
            more: vec![r"^\s*--More--\s*$".to_string()],
            errors: vec![r"^% Invalid input.*".to_string(), r"^% .+".to_string()],
            ignore_errors: vec![r"^% benign".to_string()],
            inputs: vec![
                InputRule {
                    pattern: r"^Password:\s*$".to_string(),
                    response: InputResponse::EnableSecret,
                    record: false,
                },
                InputRule {
                    pattern: r"^\[confirm\]\s*$".to_string(),
                    response: InputResponse::Static("\n".to_string()),
                    record: true,
                },
            ],
        };
        PromptHandler::new(&spec).expect("test handler config should be valid")
    }

    #[test]
    fn error_state_is_detected_after_error_line() {
        let mut handler = build_test_handler();

        assert!(!handler.error());
        handler.read("% Invalid input detected at '^' marker.");
        assert!(handler.error());
        handler.reset_error();
        assert!(!handler.error());
    }

    #[test]
    fn ignore_error_pattern_does_not_flag_error() {
        let mut handler = build_test_handler();

        handler.read("% benign warning");
        assert!(!handler.error());
    }

    #[test]
    fn prompt_line_updates_level_and_prompt() {
        let mut handler = build_test_handler();
        assert_eq!(handler.current_prompt(), None);

        handler.read("dev>");
        assert_eq!(handler.level(), Some(PromptLevel::User));
        handler.read("dev#");
        assert_eq!(handler.level(), Some(PromptLevel::Privileged));
        assert_eq!(handler.current_prompt(), Some("dev#"));
    }

    #[test]
    fn prompt_tolerates_leading_nul_and_carriage_return() {
        let handler = build_test_handler();
        assert_eq!(handler.read_prompt("\0\0\rdev#"), Some(PromptLevel::Privileged));
        assert_eq!(handler.read_prompt("interface dev#1"), None);
    }

    #[test]
    fn read_need_write_answers_pager_and_inputs() {
        let mut handler = build_test_handler();

        assert_eq!(handler.read_need_write(" --More-- "), Some((" ".to_string(), false)));
        assert_eq!(handler.read_need_write("Password:"), None);

        handler.set_enable_secret(Some("s3cret".to_string()));
        assert_eq!(
            handler.read_need_write("Password:"),
            Some(("s3cret\n".to_string(), false))
        );
        assert_eq!(
            handler.read_need_write("[confirm]"),
            Some(("\n".to_string(), true))
        );
        assert_eq!(handler.read_need_write("plain output"), None);
    }

    #[test]
    fn invalid_regex_returns_config_error() {
        let spec = PromptSpec {
            prompts: vec![(PromptLevel::User, "(".to_string())],
            ..Default::default()
        };
        assert!(matches!(
            PromptHandler::new(&spec),
            Err(ConnectError::InvalidPromptConfig(_))
        ));
    }

    #[test]
    fn ignore_start_line_strips_redraw_noise() {
        assert_eq!(IGNORE_START_LINE.replace("\r\rGi0/0 up", ""), "Gi0/0 up");
        assert_eq!(IGNORE_START_LINE.replace("\u{8}\u{8}text", ""), "text");
    }
}
